//! WebFinger and NodeInfo
//!
//! Used to discover ActivityPub actor URIs from addresses, and to describe
//! this server to peers.

use serde::{Deserialize, Serialize};

use super::remote::{self, ACTIVITY_JSON, JRD_JSON};
use crate::error::AppError;

pub const NODEINFO_SCHEMA_PREFIX: &str = "http://nodeinfo.diaspora.software/ns/schema/";
pub const NODEINFO_VERSIONS: [&str; 2] = ["2.0", "2.1"];

/// A parsed `acct:user@domain` resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcctResource {
    pub username: String,
    pub domain: String,
}

impl AcctResource {
    /// Parse a WebFinger resource strictly.
    ///
    /// The `acct:` scheme is required, as are exactly one `@` and non-empty
    /// user and domain parts.
    ///
    /// # Errors
    /// `Validation` for anything else
    pub fn parse(resource: &str) -> Result<Self, AppError> {
        let acct = resource
            .strip_prefix("acct:")
            .ok_or_else(|| AppError::Validation("Resource must start with 'acct:'".to_string()))?;

        let (username, domain) = acct
            .split_once('@')
            .ok_or_else(|| AppError::Validation("Invalid acct format".to_string()))?;

        if username.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(AppError::Validation("Invalid acct format".to_string()));
        }

        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(AppError::Validation(
                "Invalid characters in acct username".to_string(),
            ));
        }

        if domain
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#'))
        {
            return Err(AppError::Validation(
                "Invalid characters in acct domain".to_string(),
            ));
        }

        Ok(Self {
            username: username.to_string(),
            domain: domain.to_ascii_lowercase(),
        })
    }

    pub fn to_resource(&self) -> String {
        format!("acct:{}@{}", self.username, self.domain)
    }
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

impl WebFingerResponse {
    /// href of the `self` link carrying an ActivityPub media type
    pub fn actor_uri(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link.link_type.as_deref().is_some_and(|t| {
                        t == ACTIVITY_JSON
                            || (t.starts_with("application/ld+json")
                                && t.contains("activitystreams"))
                    })
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `base_url` - Instance base URL (includes protocol)
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    base_url: &str,
) -> WebFingerResponse {
    let base_url = base_url.trim_end_matches('/');
    let actor_url = format!("{}/users/{}", base_url, username);
    let profile_url = format!("{}/@{}", base_url, username);

    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_url.clone(), profile_url.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_url),
                template: None,
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(profile_url),
                template: None,
            },
        ],
    }
}

/// Resolve an address to its ActivityPub actor URI
///
/// Queries `/.well-known/webfinger` on the account's own domain.
/// The scheme follows the local server's (`http` only in development).
///
/// # Errors
/// `UnreachableActor` if the lookup fails or advertises no ActivityPub actor
pub async fn resolve_webfinger(
    acct: &AcctResource,
    http_client: &reqwest::Client,
    scheme: &str,
    allow_private: bool,
) -> Result<String, AppError> {
    let url = format!(
        "{}://{}/.well-known/webfinger?resource={}",
        scheme,
        acct.domain,
        urlencoding::encode(&acct.to_resource())
    );

    let document = remote::fetch_json(http_client, &url, JRD_JSON, allow_private).await?;
    let response: WebFingerResponse = serde_json::from_value(document).map_err(|e| {
        AppError::UnreachableActor(format!("Malformed WebFinger response: {}", e))
    })?;

    response.actor_uri().map(str::to_string).ok_or_else(|| {
        AppError::UnreachableActor(format!(
            "No ActivityPub actor advertised for {}",
            acct.to_resource()
        ))
    })
}

// =============================================================================
// NodeInfo
// =============================================================================

/// `/.well-known/nodeinfo` response
#[derive(Debug, Serialize)]
pub struct NodeInfoWellKnown {
    pub links: Vec<NodeInfoLink>,
}

#[derive(Debug, Serialize)]
pub struct NodeInfoLink {
    pub rel: String,
    pub href: String,
}

/// NodeInfo 2.0/2.1 document
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: String,
    pub software: NodeInfoSoftware,
    pub protocols: Vec<String>,
    pub services: NodeInfoServices,
    pub usage: NodeInfoUsage,
    pub open_registrations: bool,
    pub metadata: NodeInfoMetadata,
}

#[derive(Debug, Serialize)]
pub struct NodeInfoSoftware {
    pub name: String,
    pub version: String,
    /// Only defined from 2.1 on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct NodeInfoServices {
    pub inbound: Vec<String>,
    pub outbound: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoUsage {
    pub users: NodeInfoUsers,
    pub local_posts: u64,
}

#[derive(Debug, Serialize)]
pub struct NodeInfoUsers {
    pub total: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoMetadata {
    pub node_name: String,
    pub node_description: String,
}

/// Links document pointing at every supported NodeInfo version
pub fn nodeinfo_links(base_url: &str) -> NodeInfoWellKnown {
    let base_url = base_url.trim_end_matches('/');
    NodeInfoWellKnown {
        links: NODEINFO_VERSIONS
            .iter()
            .map(|version| NodeInfoLink {
                rel: format!("{}{}", NODEINFO_SCHEMA_PREFIX, version),
                href: format!("{}/nodeinfo/{}", base_url, version),
            })
            .collect(),
    }
}

/// Build the NodeInfo document for `version`
///
/// # Returns
/// `None` for versions this server does not publish
pub fn build_nodeinfo(
    version: &str,
    instance_title: &str,
    instance_description: &str,
    total_users: u64,
    local_posts: u64,
) -> Option<NodeInfo> {
    if !NODEINFO_VERSIONS.contains(&version) {
        return None;
    }

    let repository = (version != "2.0")
        .then(|| env!("CARGO_PKG_REPOSITORY").to_string())
        .filter(|repo| !repo.is_empty());

    Some(NodeInfo {
        version: version.to_string(),
        software: NodeInfoSoftware {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            repository,
        },
        protocols: vec!["activitypub".to_string()],
        services: NodeInfoServices::default(),
        usage: NodeInfoUsage {
            users: NodeInfoUsers { total: total_users },
            local_posts,
        },
        open_registrations: false,
        metadata: NodeInfoMetadata {
            node_name: instance_title.to_string(),
            node_description: instance_description.to_string(),
        },
    })
}
