use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Load a JSON schema from a file
pub fn load_schema(schema_path: &Path) -> JSONSchema {
    let schema_content = fs::read_to_string(schema_path)
        .unwrap_or_else(|_| panic!("Failed to read schema file: {}", schema_path.display()));

    let schema_json: Value = serde_json::from_str(&schema_content)
        .unwrap_or_else(|_| panic!("Failed to parse schema JSON: {}", schema_path.display()));

    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_json)
        .expect("Failed to compile schema")
}

/// Validate a JSON value against a schema
pub fn validate_against_schema(data: &Value, schema: &JSONSchema) -> Result<(), Vec<String>> {
    match schema.validate(data) {
        Ok(_) => Ok(()),
        Err(errors) => {
            let error_messages: Vec<String> = errors
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect();
            Err(error_messages)
        }
    }
}

/// Load schema from tests/schemas directory
pub fn load_test_schema(schema_name: &str) -> JSONSchema {
    let schema_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/schemas")
        .join(format!("{}.json", schema_name));
    load_schema(&schema_path)
}

/// Panic with every violation and the offending document
pub fn assert_matches_schema(data: &Value, schema_name: &str) {
    let schema = load_test_schema(schema_name);
    if let Err(errors) = validate_against_schema(data, &schema) {
        eprintln!("✗ {} schema validation failed:", schema_name);
        for error in &errors {
            eprintln!("  - {}", error);
        }
        eprintln!(
            "\nActual response:\n{}",
            serde_json::to_string_pretty(data).unwrap()
        );
        panic!("Schema validation failed with {} errors", errors.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_actor_schema_requires_public_key() {
        let schema = load_test_schema("actor");

        let mut actor = json!({
            "@context": ["https://www.w3.org/ns/activitystreams"],
            "id": "https://example.com/users/alice",
            "type": "Person",
            "preferredUsername": "alice",
            "inbox": "https://example.com/users/alice/inbox",
            "outbox": "https://example.com/users/alice/outbox",
            "followers": "https://example.com/users/alice/followers",
            "following": "https://example.com/users/alice/following",
            "publicKey": {
                "id": "https://example.com/users/alice#main-key",
                "owner": "https://example.com/users/alice",
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\n...\n-----END PUBLIC KEY-----\n"
            }
        });
        assert!(validate_against_schema(&actor, &schema).is_ok());

        actor.as_object_mut().unwrap().remove("publicKey");
        assert!(validate_against_schema(&actor, &schema).is_err());
    }
}
