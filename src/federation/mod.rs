//! ActivityPub federation module
//!
//! Handles:
//! - Key generation, signing and verification
//! - Local and remote actor resolution
//! - WebFinger and NodeInfo
//! - HTTP Signatures
//! - Follower bookkeeping
//! - Activity delivery (outbox fan-out)
//! - Inbox processing
//! - The activity log and content events

pub mod actor;
pub mod delivery;
pub mod events;
pub mod follow;
pub mod inbox;
pub mod keys;
pub mod outbox;
pub mod remote;
pub mod signature;
pub mod webfinger;

pub use actor::{ActorDirectory, parse_actor_document, render_actor_document};
pub use delivery::{
    DeliveryReport, DeliveryResult, DeliveryService, RetryPolicy, SentActivity, builder,
};
pub use events::{ContentEvent, ContentFeed, Subscription, spawn_publisher};
pub use follow::{FollowRegistry, FollowerPage, NewFollower};
pub use inbox::{InboundActivity, InboxOutcome, InboxProcessor};
pub use keys::{KeyPair, KeyStore};
pub use outbox::{NewContent, OutboxLog, OutboxPage};
pub use signature::{IncomingRequest, SignatureService, SignedHeaders, VerifiedSignature};
pub use webfinger::{AcctResource, WebFingerResponse, generate_webfinger_response, resolve_webfinger};
