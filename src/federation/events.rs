//! Content events from the publishing platform
//!
//! The platform announces new posts on a [`ContentFeed`]; the federation
//! layer subscribes and turns each one into an outbound `Create`.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::actor::ActorDirectory;
use super::outbox::{NewContent, OutboxLog};

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ContentEvent {
    /// A post by `username` went public
    Published { username: String, content: NewContent },
}

/// Broadcast feed of content events.
#[derive(Clone)]
pub struct ContentFeed {
    sender: broadcast::Sender<ContentEvent>,
}

impl Default for ContentFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self { sender }
    }

    /// Register a listener. Dropping the returned handle unregisters it.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Announce an event.
    ///
    /// # Returns
    /// Number of listeners that will see it
    pub fn publish(&self, event: ContentEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A registered listener on a [`ContentFeed`]
pub struct Subscription {
    receiver: broadcast::Receiver<ContentEvent>,
}

impl Subscription {
    /// Wait for the next event.
    ///
    /// Returns `None` once every feed handle has been dropped. Events missed
    /// by a slow listener are logged and skipped.
    pub async fn recv(&mut self) -> Option<ContentEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Content listener lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Spawn the listener that federates published content.
///
/// Runs until the feed closes.
pub fn spawn_publisher(
    mut subscription: Subscription,
    directory: Arc<ActorDirectory>,
    outbox: Arc<OutboxLog>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let ContentEvent::Published { username, content } = event;

            let actor = match directory.get_local_actor(&username).await {
                Ok(actor) => actor,
                Err(e) => {
                    tracing::error!(username = %username, error = %e, "Cannot publish for unknown author");
                    continue;
                }
            };

            match outbox.publish_note(&actor, content).await {
                Ok((create, delivery)) => {
                    let activity_id = create["id"].as_str().unwrap_or_default().to_string();
                    tokio::spawn(async move {
                        match delivery.await {
                            Ok(Ok(report)) => tracing::info!(
                                activity_id = %activity_id,
                                succeeded = report.succeeded(),
                                failed = report.failed(),
                                "Content federated"
                            ),
                            Ok(Err(e)) => {
                                tracing::error!(activity_id = %activity_id, error = %e, "Fan-out failed")
                            }
                            Err(e) => {
                                tracing::error!(activity_id = %activity_id, error = %e, "Fan-out task panicked")
                            }
                        }
                    });
                }
                Err(e) => tracing::error!(username = %username, error = %e, "Failed to publish content"),
            }
        }
        tracing::info!("Content feed closed");
    })
}
