//! ChannelTopic coordinator — transitive on-demand flow control layered
//! over the Bus.
//!
//! A Provider's production only runs while somebody holds a demand record
//! for its ChannelTopic; a Transitive provider chains that by issuing its
//! own request upstream the same way a Subscriber does. The protocol itself
//! — Request broadcast, point-to-point Response, Accept/Reject, Release —
//! is plain request/reply over `AddressableHandle`s, the same primitive
//! `EntityHandle::send_lifecycle` uses for Supervisor control, just applied
//! here to a different message shape.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bus::AddressableHandle;
use crate::channel::Channel;
use crate::error::RaceError;

/// A channel plus an optional application-defined discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelTopic {
    pub channel: Channel,
    pub topic_key: Option<String>,
}

impl ChannelTopic {
    pub fn new(channel: impl Into<Channel>, topic_key: Option<String>) -> Self {
        ChannelTopic {
            channel: channel.into(),
            topic_key,
        }
    }

    pub fn whole(channel: impl Into<Channel>) -> Self {
        ChannelTopic::new(channel, None)
    }
}

/// The Provider role. A Transitive provider is simply a `Provider`
/// whose `on_activate`/`on_deactivate` issue their own
/// `TopicCoordinator::request`/`release` calls upstream before returning.
#[async_trait]
pub trait Provider: Send + Sync {
    fn handle(&self) -> AddressableHandle;

    /// Whether this Provider is willing to serve `topic`.
    async fn can_serve(&self, topic: &ChannelTopic) -> bool;

    /// Called when the first demand record for `topic` is created —
    /// production should begin. A Transitive provider requests its own
    /// upstream ChannelTopic here and only returns once that upstream
    /// Accept completes.
    async fn on_activate(&self, topic: &ChannelTopic) -> Result<(), RaceError> {
        let _ = topic;
        Ok(())
    }

    /// Called when the last demand record for `topic` is released —
    /// production should stop.
    async fn on_deactivate(&self, topic: &ChannelTopic) {
        let _ = topic;
    }
}

/// Coordinates Request/Response/Accept-Reject/Release across every
/// registered Provider in a Runtime.
pub struct TopicCoordinator {
    providers: Mutex<Vec<Arc<dyn Provider>>>,
    /// (provider, topic) -> consumers holding a demand record.
    demand: Mutex<HashMap<(AddressableHandle, ChannelTopic), HashSet<AddressableHandle>>>,
    /// consumer -> (provider, topic) it is currently granted, for Release
    /// and for termination cleanup.
    grants: Mutex<HashMap<AddressableHandle, HashSet<(AddressableHandle, ChannelTopic)>>>,
    /// subscriber -> provider edges, used for upstream cycle detection.
    edges: Mutex<HashMap<AddressableHandle, HashSet<AddressableHandle>>>,
    collection_window: Duration,
}

impl TopicCoordinator {
    pub fn new() -> Self {
        TopicCoordinator {
            providers: Mutex::new(Vec::new()),
            demand: Mutex::new(HashMap::new()),
            grants: Mutex::new(HashMap::new()),
            edges: Mutex::new(HashMap::new()),
            collection_window: Duration::from_millis(50),
        }
    }

    pub fn with_collection_window(mut self, window: Duration) -> Self {
        self.collection_window = window;
        self
    }

    /// Opt a Provider in to answering Requests. Providers are asked
    /// `can_serve` in registration order; the default `selectResponse`
    /// policy is first-responder-wins, so registration order is the
    /// effective priority order.
    pub async fn register_provider(&self, provider: Arc<dyn Provider>) {
        self.providers.lock().await.push(provider);
    }

    /// Run the four-step protocol for `subscriber` requesting `topic`.
    /// Returns the accepted Provider's handle.
    pub async fn request(
        &self,
        subscriber: AddressableHandle,
        topic: ChannelTopic,
    ) -> Result<AddressableHandle, RaceError> {
        let candidates: Vec<Arc<dyn Provider>> = self.providers.lock().await.clone();

        let deadline = tokio::time::Instant::now() + self.collection_window;
        let mut responders = Vec::new();
        for provider in candidates {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            if provider.can_serve(&topic).await {
                responders.push(provider);
            }
        }

        let chosen = responders.into_iter().next().ok_or_else(|| {
            RaceError::TopicProtocol(format!("no provider accepted request for {:?}", topic))
        })?;

        if self.would_cycle(&subscriber, &chosen.handle()).await {
            return Err(RaceError::TopicProtocol(format!(
                "rejecting request for {:?}: would create a ChannelTopic cycle",
                topic
            )));
        }

        self.edges
            .lock()
            .await
            .entry(subscriber.clone())
            .or_default()
            .insert(chosen.handle());

        let key = (chosen.handle(), topic.clone());
        let is_first = {
            let mut demand = self.demand.lock().await;
            let set = demand.entry(key.clone()).or_default();
            let was_empty = set.is_empty();
            set.insert(subscriber.clone());
            was_empty
        };

        if is_first {
            if let Err(e) = chosen.on_activate(&topic).await {
                // Roll back: this subscriber never actually got an Accept.
                let mut demand = self.demand.lock().await;
                if let Some(set) = demand.get_mut(&key) {
                    set.remove(&subscriber);
                }
                return Err(e);
            }
        }

        self.grants
            .lock()
            .await
            .entry(subscriber)
            .or_default()
            .insert(key);

        debug!(provider = chosen.handle().name(), ?topic, "channel topic accepted");
        Ok(chosen.handle())
    }

    /// Release a previously accepted ChannelTopic. Idempotent: releasing
    /// something never granted is a no-op.
    pub async fn release(&self, subscriber: &AddressableHandle, topic: &ChannelTopic) {
        let providers: Vec<AddressableHandle> = {
            let demand = self.demand.lock().await;
            demand
                .keys()
                .filter(|(_, t)| t == topic)
                .map(|(p, _)| p.clone())
                .collect()
        };

        for provider_handle in providers {
            let key = (provider_handle.clone(), topic.clone());
            let became_empty = {
                let mut demand = self.demand.lock().await;
                if let Some(set) = demand.get_mut(&key) {
                    set.remove(subscriber);
                    set.is_empty()
                } else {
                    false
                }
            };

            if let Some(grants) = self.grants.lock().await.get_mut(subscriber) {
                grants.remove(&key);
            }
            self.edges
                .lock()
                .await
                .get_mut(subscriber)
                .map(|set| set.remove(&provider_handle));

            if became_empty {
                self.demand.lock().await.remove(&key);
                if let Some(provider) = self.find_provider(&provider_handle).await {
                    provider.on_deactivate(topic).await;
                }
            }
        }
    }

    /// Release every demand record held by `handle` and revoke every grant
    /// where `handle` is the Provider — called on Entity termination.
    pub async fn on_entity_terminated(&self, handle: &AddressableHandle) {
        let held: Vec<(AddressableHandle, ChannelTopic)> = self
            .grants
            .lock()
            .await
            .remove(handle)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for (provider, topic) in held {
            self.release_one(handle, &provider, &topic).await;
        }

        let revoked: Vec<ChannelTopic> = {
            let mut demand = self.demand.lock().await;
            let keys: Vec<_> = demand.keys().filter(|(p, _)| p == handle).cloned().collect();
            for k in &keys {
                demand.remove(k);
            }
            keys.into_iter().map(|(_, t)| t).collect()
        };
        if !revoked.is_empty() {
            warn!(provider = handle.name(), count = revoked.len(), "provider terminated with outstanding grants, revoking");
        }
        self.providers.lock().await.retain(|p| p.handle() != *handle);
        self.edges.lock().await.remove(handle);
    }

    async fn release_one(&self, subscriber: &AddressableHandle, provider_handle: &AddressableHandle, topic: &ChannelTopic) {
        let key = (provider_handle.clone(), topic.clone());
        let became_empty = {
            let mut demand = self.demand.lock().await;
            if let Some(set) = demand.get_mut(&key) {
                set.remove(subscriber);
                set.is_empty()
            } else {
                false
            }
        };
        if became_empty {
            self.demand.lock().await.remove(&key);
            if let Some(provider) = self.find_provider(provider_handle).await {
                provider.on_deactivate(topic).await;
            }
        }
    }

    async fn find_provider(&self, handle: &AddressableHandle) -> Option<Arc<dyn Provider>> {
        self.providers
            .lock()
            .await
            .iter()
            .find(|p| p.handle() == *handle)
            .cloned()
    }

    /// Whether granting `subscriber -> provider` would close a cycle in the
    /// existing upstream-demand graph (A upstream of B upstream of A).
    async fn would_cycle(&self, subscriber: &AddressableHandle, provider: &AddressableHandle) -> bool {
        if subscriber == provider {
            return true;
        }
        let edges = self.edges.lock().await;
        let mut stack = vec![provider.clone()];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if &node == subscriber {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(next) = edges.get(&node) {
                stack.extend(next.iter().cloned());
            }
        }
        false
    }

    pub async fn demand_count(&self, provider: &AddressableHandle, topic: &ChannelTopic) -> usize {
        self.demand
            .lock()
            .await
            .get(&(provider.clone(), topic.clone()))
            .map_or(0, |s| s.len())
    }
}

impl Default for TopicCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
