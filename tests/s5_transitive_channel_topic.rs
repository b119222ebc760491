//! S5 — A transitive Provider (one that is itself a consumer of an upstream
//! ChannelTopic) requests upstream exactly once no matter how many
//! downstream subscribers it serves, and activates upstream before it can
//! Accept any downstream request.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use race_core::bus::{inbox::OverflowPolicy, local_handle, AddressableHandle};
use race_core::channel::Channel;
use race_core::error::RaceError;
use race_core::topic::{ChannelTopic, Provider, TopicCoordinator};

struct UpstreamProvider {
    handle: AddressableHandle,
    activations: Arc<AtomicU32>,
    order: Arc<std::sync::Mutex<Vec<String>>>,
}

#[async_trait]
impl Provider for UpstreamProvider {
    fn handle(&self) -> AddressableHandle {
        self.handle.clone()
    }

    async fn can_serve(&self, topic: &ChannelTopic) -> bool {
        topic.channel.as_str() == "/upstream"
    }

    async fn on_activate(&self, _topic: &ChannelTopic) -> Result<(), RaceError> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push("upstream:activate".into());
        Ok(())
    }

    async fn on_deactivate(&self, _topic: &ChannelTopic) {
        self.order.lock().unwrap().push("upstream:deactivate".into());
    }
}

/// Serves `/downstream` but is itself a consumer of `/upstream` — requests
/// it the first time it activates and releases it when it deactivates,
/// making it a transitive provider with no dedicated trait of its own.
struct MidProvider {
    handle: AddressableHandle,
    coordinator: Arc<TopicCoordinator>,
    upstream: ChannelTopic,
    order: Arc<std::sync::Mutex<Vec<String>>>,
}

#[async_trait]
impl Provider for MidProvider {
    fn handle(&self) -> AddressableHandle {
        self.handle.clone()
    }

    async fn can_serve(&self, topic: &ChannelTopic) -> bool {
        topic.channel.as_str() == "/downstream"
    }

    async fn on_activate(&self, _topic: &ChannelTopic) -> Result<(), RaceError> {
        self.order.lock().unwrap().push("mid:requesting-upstream".into());
        self.coordinator.request(self.handle.clone(), self.upstream.clone()).await?;
        self.order.lock().unwrap().push("mid:activate".into());
        Ok(())
    }

    async fn on_deactivate(&self, _topic: &ChannelTopic) {
        self.coordinator.release(&self.handle, &self.upstream).await;
        self.order.lock().unwrap().push("mid:deactivate".into());
    }
}

#[tokio::test]
async fn transitive_provider_activates_upstream_exactly_once() {
    let coordinator = Arc::new(TopicCoordinator::new());
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let (upstream_handle, _i1) = local_handle("pr1", 4, OverflowPolicy::DropOldest);
    let activations = Arc::new(AtomicU32::new(0));
    let upstream = Arc::new(UpstreamProvider {
        handle: upstream_handle.clone(),
        activations: activations.clone(),
        order: order.clone(),
    });
    coordinator.register_provider(upstream).await;

    let (mid_handle, _i2) = local_handle("pr2", 4, OverflowPolicy::DropOldest);
    let upstream_topic = ChannelTopic::whole(Channel::new("/upstream"));
    let mid = Arc::new(MidProvider {
        handle: mid_handle.clone(),
        coordinator: coordinator.clone(),
        upstream: upstream_topic.clone(),
        order: order.clone(),
    });
    coordinator.register_provider(mid).await;

    let downstream_topic = ChannelTopic::whole(Channel::new("/downstream"));

    let (sub1, _s1) = local_handle("sub1", 4, OverflowPolicy::DropOldest);
    let (sub2, _s2) = local_handle("sub2", 4, OverflowPolicy::DropOldest);

    let accepted1 = coordinator.request(sub1.clone(), downstream_topic.clone()).await.unwrap();
    assert_eq!(accepted1, mid_handle);
    assert_eq!(activations.load(Ordering::SeqCst), 1, "upstream activates on the first downstream request");

    let accepted2 = coordinator.request(sub2.clone(), downstream_topic.clone()).await.unwrap();
    assert_eq!(accepted2, mid_handle);
    assert_eq!(activations.load(Ordering::SeqCst), 1, "a second downstream subscriber does not reactivate upstream");

    let log_after_first_accept = order.lock().unwrap().clone();
    assert_eq!(
        log_after_first_accept,
        vec!["mid:requesting-upstream", "upstream:activate", "mid:activate"],
        "mid must hold the upstream Accept before it can Accept downstream"
    );

    coordinator.release(&sub1, &downstream_topic).await;
    assert_eq!(activations.load(Ordering::SeqCst), 1, "one remaining downstream subscriber keeps upstream active");

    coordinator.release(&sub2, &downstream_topic).await;
    let final_log = order.lock().unwrap().clone();
    assert_eq!(
        final_log,
        vec![
            "mid:requesting-upstream",
            "upstream:activate",
            "mid:activate",
            "mid:deactivate",
            "upstream:deactivate",
        ],
        "mid releases upstream only after its last downstream subscriber is gone"
    );
}

#[tokio::test]
async fn a_cycle_through_the_upstream_edge_is_rejected() {
    let coordinator = Arc::new(TopicCoordinator::new());
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let (pr1_handle, _i1) = local_handle("pr1", 4, OverflowPolicy::DropOldest);
    let activations = Arc::new(AtomicU32::new(0));
    let pr1 = Arc::new(UpstreamProvider {
        handle: pr1_handle.clone(),
        activations,
        order: order.clone(),
    });
    coordinator.register_provider(pr1).await;

    let (pr2_handle, _i2) = local_handle("pr2", 4, OverflowPolicy::DropOldest);
    let upstream_topic = ChannelTopic::whole(Channel::new("/upstream"));
    let pr2 = Arc::new(MidProvider {
        handle: pr2_handle.clone(),
        coordinator: coordinator.clone(),
        upstream: upstream_topic.clone(),
        order: order.clone(),
    });
    coordinator.register_provider(pr2).await;

    let downstream_topic = ChannelTopic::whole(Channel::new("/downstream"));
    let (sub, _s) = local_handle("sub", 4, OverflowPolicy::DropOldest);
    coordinator.request(sub, downstream_topic.clone()).await.unwrap();

    // pr1 now requesting `/downstream` from pr2 would close pr1 -> pr2 -> pr1.
    let err = coordinator.request(pr1_handle, downstream_topic).await.unwrap_err();
    assert!(matches!(err, race_core::error::RaceError::TopicProtocol(_)));
}
