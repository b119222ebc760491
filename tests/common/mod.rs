//! Shared scaffolding for the end-to-end scenario tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use race_core::bus::BusEvent;
use race_core::entity::{Entity, EntityContext};
use race_core::error::RaceError;

/// An Entity that appends its name to a shared log on `initialize` and on
/// `start` — enough to assert Supervisor ordering (startup order == config
/// declaration order, reverse on shutdown) without any message traffic.
pub struct RecordingEntity {
    pub name: String,
    pub log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Entity for RecordingEntity {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, _ctx: &EntityContext) -> Result<(), RaceError> {
        self.log.lock().unwrap().push(self.name.clone());
        Ok(())
    }

    async fn start(&mut self, _ctx: &EntityContext) -> Result<(), RaceError> {
        self.log.lock().unwrap().push(self.name.clone());
        Ok(())
    }

    async fn terminate(&mut self, _ctx: &EntityContext) -> Result<(), RaceError> {
        self.log.lock().unwrap().push(format!("{}:term", self.name));
        Ok(())
    }
}

/// Publishes a fixed sequence of `i32` payloads to a channel, one per call
/// to `start`, in order — the producer side of S2/S3/S6.
pub struct Publisher {
    pub name: String,
    pub channel: String,
    pub values: Vec<i32>,
}

#[async_trait]
impl Entity for Publisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, ctx: &EntityContext) -> Result<(), RaceError> {
        for v in &self.values {
            ctx.publish(self.channel.as_str(), Arc::new(*v)).await?;
        }
        Ok(())
    }
}

/// Appends every received `i32` payload (tagged with its source channel)
/// to a shared log, in arrival order — the consumer side of S2/S3/S6.
pub struct Recorder {
    pub name: String,
    pub received: Arc<Mutex<Vec<(String, i32)>>>,
}

#[async_trait]
impl Entity for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_message(&mut self, _ctx: &EntityContext, event: BusEvent) {
        if let Some(v) = event.payload.downcast_ref::<i32>() {
            self.received.lock().unwrap().push((event.channel.to_string(), *v));
        }
    }
}
