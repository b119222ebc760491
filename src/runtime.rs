//! Runtime — the per-process aggregate: Clock, Bus, Supervisor, Entities,
//! Remote connector, and the configuration snapshot they were built from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::inbox::OverflowPolicy;
use crate::bus::{AddressableHandle, Bus, BusMetricsSnapshot};
use crate::channel::Pattern;
use crate::clock::Clock;
use crate::config::{Config, EntitySpec};
use crate::entity::{spawn_with_subscriptions, Entity, EntityHandle, LifecycleCommand};
use crate::error::RaceError;
use crate::remote::client::{RemoteEntity, RemoteLink};
use crate::remote::{remote_sender_handle, OutboundLink, RuntimeUri};
use crate::supervisor::{ManagedEntity, Supervisor};
use crate::topic::TopicCoordinator;

const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Builds a concrete [`Entity`] from its declared spec. Registered against
/// an `implementation` identifier string, the way the config's implementation
/// identifier field is resolved at build time.
pub type EntityFactory = Arc<dyn Fn(&EntitySpec) -> Result<Box<dyn Entity>, RaceError> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeMetricsSnapshot {
    pub bus: BusMetricsSnapshot,
}

/// Exactly one per process. Owns every component this crate exposes and
/// exposes the Runtime-level start/pause/resume/shutdown surface the CLI
/// driver and embedding applications call.
pub struct Runtime {
    pub clock: Clock,
    pub bus: Arc<Bus>,
    pub topics: Arc<TopicCoordinator>,
    supervisor: Supervisor,
    entities_by_name: Mutex<HashMap<String, AddressableHandle>>,
    /// Entities instantiated on this process by an inbound `Instantiate`
    /// request (the Start deployment mode's server side), keyed by the name
    /// the requesting peer used. Not present in `supervisor` — a dynamically
    /// instantiated Entity isn't part of this process's own declared boot
    /// order, only reachable by name once it exists.
    dynamic_entities: Mutex<HashMap<String, Arc<EntityHandle>>>,
    registry: HashMap<String, EntityFactory>,
    config: Config,
    shutdown: CancellationToken,
}

impl Runtime {
    /// Construct a Runtime from a resolved [`Config`], instantiating every
    /// declared Entity in order via `registry`. Fails fast (before any
    /// lifecycle command is sent) if an Entity names an unregistered
    /// implementation or a `readFrom` pattern fails to parse.
    ///
    /// An Entity declared with `remote_uri` is not instantiated locally:
    /// a proxy `AddressableHandle` is registered under its name and the
    /// Supervisor resolves the real Entity (Lookup, falling back to Start)
    /// against the named peer during `Initialize`.
    pub fn build(config: Config, registry: &HashMap<String, EntityFactory>) -> Result<Runtime, RaceError> {
        let shutdown = CancellationToken::new();
        let clock = Clock::spawn(shutdown.clone());
        let bus = Arc::new(Bus::new());
        let topics = Arc::new(TopicCoordinator::new());
        let local_uri = local_runtime_uri(&config);

        let mut managed: Vec<ManagedEntity> = Vec::with_capacity(config.entities.len());
        let mut entities_by_name = HashMap::with_capacity(config.entities.len());
        let mut remote_links: HashMap<String, Arc<RemoteLink>> = HashMap::new();

        for spec in &config.entities {
            if let Some(remote_uri) = &spec.remote_uri {
                let peer_uri: RuntimeUri = remote_uri.parse()?;
                let peer_key = format!("{}:{}", peer_uri.host, peer_uri.port);
                let link = match remote_links.get(&peer_key) {
                    Some(link) => link.clone(),
                    None => {
                        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                        let outbound = OutboundLink::spawn(peer_uri.clone(), local_uri.clone(), inbound_tx, shutdown.clone());
                        let link = RemoteLink::wrap(outbound, inbound_rx);
                        remote_links.insert(peer_key, link.clone());
                        link
                    }
                };

                let proxy = remote_sender_handle(remote_uri, &spec.name);
                entities_by_name.insert(spec.name.clone(), proxy);

                let options_json = serde_json::to_string(&spec.options)
                    .map_err(|e| RaceError::config(format!("entity {}: options not serializable: {e}", spec.name)))?;
                managed.push(ManagedEntity::Remote(RemoteEntity::new(
                    spec.name.clone(),
                    spec.implementation.clone(),
                    options_json,
                    link,
                )));
                continue;
            }

            let factory = registry
                .get(&spec.implementation)
                .ok_or_else(|| RaceError::config(format!("unknown entity implementation: {}", spec.implementation)))?;
            let entity = factory(spec)?;

            let patterns: Vec<Pattern> = spec
                .read_from
                .iter()
                .map(|p| Pattern::parse(p.clone()))
                .collect::<Result<_, _>>()?;

            let handle = spawn_with_subscriptions(
                entity,
                bus.clone(),
                clock.clone(),
                DEFAULT_INBOX_CAPACITY,
                OverflowPolicy::DropOldest,
                patterns,
                shutdown.clone(),
            );
            entities_by_name.insert(spec.name.clone(), handle.addressable.clone());
            managed.push(ManagedEntity::Local(handle));
        }

        let supervisor = Supervisor::new(managed);

        Ok(Runtime {
            clock,
            bus,
            topics,
            supervisor,
            entities_by_name: Mutex::new(entities_by_name),
            dynamic_entities: Mutex::new(HashMap::new()),
            registry: registry.clone(),
            config,
            shutdown,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn entity_handle(&self, name: &str) -> Option<AddressableHandle> {
        self.entities_by_name.lock().unwrap().get(name).cloned()
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.supervisor.entity_names()
    }

    /// Instantiate an Entity by name on this process from its own registry —
    /// the server side of the Start deployment mode, driven by an inbound
    /// `Instantiate` request from a peer that declared this process as
    /// `remote_uri` for the name. A second request for an already-resolved
    /// name is a no-op.
    pub async fn remote_instantiate(&self, name: &str, implementation: &str, options_json: &str) -> Result<(), RaceError> {
        if self.entities_by_name.lock().unwrap().contains_key(name) {
            return Ok(());
        }

        let factory = self
            .registry
            .get(implementation)
            .ok_or_else(|| RaceError::config(format!("unknown entity implementation: {implementation}")))?;
        let options: toml::Value = serde_json::from_str(options_json)
            .map_err(|e| RaceError::config(format!("invalid options for entity {name}: {e}")))?;
        let spec = EntitySpec {
            name: name.to_string(),
            implementation: implementation.to_string(),
            remote_uri: None,
            write_to: Vec::new(),
            read_from: Vec::new(),
            options,
        };
        let entity = factory(&spec)?;
        let handle = spawn_with_subscriptions(
            entity,
            self.bus.clone(),
            self.clock.clone(),
            DEFAULT_INBOX_CAPACITY,
            OverflowPolicy::DropOldest,
            Vec::new(),
            self.shutdown.clone(),
        );

        self.entities_by_name.lock().unwrap().insert(name.to_string(), handle.addressable.clone());
        self.dynamic_entities.lock().unwrap().insert(name.to_string(), Arc::new(handle));
        Ok(())
    }

    /// Forward a lifecycle command to a named Entity hosted on this process
    /// — either one declared in this process's own config, or one created by
    /// a prior [`Runtime::remote_instantiate`] call. This is how an inbound
    /// `LifecycleCmd` frame from a peer's Supervisor reaches its target.
    pub async fn remote_lifecycle(&self, handle_name: &str, cmd: LifecycleCommand) -> Result<(), RaceError> {
        if let Some(handle) = self.supervisor.local_entity_handle(handle_name) {
            return handle.send_lifecycle(cmd).await;
        }
        let dynamic = self.dynamic_entities.lock().unwrap().get(handle_name).cloned();
        match dynamic {
            Some(handle) => handle.send_lifecycle(cmd).await,
            None => Err(RaceError::lifecycle(handle_name, cmd.phase_name(), "no such entity on this runtime")),
        }
    }

    /// Current lifecycle state of every Entity, in declaration order.
    pub fn entity_states(&self) -> Vec<(String, crate::entity::LifecycleState)> {
        self.supervisor.entity_states()
    }

    /// Run Initialize then Start across every Entity in declaration order.
    pub async fn start(&self) -> Result<(), RaceError> {
        info!(runtime = %self.config.runtime_name, "starting runtime");
        self.supervisor.boot().await
    }

    pub async fn pause(&self) -> Result<(), RaceError> {
        self.supervisor.pause_all().await
    }

    pub async fn resume(&self) -> Result<(), RaceError> {
        self.supervisor.resume_all().await
    }

    /// Terminate every Entity in reverse declaration order, then stop the
    /// Clock and release every worker task: the scheduler stops issuing new
    /// callbacks, the Supervisor issues Terminate in reverse order, and
    /// remote connector links are dropped.
    pub async fn shutdown(&self) {
        info!(runtime = %self.config.runtime_name, "shutting down runtime");
        self.supervisor.shutdown().await;
        self.shutdown.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> RuntimeMetricsSnapshot {
        RuntimeMetricsSnapshot {
            bus: self.bus.metrics.snapshot(),
        }
    }

    /// Block until external shutdown is requested (Ctrl-C or a programmatic
    /// cancellation of [`Runtime::cancellation_token`]).
    pub async fn wait_for_shutdown_signal(&self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received interrupt, shutting down");
            }
            _ = self.shutdown.cancelled() => {}
        }
    }
}

/// This process's own address for outbound handshakes, derived from
/// `config.listen` when set. A Runtime with no listening endpoint still
/// dials out to declare itself by name, just with an ephemeral port.
fn local_runtime_uri(config: &Config) -> RuntimeUri {
    match &config.listen {
        Some(listen) => match listen.split_once(':') {
            Some((host, port)) => RuntimeUri {
                host: host.to_string(),
                port: port.parse().unwrap_or(0),
                name: config.runtime_name.clone(),
            },
            None => RuntimeUri { host: "0.0.0.0".to_string(), port: 0, name: config.runtime_name.clone() },
        },
        None => RuntimeUri { host: "0.0.0.0".to_string(), port: 0, name: config.runtime_name.clone() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityContext;
    use async_trait::async_trait;

    struct Logger {
        name: String,
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Entity for Logger {
        fn name(&self) -> &str {
            &self.name
        }

        async fn initialize(&mut self, _ctx: &EntityContext) -> Result<(), RaceError> {
            self.log.lock().unwrap().push(self.name.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn build_resolves_implementation_and_read_from() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log_for_factory = log.clone();

        let mut registry: HashMap<String, EntityFactory> = HashMap::new();
        registry.insert(
            "test::Logger".to_string(),
            Arc::new(move |spec: &EntitySpec| {
                Ok(Box::new(Logger {
                    name: spec.name.clone(),
                    log: log_for_factory.clone(),
                }) as Box<dyn Entity>)
            }),
        );

        let config = Config {
            runtime_name: "demo".into(),
            listen: None,
            log_level: "info".into(),
            entities: vec![
                EntitySpec {
                    name: "a".into(),
                    implementation: "test::Logger".into(),
                    remote_uri: None,
                    write_to: vec![],
                    read_from: vec!["/flights/*".into()],
                    options: toml::Value::Table(Default::default()),
                },
                EntitySpec {
                    name: "b".into(),
                    implementation: "test::Logger".into(),
                    remote_uri: None,
                    write_to: vec![],
                    read_from: vec![],
                    options: toml::Value::Table(Default::default()),
                },
            ],
        };

        let runtime = Runtime::build(config, &registry).unwrap();
        runtime.start().await.unwrap();

        assert_eq!(log.lock().unwrap().clone(), vec!["a", "b"]);
        assert!(runtime.entity_handle("a").is_some());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_implementation_fails_fast() {
        let registry: HashMap<String, EntityFactory> = HashMap::new();
        let config = Config {
            runtime_name: "demo".into(),
            listen: None,
            log_level: "info".into(),
            entities: vec![EntitySpec {
                name: "a".into(),
                implementation: "missing::Impl".into(),
                remote_uri: None,
                write_to: vec![],
                read_from: vec![],
                options: toml::Value::Table(Default::default()),
            }],
        };
        let err = Runtime::build(config, &registry).unwrap_err();
        assert!(matches!(err, RaceError::Config(_)));
    }
}
