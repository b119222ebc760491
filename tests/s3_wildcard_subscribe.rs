//! S3 — A subscriber on `/flights/*` receives traffic from every matching
//! sibling channel but nothing from an unrelated channel.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use race_core::config::{Config, EntitySpec};
use race_core::entity::Entity;
use race_core::runtime::{EntityFactory, Runtime};

use common::{Publisher, Recorder};

#[tokio::test]
async fn wildcard_subscriber_sees_matching_siblings_only() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_for_factory = received.clone();

    let mut registry: HashMap<String, EntityFactory> = HashMap::new();
    registry.insert(
        "test::Recorder".into(),
        Arc::new(move |spec: &EntitySpec| {
            Ok(Box::new(Recorder {
                name: spec.name.clone(),
                received: received_for_factory.clone(),
            }) as Box<dyn Entity>)
        }),
    );
    registry.insert(
        "test::PosPublisher".into(),
        Arc::new(move |spec: &EntitySpec| {
            Ok(Box::new(Publisher {
                name: spec.name.clone(),
                channel: "/flights/pos".into(),
                values: vec![1],
            }) as Box<dyn Entity>)
        }),
    );
    registry.insert(
        "test::PlanPublisher".into(),
        Arc::new(move |spec: &EntitySpec| {
            Ok(Box::new(Publisher {
                name: spec.name.clone(),
                channel: "/flights/plan".into(),
                values: vec![2],
            }) as Box<dyn Entity>)
        }),
    );
    registry.insert(
        "test::OtherPublisher".into(),
        Arc::new(move |spec: &EntitySpec| {
            Ok(Box::new(Publisher {
                name: spec.name.clone(),
                channel: "/other".into(),
                values: vec![99],
            }) as Box<dyn Entity>)
        }),
    );

    let config = Config {
        runtime_name: "s3".into(),
        listen: None,
        log_level: "info".into(),
        entities: vec![
            EntitySpec {
                name: "recorder".into(),
                implementation: "test::Recorder".into(),
                remote_uri: None,
                write_to: vec![],
                read_from: vec!["/flights/*".into()],
                options: toml::Value::Table(Default::default()),
            },
            EntitySpec {
                name: "pos".into(),
                implementation: "test::PosPublisher".into(),
                remote_uri: None,
                write_to: vec!["/flights/pos".into()],
                read_from: vec![],
                options: toml::Value::Table(Default::default()),
            },
            EntitySpec {
                name: "plan".into(),
                implementation: "test::PlanPublisher".into(),
                remote_uri: None,
                write_to: vec!["/flights/plan".into()],
                read_from: vec![],
                options: toml::Value::Table(Default::default()),
            },
            EntitySpec {
                name: "other".into(),
                implementation: "test::OtherPublisher".into(),
                remote_uri: None,
                write_to: vec!["/other".into()],
                read_from: vec![],
                options: toml::Value::Table(Default::default()),
            },
        ],
    };

    let runtime = Runtime::build(config, &registry).unwrap();
    runtime.start().await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut got = received.lock().unwrap().clone();
    got.sort();
    assert_eq!(got, vec![("/flights/plan".to_string(), 2), ("/flights/pos".to_string(), 1)]);

    runtime.shutdown().await;
}
