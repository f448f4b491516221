//! End-to-end tests for MQTT connections through the lifecycle actor
//!
//! A mock MQTT session stands in for the broker so the full chain is
//! exercised: factory-shaped construction, actor-driven open, batch source
//! subscription, inbound dispatch into the router seam, and close.

#![cfg(feature = "mqtt")]

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use twinlink::client::mqtt::{GenericMqttMessage, MqttProtocolClient};
use twinlink::client::ClientContext;
use twinlink::config::TimeoutSection;
use twinlink::lifecycle::{ClientState, ConnectionActor};
use twinlink::model::{
    Connection, ConnectionId, ConnectionType, ConnectivityStatus, QualityOfService, Source, Target,
};
use twinlink::monitoring::MonitorRegistry;
use twinlink::routing::{IdentityMapper, InboundDispatcher, OutboundSignal};
use twinlink::testing::{MockMqttSession, RecordingDispatcher};
use twinlink::ProtocolClient;

fn mqtt_connection() -> Connection {
    Connection::builder(
        ConnectionId::new("mqtt-it"),
        ConnectionType::Mqtt5,
        ConnectivityStatus::Open,
        "mqtt://broker.example:1883",
    )
    .sources(vec![Source::new(
        ["data", "data2"],
        QualityOfService::AtLeastOnce,
    )
    .with_authorization_context(["twin:device"])])
    .targets(vec![Target::new("twin/out").with_topics(["twin/events"])])
    .build()
}

fn context(
    registry: Arc<MonitorRegistry>,
    dispatcher: Arc<RecordingDispatcher>,
) -> ClientContext {
    ClientContext {
        connection: mqtt_connection(),
        registry,
        mapper: Arc::new(IdentityMapper),
        dispatcher,
        headers: HashMap::new(),
    }
}

#[tokio::test]
async fn full_lifecycle_subscribes_dispatches_and_closes() {
    let registry = Arc::new(MonitorRegistry::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());

    let session = MockMqttSession::new();
    let connects = session.recorded_connects();
    let subscribes = session.recorded_subscribes();
    let injector = session.injector();

    let client = MqttProtocolClient::with_session(
        session,
        context(Arc::clone(&registry), Arc::clone(&dispatcher)),
    );
    let handle = ConnectionActor::spawn(
        ConnectionId::new("mqtt-it"),
        Box::new(client),
        TimeoutSection::default(),
    );

    let ack = handle.open().await.expect("open should be acknowledged");
    assert!(ack.is_success(), "open failed: {:?}", ack.error);
    assert_eq!(ack.state, ClientState::Connected);
    assert_eq!(connects.lock().unwrap().len(), 1);

    let filters: Vec<String> = subscribes
        .lock()
        .unwrap()
        .iter()
        .flat_map(|s| s.topic_filters())
        .collect();
    assert_eq!(filters, vec!["data", "data2"]);

    injector
        .send(GenericMqttMessage {
            topic: "data".to_string(),
            payload: Bytes::from_static(b"{\"temp\":21}"),
            qos: QualityOfService::AtLeastOnce,
            retain: false,
            correlation_id: Some("corr-1".to_string()),
        })
        .await
        .expect("the client installed its inbound sender on connect");

    // the inbound task hands off asynchronously
    tokio::time::sleep(Duration::from_millis(50)).await;

    let messages = dispatcher.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].source_address, "data");
    assert_eq!(messages[0].correlation_id.as_deref(), Some("corr-1"));
    assert_eq!(messages[0].authorization_context, vec!["twin:device"]);

    let id = ConnectionId::new("mqtt-it");
    assert_eq!(registry.for_inbound_consumed(&id, "data").get(), 1);
    assert_eq!(registry.for_inbound_mapped(&id, "data").get(), 1);
    assert_eq!(registry.for_inbound_acknowledged(&id, "data").get(), 1);

    let ack = handle.close().await.expect("close should be acknowledged");
    assert!(ack.is_success());
    assert_eq!(ack.state, ClientState::Closed);
}

#[tokio::test]
async fn rejected_subscription_fails_the_open() {
    let registry = Arc::new(MonitorRegistry::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());

    let session = MockMqttSession::new().with_rejected_filter("data2", "not authorized");
    let client = MqttProtocolClient::with_session(session, context(registry, dispatcher));
    let handle = ConnectionActor::spawn(
        ConnectionId::new("mqtt-it"),
        Box::new(client),
        TimeoutSection::default(),
    );

    let ack = handle.open().await.expect("open should be acknowledged");
    assert!(!ack.is_success(), "a rejected filter must fail the connect");
    assert_eq!(ack.state, ClientState::Failed);
    let error = ack.error.expect("failure carries the error");
    assert!(
        error.to_string().contains("1 of 2"),
        "per-filter detail lost: {error}"
    );
}

#[tokio::test]
async fn qos_two_signals_flow_exactly_once_in_both_directions() {
    let registry = Arc::new(MonitorRegistry::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());

    let connection = Connection::builder(
        ConnectionId::new("mqtt-qos2"),
        ConnectionType::Mqtt5,
        ConnectivityStatus::Open,
        "mqtt://broker.example:1883",
    )
    .sources(vec![Source::new(["data"], QualityOfService::ExactlyOnce)])
    .targets(vec![Target::new("twin/out")
        .with_topics(["twin/events"])
        .with_qos(QualityOfService::ExactlyOnce)])
    .build();

    let session = MockMqttSession::new();
    let publishes = session.recorded_publishes();
    let injector = session.injector();
    let mut client = MqttProtocolClient::with_session(
        session,
        ClientContext {
            connection,
            registry: Arc::clone(&registry),
            mapper: Arc::new(IdentityMapper),
            dispatcher: Arc::clone(&dispatcher) as Arc<dyn InboundDispatcher>,
            headers: HashMap::new(),
        },
    );
    client.connect().await.expect("mock session connects");

    client
        .publish_signal(OutboundSignal::new(
            "twin/events",
            Bytes::from_static(b"{\"temp\":21}"),
        ))
        .await
        .expect("publish succeeds");

    let recorded = publishes.lock().unwrap();
    assert_eq!(recorded.len(), 1, "one selected target, one publish");
    assert_eq!(recorded[0].qos, QualityOfService::ExactlyOnce);
    drop(recorded);

    let id = ConnectionId::new("mqtt-qos2");
    assert_eq!(registry.for_outbound_dispatched(&id, "twin/out").get(), 1);
    assert_eq!(registry.for_outbound_published(&id, "twin/out").get(), 1);

    injector
        .send(GenericMqttMessage {
            topic: "data".to_string(),
            payload: Bytes::from_static(b"{\"temp\":21}"),
            qos: QualityOfService::ExactlyOnce,
            retain: false,
            correlation_id: None,
        })
        .await
        .expect("inbound sender installed");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        dispatcher.messages().len(),
        1,
        "a qos 2 delivery dispatches a single copy"
    );
    assert_eq!(registry.for_inbound_consumed(&id, "data").get(), 1);
}

#[tokio::test]
async fn close_then_reopen_resubscribes_from_a_fresh_session() {
    let registry = Arc::new(MonitorRegistry::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());

    let session = MockMqttSession::new();
    let connects = session.recorded_connects();
    let disconnects = session.disconnect_count();
    let subscribes = session.recorded_subscribes();
    let client = MqttProtocolClient::with_session(session, context(registry, dispatcher));
    let handle = ConnectionActor::spawn(
        ConnectionId::new("mqtt-it"),
        Box::new(client),
        TimeoutSection::default(),
    );

    let ack = handle.open().await.expect("open should be acknowledged");
    assert!(ack.is_success(), "open failed: {:?}", ack.error);

    let ack = handle.close().await.expect("close should be acknowledged");
    assert!(ack.is_success());
    assert_eq!(ack.state, ClientState::Closed);
    assert_eq!(*disconnects.lock().unwrap(), 1);

    let ack = handle.open().await.expect("reopen should be acknowledged");
    assert!(ack.is_success(), "reopen failed: {:?}", ack.error);
    assert_eq!(ack.state, ClientState::Connected);
    assert_eq!(connects.lock().unwrap().len(), 2);

    // the reopen re-issues the full batch subscribe; nothing carries over
    // from the closed session
    let batches = subscribes.lock().unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].topic_filters(), vec!["data", "data2"]);
    drop(batches);

    let ack = handle.close().await.expect("close should be acknowledged");
    assert!(ack.is_success());
}

#[tokio::test]
async fn dispatcher_failure_counts_inbound_as_dropped() {
    let registry = Arc::new(MonitorRegistry::new());
    let dispatcher = Arc::new(RecordingDispatcher::with_failure());

    let session = MockMqttSession::new();
    let injector = session.injector();
    let client = MqttProtocolClient::with_session(
        session,
        context(Arc::clone(&registry), dispatcher),
    );
    let handle = ConnectionActor::spawn(
        ConnectionId::new("mqtt-it"),
        Box::new(client),
        TimeoutSection::default(),
    );
    handle.open().await.expect("open should be acknowledged");

    injector
        .send(GenericMqttMessage {
            topic: "data".to_string(),
            payload: Bytes::from_static(b"{}"),
            qos: QualityOfService::AtLeastOnce,
            retain: false,
            correlation_id: None,
        })
        .await
        .expect("inbound sender installed");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = ConnectionId::new("mqtt-it");
    assert_eq!(registry.for_inbound_consumed(&id, "data").get(), 1);
    assert_eq!(registry.for_inbound_dropped(&id, "data").get(), 1);
    assert_eq!(registry.for_inbound_acknowledged(&id, "data").get(), 0);
}
