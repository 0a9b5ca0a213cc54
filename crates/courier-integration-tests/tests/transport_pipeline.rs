//! End-to-end tests for the delivery pipeline with running workers

mod common;

use common::{
    create_transport, destination, init_tracing, transport_config, wait_until, Reaction,
    ScriptedHandler, AUDIT, ERRORS, INPUT,
};
use courier_runtime::codec::{HEADER_FAILED_QUEUE, HEADER_ORIGINAL_ID};
use courier_runtime::{InMemoryBroker, TransportMessage};
use courier_transport::{CycleOutcome, TransportConfig};
use serde_json::json;
use serial_test::serial;
use std::io::Write;
use tokio::time::Duration;

const PATIENCE: Duration = Duration::from_secs(5);

fn order(number: u32) -> TransportMessage {
    TransportMessage::new()
        .with_body(json!({ "order": number }))
        .with_header("customer.region", "emea")
}

/// Verify that a message failing on every attempt ends on the error queue.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_poison_message_is_dead_lettered_by_workers() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let handler = ScriptedHandler::always(Reaction::Fail);
    let mut config = transport_config();
    config.number_of_worker_threads = 2;
    let transport = create_transport(&broker, config, &handler);
    let id = transport
        .send(&mut order(1), INPUT, None)
        .await
        .unwrap();

    transport.start().await.unwrap();
    let moved = wait_until(PATIENCE, || broker.depth(&destination(ERRORS)) == 1).await;
    transport.stop().await;

    assert!(moved);
    assert_eq!(handler.received_count(), 2);
    assert_eq!(handler.failed_count(), 2);
    assert_eq!(broker.depth(&destination(INPUT)), 0);
    assert!(transport.retry_ledger().is_empty());

    let dead = broker.messages(&destination(ERRORS));
    assert_eq!(dead[0].string_property(HEADER_ORIGINAL_ID), Some(id.as_str()));
    assert_eq!(
        dead[0].string_property(HEADER_FAILED_QUEUE),
        Some(destination(INPUT).to_string().as_str())
    );
    assert_eq!(dead[0].string_property("customer_region"), Some("emea"));
}

/// Verify that a message succeeding on its last allowed attempt is delivered.
#[tokio::test]
async fn test_recovering_message_is_not_dead_lettered() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let handler = ScriptedHandler::scripted([Reaction::Fail]);
    let transport = create_transport(&broker, transport_config(), &handler);
    transport.send(&mut order(1), INPUT, None).await.unwrap();
    transport.start().await.unwrap();

    let first = transport.receive_from_queue().await.unwrap();
    let second = transport.receive_from_queue().await.unwrap();

    assert!(matches!(first, CycleOutcome::Failed { .. }));
    assert!(matches!(second, CycleOutcome::Processed { .. }));
    assert_eq!(broker.depth(&destination(ERRORS)), 0);
    assert_eq!(broker.depth(&destination(INPUT)), 0);
    assert_eq!(handler.received()[1].header("customer.region"), Some("emea"));
}

/// Verify that aborting keeps the message on the queue indefinitely.
#[tokio::test]
async fn test_abort_never_dead_letters() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let handler = ScriptedHandler::always(Reaction::Abort);
    let transport = create_transport(&broker, transport_config(), &handler);
    transport.send(&mut order(1), INPUT, None).await.unwrap();
    transport.start().await.unwrap();

    for _ in 0..5 {
        assert!(matches!(
            transport.receive_from_queue().await.unwrap(),
            CycleOutcome::Aborted { .. }
        ));
    }

    assert_eq!(broker.depth(&destination(INPUT)), 1);
    assert_eq!(broker.depth(&destination(ERRORS)), 0);
    assert_eq!(handler.failed_count(), 0);
}

/// Verify that workers mirror every received message to the audit queue.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forwarding_with_workers() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let handler = ScriptedHandler::succeeding();
    let mut config = transport_config();
    config.forward_received_messages_to = Some("audit".to_string());
    config.aliases.insert("audit".to_string(), AUDIT.to_string());
    config.number_of_worker_threads = 3;
    let transport = create_transport(&broker, config, &handler);
    for number in 0..10 {
        transport.send(&mut order(number), INPUT, None).await.unwrap();
    }

    transport.start().await.unwrap();
    let done = wait_until(PATIENCE, || handler.received_count() == 10).await;
    transport.stop().await;

    assert!(done);
    assert_eq!(broker.depth(&destination(AUDIT)), 10);
    assert_eq!(broker.depth(&destination(INPUT)), 0);
}

/// Verify that a malformed body is dead-lettered without being retried.
#[tokio::test]
async fn test_malformed_body_is_dead_lettered() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let handler = ScriptedHandler::succeeding();
    let transport = create_transport(&broker, transport_config(), &handler);
    let mut garbage = TransportMessage::new().with_raw_body(&b"<order/>"[..]);
    transport.send(&mut garbage, INPUT, None).await.unwrap();
    transport.start().await.unwrap();

    let outcome = transport.receive_from_queue().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::DeadLettered { .. }));
    assert_eq!(handler.received_count(), 0);
    assert_eq!(broker.depth(&destination(ERRORS)), 1);
    assert_eq!(broker.depth(&destination(INPUT)), 0);
}

/// Verify that a transport can be started from a loaded configuration file.
#[tokio::test]
#[serial]
async fn test_transport_from_configuration_file() {
    init_tracing();
    let mut file = tempfile_yaml();
    writeln!(
        file,
        "input_queue: orders\nerror_queue: errors\nis_transactional: true\nmilliseconds_to_wait_for_message: 25\naliases:\n  orders: \"{}\"\n  errors: \"{}\"",
        INPUT, ERRORS
    )
    .unwrap();
    file.flush().unwrap();

    let config = TransportConfig::load(Some(file.path())).unwrap();
    let broker = InMemoryBroker::new();
    let handler = ScriptedHandler::succeeding();
    let transport = create_transport(&broker, config, &handler);
    transport.send(&mut order(1), "orders", None).await.unwrap();
    transport.start().await.unwrap();

    assert_eq!(transport.number_of_worker_threads(), 1);
    let done = wait_until(PATIENCE, || handler.received_count() == 1).await;
    transport.stop().await;

    assert!(done);
    assert_eq!(transport.number_of_pending_messages().await.unwrap(), 0);
}

fn tempfile_yaml() -> tempfile::NamedTempFile {
    tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap()
}
