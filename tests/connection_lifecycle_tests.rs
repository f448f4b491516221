//! End-to-end tests for the connection lifecycle actor
//!
//! Drives a mock protocol client through the full command surface:
//! - open/close round trips with acknowledgements
//! - failed connects and recovery by reopening
//! - close idempotency on an already closed connection
//! - state observation through the watch channel
//! - teardown on handle shutdown

use std::time::Duration;
use twinlink::config::TimeoutSection;
use twinlink::lifecycle::{ClientState, ConnectionActor};
use twinlink::model::ConnectionId;
use twinlink::testing::MockProtocolClient;

fn spawn(client: MockProtocolClient) -> twinlink::ConnectionHandle {
    ConnectionActor::spawn(
        ConnectionId::new("lifecycle-it"),
        Box::new(client),
        TimeoutSection::default(),
    )
}

#[tokio::test]
async fn open_and_close_acknowledge_with_the_resulting_state() {
    let client = MockProtocolClient::new();
    let connects = client.connect_count();
    let disconnects = client.disconnect_count();
    let handle = spawn(client);

    let ack = handle.open().await.expect("open should be acknowledged");
    assert!(ack.is_success(), "open failed: {:?}", ack.error);
    assert_eq!(ack.state, ClientState::Connected);
    assert_eq!(*connects.lock().unwrap(), 1);

    let ack = handle.close().await.expect("close should be acknowledged");
    assert!(ack.is_success(), "close failed: {:?}", ack.error);
    assert_eq!(ack.state, ClientState::Closed);
    assert_eq!(*disconnects.lock().unwrap(), 1);
}

#[tokio::test]
async fn failed_connect_lands_in_failed_and_reopen_recovers() {
    let handle = spawn(MockProtocolClient::with_failing_connect());

    let ack = handle.open().await.expect("open should be acknowledged");
    assert!(!ack.is_success(), "connect was scripted to fail");
    assert_eq!(ack.state, ClientState::Failed);
    assert_eq!(handle.state(), ClientState::Failed);

    // Failed is terminal until the next open command restarts the attempt;
    // the mock only fails once per instance, so this one fails again.
    let ack = handle.open().await.expect("reopen should be acknowledged");
    assert_eq!(ack.state, ClientState::Failed);
}

#[tokio::test]
async fn close_on_an_already_closed_connection_is_a_no_op() {
    let client = MockProtocolClient::new();
    let disconnects = client.disconnect_count();
    let handle = spawn(client);

    let ack = handle.close().await.expect("close should be acknowledged");
    assert!(ack.is_success());
    assert_eq!(ack.state, ClientState::Closed);
    assert_eq!(
        *disconnects.lock().unwrap(),
        0,
        "no transport teardown for a connection that never opened"
    );
}

#[tokio::test]
async fn state_transitions_are_observable_through_the_watch() {
    let handle = spawn(MockProtocolClient::new());
    let mut states = handle.state_changes();
    assert_eq!(*states.borrow(), ClientState::Closed);

    let open = handle.open();
    let observe = async {
        let mut seen = Vec::new();
        while states.changed().await.is_ok() {
            let state = *states.borrow();
            seen.push(state);
            if state == ClientState::Connected {
                break;
            }
        }
        seen
    };
    let (ack, seen) = tokio::join!(open, observe);
    assert!(ack.expect("open should be acknowledged").is_success());
    assert_eq!(seen, vec![ClientState::Connecting, ClientState::Connected]);
}

#[tokio::test]
async fn shutdown_tears_down_a_connected_client() {
    let client = MockProtocolClient::new();
    let disconnects = client.disconnect_count();
    let handle = spawn(client);

    handle.open().await.expect("open should be acknowledged");
    handle.shutdown().await;

    assert_eq!(
        *disconnects.lock().unwrap(),
        1,
        "dropping the handle must not leak a live broker session"
    );
}

#[tokio::test(start_paused = true)]
async fn commands_time_out_when_no_acknowledgement_arrives() {
    struct StuckClient;

    #[async_trait::async_trait]
    impl twinlink::ProtocolClient for StuckClient {
        async fn connect(&mut self) -> twinlink::ConnectivityResult<()> {
            // never resolves within the command deadline
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn disconnect(&mut self, _drain: Duration) -> twinlink::ConnectivityResult<()> {
            Ok(())
        }

        async fn publish_signal(
            &self,
            _signal: twinlink::routing::OutboundSignal,
        ) -> twinlink::ConnectivityResult<()> {
            Ok(())
        }

        fn unacknowledged_publishes(&self) -> Vec<twinlink::PublishToken> {
            Vec::new()
        }
    }

    let handle = ConnectionActor::spawn(
        ConnectionId::new("stuck"),
        Box::new(StuckClient),
        TimeoutSection::default(),
    );

    // The caller's wait has headroom over the actor's connect deadline, so
    // a hung connect must surface as a failure acknowledgement rather than
    // a command timeout.
    let ack = handle.open().await.unwrap();
    assert!(
        !ack.is_success(),
        "a connect that never finishes cannot succeed"
    );
    assert!(matches!(
        ack.error,
        Some(twinlink::ConnectivityError::Timeout { .. })
    ));
    assert_eq!(ack.state, ClientState::Failed);
    let mut states = handle.state_changes();
    states
        .wait_for(|state| *state == ClientState::Failed)
        .await
        .expect("actor stays alive after the failed connect");
}
