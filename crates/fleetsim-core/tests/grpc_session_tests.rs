//! ---
//! fleetsim_section: "03-networking-external-interfaces"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "End-to-end sessions against the loopback gRPC endpoint."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use fleetsim_common::config::{FleetConfig, IngestConfig};
use fleetsim_core::{FleetOrchestrator, RecordingObserver, SessionOutcome, SessionState};
use fleetsim_net::{GrpcLink, IngestBehaviour, LoopbackIngest, LoopbackServerBuilder};
use fleetsim_schemas::BookingStatus;
use tonic::Code;

const TOKEN: &str = "greenlane-secret-token";
const WAIT: Duration = Duration::from_secs(15);

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

fn link_to(endpoint: String, token: &str) -> Arc<GrpcLink> {
    let config = IngestConfig {
        endpoint,
        auth_token: token.to_owned(),
        connect_timeout: Duration::from_secs(2),
        ..IngestConfig::default()
    };
    Arc::new(GrpcLink::from_config(&config).unwrap())
}

fn fleet(size: usize) -> FleetConfig {
    FleetConfig {
        size,
        update_interval: Duration::from_millis(5),
        seed: Some(3),
        shutdown_grace: Duration::from_secs(2),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transport_failure_after_three_sends_is_isolated() {
    let ingest = LoopbackIngest::new(
        IngestBehaviour::default()
            .acknowledge_with(BookingStatus::BookingConfirmed)
            .fail_after("CAR-002", 3),
    );
    let server = LoopbackServerBuilder::new("127.0.0.1:0".parse().unwrap(), TOKEN, ingest)
        .spawn()
        .await
        .unwrap();
    let observer = Arc::new(RecordingObserver::new());

    let handle = FleetOrchestrator::new(
        fleet(3),
        link_to(server.endpoint(), TOKEN),
        observer.clone(),
    )
    .start();

    let received = server.ingest().clone();
    eventually("CAR-002 to fail", || {
        handle.state_of("CAR-002") == Some(SessionState::ClosedError)
    })
    .await;
    eventually("CAR-001 and CAR-003 to pass tick 6", || {
        received.received_count("CAR-001") >= 6 && received.received_count("CAR-003") >= 6
    })
    .await;

    let report = handle.shutdown().await;

    match &report.get("CAR-002").unwrap().outcome {
        SessionOutcome::Failed { code, detail } => {
            assert_eq!(*code, Code::Unavailable);
            assert!(detail.contains("injected fault"), "detail: {detail}");
        }
        other => panic!("CAR-002 should have failed, got {other:?}"),
    }
    assert_eq!(received.received_count("CAR-002"), 3);
    assert_eq!(report.failures().count(), 1);

    for id in ["CAR-001", "CAR-003"] {
        let session = report.get(id).unwrap();
        assert_eq!(session.outcome, SessionOutcome::Interrupted);
        assert!(session.ticks_sent >= 6);
    }

    let car_two_acks = observer
        .acknowledgements()
        .into_iter()
        .filter(|ack| ack.vehicle_id == "CAR-002")
        .count();
    assert_eq!(car_two_acks, 3);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn telemetry_fields_arrive_intact() {
    let server = LoopbackServerBuilder::new(
        "127.0.0.1:0".parse().unwrap(),
        TOKEN,
        LoopbackIngest::default(),
    )
    .spawn()
    .await
    .unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let handle = FleetOrchestrator::new(
        fleet(1),
        link_to(server.endpoint(), TOKEN),
        observer.clone(),
    )
    .start();

    let ingest = server.ingest().clone();
    eventually("five messages", || ingest.received_count("CAR-001") >= 5).await;
    let report = handle.shutdown().await;

    let received = ingest.received("CAR-001");
    let sent = observer.ticks();
    for (wire, frame) in received.iter().zip(sent.iter()) {
        assert_eq!(wire.car_id, frame.vehicle_id);
        assert_eq!(wire.latitude, frame.latitude);
        assert_eq!(wire.longitude, frame.longitude);
        assert_eq!(wire.battery_level, frame.battery_level);
        assert_eq!(wire.velocity, frame.velocity);
        assert_eq!(wire.timestamp, frame.timestamp_ms);
    }
    assert!(received
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    assert!(received
        .windows(2)
        .all(|pair| pair[1].battery_level <= pair[0].battery_level));
    // Default acknowledgements carry no information.
    assert!(observer.acknowledgements().is_empty());
    assert_eq!(report.get("CAR-001").unwrap().acknowledgements, 0);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_token_fails_the_session_as_unauthenticated() {
    let server = LoopbackServerBuilder::new(
        "127.0.0.1:0".parse().unwrap(),
        TOKEN,
        LoopbackIngest::default(),
    )
    .spawn()
    .await
    .unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let handle = FleetOrchestrator::new(
        fleet(1),
        link_to(server.endpoint(), "not-the-token"),
        observer.clone(),
    )
    .start();

    let report = tokio::time::timeout(WAIT, handle.run_until(std::future::pending()))
        .await
        .expect("rejected session must end on its own");

    let session = report.get("CAR-001").unwrap();
    assert!(matches!(
        session.outcome,
        SessionOutcome::Failed { code: Code::Unauthenticated, .. }
    ));
    assert!(server.ingest().vehicles().is_empty());
    assert_eq!(observer.terminations().len(), 1);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_endpoint_fails_the_session_instead_of_hanging() {
    // Accepts TCP connections and never answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let config = IngestConfig {
        endpoint: format!("http://{addr}"),
        auth_token: TOKEN.to_owned(),
        open_timeout: Duration::from_millis(500),
        ..IngestConfig::default()
    };
    let observer = Arc::new(RecordingObserver::new());
    let handle = FleetOrchestrator::new(
        fleet(1),
        Arc::new(GrpcLink::from_config(&config).unwrap()),
        observer.clone(),
    )
    .start();

    let report = tokio::time::timeout(WAIT, handle.run_until(std::future::pending()))
        .await
        .expect("session against a silent endpoint must end on its own");

    let session = report.get("CAR-001").unwrap();
    assert!(
        matches!(
            session.outcome,
            SessionOutcome::Failed { code: Code::DeadlineExceeded, .. }
        ),
        "outcome: {:?}",
        session.outcome
    );
    assert_eq!(observer.terminations().len(), 1);

    silent.abort();
}
