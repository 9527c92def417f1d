//! End-to-end tests for enrollment-daemon.
//!
//! Runs whole processes over the in-memory fabric with real tokio timers:
//! enrollment, authentication, the watchdog and the background enroller.

use std::time::Duration;

use enrollment_core::EnrollmentEvent;
use enrollment_core::security::AUTH_PASSWORD;
use enrollment_daemon::{DaemonConfig, EventStream, Simulation};
use tempfile::TempDir;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

/// Default two-process DIF with timers short enough for tests.
fn fast_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.enrollment.enroll_timeout_ms = 1_000;
    config.enrollment.watchdog_period_ms = 100;
    config.enrollment.declared_dead_interval_ms = 500;
    config.enrollment.neighbors_enroller_period_ms = 200;
    config
}

/// Wait for the first event matching `pred`, skipping the others.
async fn wait_for(
    events: &mut EventStream,
    pred: impl Fn(&EnrollmentEvent) -> bool,
) -> EnrollmentEvent {
    timeout(WAIT, async {
        loop {
            match events.next().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("Event stream closed"),
            }
        }
    })
    .await
    .expect("Timeout waiting for event")
}

fn is_assigned(event: &EnrollmentEvent) -> bool {
    matches!(event, EnrollmentEvent::AssignedToDif { .. })
}

fn is_added(name: &'static str) -> impl Fn(&EnrollmentEvent) -> bool {
    move |event| {
        matches!(event, EnrollmentEvent::NeighborAdded { neighbor, .. } if neighbor.name == name)
    }
}

// ============================================================================
// Enrollment
// ============================================================================

#[tokio::test]
async fn test_joiner_enrolls_from_config_dir() {
    let dir = TempDir::new().unwrap();
    fast_config().save(dir.path()).unwrap();

    let config = DaemonConfig::load_or_init(dir.path()).unwrap();
    let mut sim = Simulation::start(config).unwrap();
    let mut joiner = sim.node("joiner").unwrap().subscribe();
    let mut bootstrap = sim.node("bootstrap").unwrap().subscribe();

    assert_eq!(sim.enroll_configured_neighbors().unwrap(), 1);

    // The neighbor is added before the DIF assignment is announced
    wait_for(&mut joiner, is_added("bootstrap")).await;
    let assigned = wait_for(&mut joiner, is_assigned).await;
    assert_eq!(assigned, EnrollmentEvent::AssignedToDif { address: 2 });
    wait_for(&mut bootstrap, is_added("joiner")).await;

    let joiner_task = sim.node("joiner").unwrap().task().clone();
    assert_eq!(joiner_task.directory().address(), 2);
    assert!(joiner_task.directory().data_transfer_constants().is_some());
    assert_eq!(joiner_task.directory().qos_cubes().len(), 2);
    assert!(joiner_task.is_enrolled_to("bootstrap"));
    assert!(sim.node("bootstrap").unwrap().task().is_enrolled_to("joiner"));
    assert_eq!(sim.fabric().open_ports(), 2);

    sim.shutdown().await;
}

#[tokio::test]
async fn test_password_enrollment() {
    let mut config = fast_config();
    for process in &mut config.processes {
        process.auth_policy = AUTH_PASSWORD.to_string();
        process.password = Some("hunter2".to_string());
    }

    let mut sim = Simulation::start(config).unwrap();
    let mut joiner = sim.node("joiner").unwrap().subscribe();
    sim.enroll("joiner", "bootstrap").unwrap();

    wait_for(&mut joiner, is_added("bootstrap")).await;
    assert!(sim.node("joiner").unwrap().task().is_enrolled_to("bootstrap"));

    sim.shutdown().await;
}

#[tokio::test]
async fn test_password_mismatch_fails() {
    let mut config = fast_config();
    config.enrollment.neighbors_enroller_period_ms = 0;
    for (process, password) in config.processes.iter_mut().zip(["right", "wrong"]) {
        process.auth_policy = AUTH_PASSWORD.to_string();
        process.password = Some(password.to_string());
    }

    let mut sim = Simulation::start(config).unwrap();
    let mut joiner = sim.node("joiner").unwrap().subscribe();
    sim.enroll("joiner", "bootstrap").unwrap();

    let failed = wait_for(&mut joiner, |e| {
        matches!(e, EnrollmentEvent::EnrollmentFailed { .. })
    })
    .await;
    match failed {
        EnrollmentEvent::EnrollmentFailed { name, .. } => assert_eq!(name, "bootstrap"),
        other => panic!("unexpected {:?}", other),
    }

    let joiner_task = sim.node("joiner").unwrap().task().clone();
    assert!(!joiner_task.is_enrolled_to("bootstrap"));
    assert_eq!(joiner_task.directory().address(), 0);
    assert_eq!(joiner_task.machine_count(), 0);

    sim.shutdown().await;
}

#[tokio::test]
async fn test_enrollment_to_missing_process_fails() {
    let mut sim = Simulation::start(fast_config()).unwrap();
    sim.crash("bootstrap").await.unwrap();

    sim.enroll("joiner", "bootstrap").unwrap();

    // Nothing was created: the flow never came up
    tokio::time::sleep(Duration::from_millis(100)).await;
    let joiner_task = sim.node("joiner").unwrap().task().clone();
    assert_eq!(joiner_task.machine_count(), 0);
    assert_eq!(joiner_task.pending_count(), 0);
    assert_eq!(sim.fabric().open_ports(), 0);

    sim.shutdown().await;
}

#[tokio::test]
async fn test_address_change_reaches_neighbor() {
    let mut sim = Simulation::start(fast_config()).unwrap();
    let mut joiner = sim.node("joiner").unwrap().subscribe();
    sim.enroll("joiner", "bootstrap").unwrap();
    wait_for(&mut joiner, is_added("bootstrap")).await;

    sim.node("bootstrap").unwrap().change_address(100).unwrap();

    let changed = wait_for(&mut joiner, |e| {
        matches!(e, EnrollmentEvent::NeighborAddressChanged { .. })
    })
    .await;
    assert_eq!(
        changed,
        EnrollmentEvent::NeighborAddressChanged {
            name: "bootstrap".to_string(),
            old_address: 1,
            new_address: 100,
        }
    );
    let bootstrap_seen = sim.node("joiner").unwrap().task().directory().get("bootstrap");
    assert_eq!(bootstrap_seen.map(|n| n.address), Some(100));

    sim.shutdown().await;
}

// ============================================================================
// Liveness
// ============================================================================

#[tokio::test]
async fn test_crashed_neighbor_is_declared_dead() {
    let mut sim = Simulation::start(fast_config()).unwrap();
    let mut joiner = sim.node("joiner").unwrap().subscribe();
    sim.enroll("joiner", "bootstrap").unwrap();
    wait_for(&mut joiner, is_added("bootstrap")).await;

    sim.crash("bootstrap").await.unwrap();

    wait_for(&mut joiner, |e| {
        matches!(e, EnrollmentEvent::NeighborDeclaredDead { neighbor } if neighbor.name == "bootstrap")
    })
    .await;
    wait_for(&mut joiner, |e| {
        matches!(e, EnrollmentEvent::ConnectivityToNeighborLost { neighbor } if neighbor.name == "bootstrap")
    })
    .await;

    let joiner_task = sim.node("joiner").unwrap().task().clone();
    assert!(!joiner_task.is_enrolled_to("bootstrap"));
    assert_eq!(sim.fabric().open_ports(), 0);

    sim.shutdown().await;
}

#[tokio::test]
async fn test_healthy_neighbors_stay_enrolled() {
    let mut sim = Simulation::start(fast_config()).unwrap();
    let mut joiner = sim.node("joiner").unwrap().subscribe();
    sim.enroll("joiner", "bootstrap").unwrap();
    wait_for(&mut joiner, is_added("bootstrap")).await;

    // Several dead intervals with both sides answering probes
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(sim.node("joiner").unwrap().task().is_enrolled_to("bootstrap"));
    assert!(sim.node("bootstrap").unwrap().task().is_enrolled_to("joiner"));
    let rtt_known = sim
        .node("joiner")
        .unwrap()
        .task()
        .directory()
        .get("bootstrap")
        .map(|n| n.last_heard_from_ms > 0);
    assert_eq!(rtt_known, Some(true));

    sim.shutdown().await;
}

#[tokio::test]
async fn test_released_neighbor_is_enrolled_again() {
    let mut sim = Simulation::start(fast_config()).unwrap();
    let mut joiner = sim.node("joiner").unwrap().subscribe();
    sim.enroll("joiner", "bootstrap").unwrap();
    wait_for(&mut joiner, is_added("bootstrap")).await;

    assert!(sim.node("joiner").unwrap().task().disconnect_neighbor("bootstrap"));
    wait_for(&mut joiner, |e| {
        matches!(e, EnrollmentEvent::ConnectivityToNeighborLost { .. })
    })
    .await;

    // The background enroller brings it back without a new assignment
    wait_for(&mut joiner, is_added("bootstrap")).await;
    assert!(sim.node("joiner").unwrap().task().is_enrolled_to("bootstrap"));
    assert_eq!(
        sim.node("joiner").unwrap().task().directory().address(),
        2
    );

    sim.shutdown().await;
}
