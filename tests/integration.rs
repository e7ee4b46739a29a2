// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the HA Replicator
//!
//! Every test drives a real [`Agent`](ha_replicator::Agent) against a pair
//! of in-memory drivers, so no database needs to be running.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `initial_*` - One-shot strategies run by `start()`
//! - `supervisor_*` - Comparison and repair cycles
//! - `lifecycle_*` - Start, stop, reload and copy

mod common;

use common::*;
use ha_replicator::clock::unix_nanos;
use ha_replicator::{ClusterState, ManualClock, Point, ReplicationError, TokioClock};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

fn tokio_cluster(strategy: &str) -> TestCluster {
    TestCluster::new(config(strategy), Arc::new(TokioClock))
}

// =============================================================================
// Initial Strategy Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn initial_both_copies_schema_and_data() {
    let cluster = tokio_cluster("both");
    cluster
        .master()
        .seed("telegraf", "autogen", points_before("cpu", SystemTime::now(), 100));

    cluster.agent.start().await.unwrap();

    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "cpu"), 100);
    assert_eq!(
        cluster.slave().points("telegraf", "autogen", "cpu"),
        cluster.master().points("telegraf", "autogen", "cpu")
    );
    assert_eq!(cluster.agent.state(), ClusterState::Healthy);

    cluster.agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn initial_both_copies_entire_history() {
    let cluster = tokio_cluster("both");
    let day = Duration::from_secs(24 * 3600);
    let yesterday = SystemTime::now() - day;
    let history: Vec<_> = (0..100u32)
        .map(|i| {
            Point::new("cpu", unix_nanos(yesterday - day * (99 - i)))
                .tag("host", "web-1")
                .field("value", f64::from(i))
        })
        .collect();
    cluster.master().seed("telegraf", "autogen", history);

    cluster.agent.start().await.unwrap();

    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "cpu"), 100);
    let (_tx, rx) = no_shutdown();
    let report = cluster.coordinator().run_cycle(&rx).await;
    assert_eq!(report.state, ClusterState::Healthy);
    assert_eq!(report.points_copied, 0);

    cluster.agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn initial_schema_only_creates_objects_without_data() {
    let cluster = tokio_cluster("schema");
    let now = SystemTime::now();
    cluster.master().seed("telegraf", "autogen", points_before("cpu", now, 5));
    cluster.master().seed("telegraf", "one_week", points_before("disk", now, 5));

    cluster.agent.start().await.unwrap();

    let slave = cluster.slave();
    assert!(slave.has_database("telegraf"));
    assert!(slave.retention_policy("telegraf", "one_week").is_some());
    assert_eq!(slave.point_count("telegraf", "autogen", "cpu"), 0);
    assert_eq!(slave.write_attempts(), 0);

    // Running the strategy again creates nothing new.
    let (_tx, rx) = no_shutdown();
    let report = cluster.coordinator().run_initial_replication(&rx).await.unwrap();
    assert_eq!(report.schema.total(), 0);

    cluster.agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn initial_data_over_identical_points_is_noop() {
    let cluster = tokio_cluster("data");
    let points = points_before("mem", SystemTime::now(), 50);
    cluster.master().seed("telegraf", "autogen", points.clone());
    cluster.slave().seed("telegraf", "autogen", points);

    cluster.agent.start().await.unwrap();

    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "mem"), 50);
    assert_eq!(
        cluster.slave().points("telegraf", "autogen", "mem"),
        cluster.master().points("telegraf", "autogen", "mem")
    );

    cluster.agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn initial_unknown_strategy_does_not_block_start() {
    let cluster = tokio_cluster("mirror");
    cluster
        .master()
        .seed("telegraf", "autogen", points_before("cpu", SystemTime::now(), 3));

    cluster.agent.start().await.unwrap();

    assert!(cluster.agent.is_running());
    assert!(!cluster.slave().has_database("telegraf"));

    cluster.agent.stop().await.unwrap();
}

// =============================================================================
// Supervisor Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn supervisor_copies_new_master_data() {
    let cluster = tokio_cluster("none");
    cluster.agent.start().await.unwrap();
    let coordinator = cluster.coordinator();
    let (_tx, rx) = no_shutdown();

    cluster
        .master()
        .seed("telegraf", "autogen", points_before("cpu", SystemTime::now(), 30));

    let report = coordinator.run_cycle(&rx).await;
    assert!(report.error.is_none(), "{:?}", report.error);
    assert_eq!(report.divergent, 1);
    assert_eq!(report.points_copied, 30);
    assert_eq!(report.state, ClusterState::Resyncing);

    let report = coordinator.run_cycle(&rx).await;
    assert_eq!(report.divergent, 0);
    assert_eq!(report.points_copied, 0);
    assert_eq!(report.state, ClusterState::Healthy);
    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "cpu"), 30);

    cluster.agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn supervisor_copies_tail_within_tolerance() {
    let cluster = tokio_cluster("none");
    let start = SystemTime::now() - Duration::from_secs(600);
    let points = points_from("cpu", start, 10);
    cluster.master().seed("telegraf", "autogen", points.clone());
    cluster.slave().seed("telegraf", "autogen", points);
    cluster.agent.start().await.unwrap();
    let coordinator = cluster.coordinator();
    let (_tx, rx) = no_shutdown();

    // 30s past the slave's last point, then the master goes quiet: inside
    // the default 1m tolerance, so Healthy, but the point is still copied.
    cluster.master().seed(
        "telegraf",
        "autogen",
        points_from("cpu", start + Duration::from_secs(39), 1),
    );
    let report = coordinator.run_cycle(&rx).await;
    assert_eq!(report.state, ClusterState::Healthy);
    assert_eq!(report.divergent, 0);
    assert_eq!(report.max_lag, Duration::from_secs(30));
    assert_eq!(report.points_copied, 2);
    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "cpu"), 11);

    for _ in 0..3 {
        let report = coordinator.run_cycle(&rx).await;
        assert_eq!(report.state, ClusterState::Healthy);
        assert_eq!(report.points_copied, 0);
    }
    assert_eq!(
        cluster.slave().points("telegraf", "autogen", "cpu"),
        cluster.master().points("telegraf", "autogen", "cpu")
    );

    // 90s past: divergent, copied from the slave's last point.
    cluster.master().seed(
        "telegraf",
        "autogen",
        points_from("cpu", start + Duration::from_secs(129), 1),
    );
    let report = coordinator.run_cycle(&rx).await;
    assert_eq!(report.divergent, 1);
    assert_eq!(report.state, ClusterState::Resyncing);
    assert_eq!(report.points_copied, 2);
    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "cpu"), 12);

    cluster.agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn supervisor_slave_down_after_three_failed_probes() {
    let cluster = tokio_cluster("none");
    cluster.agent.start().await.unwrap();
    let coordinator = cluster.coordinator();
    let (_tx, rx) = no_shutdown();

    cluster.slave().set_reachable(false);
    cluster.probe(2).await;
    assert!(coordinator.slave().is_up());
    assert_eq!(coordinator.run_cycle(&rx).await.state, ClusterState::Healthy);

    cluster.probe(1).await;
    assert!(!coordinator.slave().is_up());

    let attempts = cluster.slave().write_attempts();
    cluster
        .master()
        .seed("telegraf", "autogen", points_from("cpu", SystemTime::now(), 10));
    for _ in 0..3 {
        let report = coordinator.run_cycle(&rx).await;
        assert_eq!(report.state, ClusterState::SlaveDown);
        assert_eq!(report.points_copied, 0);
    }
    assert_eq!(cluster.slave().write_attempts(), attempts);
    assert!(coordinator.recovery_pending_since().is_some());

    cluster.slave().set_reachable(true);
    cluster.probe(1).await;
    let report = coordinator.run_cycle(&rx).await;
    assert_eq!(report.state, ClusterState::Resyncing);
    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "cpu"), 10);
    assert!(coordinator.recovery_pending_since().is_none());

    assert_eq!(coordinator.run_cycle(&rx).await.state, ClusterState::Healthy);

    cluster.agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn supervisor_recovery_copies_out_of_order_write() {
    let cluster = tokio_cluster("none");
    // Both sides already hold data stamped an hour ahead.
    let ahead = SystemTime::now() + Duration::from_secs(3600);
    let points = points_from("cpu", ahead, 10);
    cluster.master().seed("telegraf", "autogen", points.clone());
    cluster.slave().seed("telegraf", "autogen", points);
    cluster.agent.start().await.unwrap();
    let coordinator = cluster.coordinator();
    let (_tx, rx) = no_shutdown();

    cluster.slave().set_reachable(false);
    cluster.probe(3).await;
    assert_eq!(coordinator.run_cycle(&rx).await.state, ClusterState::SlaveDown);

    // Written during the outage, older than the slave's last point: last
    // timestamps still match, so only the recovery range can find it.
    let late = Point::new("cpu", unix_nanos(SystemTime::now() + Duration::from_secs(1800)))
        .tag("host", "web-2")
        .field("value", 42.0);
    cluster.master().seed("telegraf", "autogen", [late.clone()]);

    cluster.slave().set_reachable(true);
    cluster.probe(1).await;
    let report = coordinator.run_cycle(&rx).await;
    assert!(report.error.is_none(), "{:?}", report.error);
    assert_eq!(report.divergent, 0);
    assert!(report.points_copied >= 1);
    assert!(cluster.slave().points("telegraf", "autogen", "cpu").contains(&late));
    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "cpu"), 11);
    assert!(coordinator.recovery_pending_since().is_none());

    assert_eq!(coordinator.run_cycle(&rx).await.state, ClusterState::Healthy);

    cluster.agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn supervisor_master_flap_recovers_without_restart() {
    let cluster = tokio_cluster("none");
    cluster.agent.start().await.unwrap();
    let coordinator = cluster.coordinator();
    let (_tx, rx) = no_shutdown();
    let mut states = coordinator.state_receiver();
    assert_eq!(*states.borrow_and_update(), ClusterState::Healthy);

    cluster.master().set_reachable(false);
    cluster.probe(3).await;
    assert_eq!(coordinator.run_cycle(&rx).await.state, ClusterState::MasterDown);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ClusterState::MasterDown);

    cluster.master().set_reachable(true);
    cluster
        .master()
        .seed("telegraf", "autogen", points_from("load", SystemTime::now(), 5));
    cluster.probe(1).await;

    let report = coordinator.run_cycle(&rx).await;
    assert!(matches!(
        report.state,
        ClusterState::Resyncing | ClusterState::Healthy
    ));
    assert_eq!(coordinator.run_cycle(&rx).await.state, ClusterState::Healthy);
    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "load"), 5);
    assert!(cluster.agent.is_running());

    cluster.agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn supervisor_runs_on_its_own_interval() {
    let cluster = tokio_cluster("none");
    cluster.agent.start().await.unwrap();
    cluster
        .master()
        .seed("telegraf", "autogen", points_before("cpu", SystemTime::now(), 4));

    // min_sync_interval defaults to 20s.
    tokio::time::sleep(Duration::from_secs(25)).await;

    let status = cluster.agent.status().unwrap();
    assert!(status.last_cycle.is_some());
    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "cpu"), 4);

    cluster.agent.stop().await.unwrap();
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn lifecycle_stop_waits_for_in_flight_copy() {
    let mut config = config("both");
    config.general.max_points_per_write = 100;
    config.general.data_chunk_duration = "1000h".to_string();
    let cluster = TestCluster::new(config, Arc::new(TokioClock));
    cluster
        .master()
        .seed("telegraf", "autogen", points_before("cpu", SystemTime::now(), 1000));
    cluster.slave().set_write_delay(Duration::from_millis(50));

    let starter = {
        let agent = Arc::clone(&cluster.agent);
        tokio::spawn(async move { agent.start().await })
    };
    while cluster.slave().write_attempts() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let waited = cluster.agent.stop().await.unwrap();

    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "cpu"), 1000);
    assert_eq!(cluster.slave().write_calls(), 10);
    assert!(waited > Duration::ZERO);
    assert!(matches!(starter.await.unwrap(), Err(ReplicationError::Shutdown)));
    assert!(!cluster.agent.is_running());
}

#[tokio::test(start_paused = true)]
async fn lifecycle_reload_replaces_coordinator() {
    let cluster = tokio_cluster("none");
    cluster.agent.start().await.unwrap();
    let before = cluster.coordinator();

    cluster.source.update(|c| {
        c.general.instance_id = "it-pair-reloaded".to_string();
        c.general.min_sync_interval = "5s".to_string();
    });
    cluster.agent.reload().await.unwrap();

    let after = cluster.coordinator();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.check_interval(), Duration::from_secs(5));
    assert_eq!(cluster.agent.release_info().instance_id, "it-pair-reloaded");
    assert_eq!(cluster.agent.state(), ClusterState::Healthy);

    cluster.agent.stop().await.unwrap();
    // Stopping again is harmless.
    cluster.agent.stop().await.unwrap();
}

#[tokio::test]
async fn lifecycle_bootstrap_waits_for_slave_entry() {
    let clock = Arc::new(ManualClock::default());
    let mut partial = config("none");
    partial.nodes.retain(|n| n.name != SLAVE);
    let cluster = TestCluster::new(partial, clock.clone());

    let starter = {
        let agent = Arc::clone(&cluster.agent);
        tokio::spawn(async move { agent.start().await })
    };
    while clock.sleeps() < 3 {
        tokio::task::yield_now().await;
    }
    assert!(!cluster.agent.is_running());
    assert_eq!(cluster.agent.state(), ClusterState::Bootstrapping);

    cluster.source.set(config("none"));
    starter.await.unwrap().unwrap();
    assert_eq!(cluster.agent.state(), ClusterState::Healthy);

    cluster.agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lifecycle_copy_range_without_monitoring() {
    let cluster = tokio_cluster("none");
    let start = SystemTime::now() - Duration::from_secs(3600);
    cluster.master().seed("telegraf", "autogen", points_from("cpu", start, 60));
    cluster.master().seed("telegraf", "autogen", points_from("mem", start, 60));

    let report = cluster
        .agent
        .copy(
            "telegraf.cpu",
            start + Duration::from_secs(10),
            start + Duration::from_secs(20),
        )
        .await
        .unwrap();

    assert_eq!(report.points_copied, 10);
    let copied = cluster.slave().points("telegraf", "autogen", "cpu");
    assert_eq!(copied.len(), 10);
    assert_eq!(copied[0].timestamp, unix_nanos(start) + 10 * SEC);
    assert_eq!(cluster.slave().point_count("telegraf", "autogen", "mem"), 0);
    assert!(!cluster.agent.is_running());
}
