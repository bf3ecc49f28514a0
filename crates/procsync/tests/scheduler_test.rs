//! Scheduling behavior: per-job mutual exclusion and periodic dispatch
//! with cooperative shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tokio_util::sync::CancellationToken;

use procsync::dialect::{ConnectionFactory, DatabaseType};
use procsync::engine;
use procsync::job::Job;
use procsync::scheduler::Scheduler;

fn tick_job(origin: &str, period: Duration) -> Arc<Job> {
    Job::new(common::pair(DatabaseType::Postgres, origin, &[]), period)
}

/// S6: two concurrent runs of one job serialize on the per-job lock;
/// their database calls never overlap.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_serialize_on_job_lock() {
    let factory = MockFactory::new(
        DatabaseType::Postgres,
        vec![result_set(&["id"], vec![])],
        Duration::from_millis(20),
    );
    let job = tick_job("src.tick", Duration::from_secs(60));

    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(
        engine::run(&job, &factory, &cancel, true),
        engine::run(&job, &factory, &cancel, true),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(factory.source_calls(), 2);
    assert_eq!(factory.gate.max_seen(), 1);
}

/// The scheduler ticks immediately, keeps ticking every period, and
/// stops dispatching once cancelled.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scheduler_dispatches_periodically_and_shuts_down() {
    let factory = Arc::new(MockFactory::new(
        DatabaseType::Postgres,
        vec![result_set(&["id"], vec![])],
        Duration::from_millis(1),
    ));
    let job = tick_job("src.tick", Duration::from_millis(25));

    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(
        vec![job],
        factory.clone() as Arc<dyn ConnectionFactory>,
        cancel.clone(),
        true,
    );
    let handle = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap()
        .unwrap();

    // first tick fires immediately, then every 25ms for ~200ms
    assert!(factory.source_calls() >= 2);
    // runs of a single job never overlap
    assert_eq!(factory.gate.max_seen(), 1);
}
