//! End-to-end scenarios against the in-memory adapter: insert through
//! dispatch, execution, retries, and the maintenance loops.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde_json::json;

use izi::adapter::InMemoryAdapter;
use izi::job::{JobUpdate, DEFAULT_QUEUE};
use izi::prelude::*;

fn fast_config() -> Config {
    Config::new()
        .with_queue(DEFAULT_QUEUE, 5)
        .with_poll_interval(Duration::from_millis(20))
        .with_stage_interval(Duration::from_millis(20))
}

async fn started(config: Config) -> Izi<InMemoryAdapter> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut izi = Izi::new(InMemoryAdapter::new(), config);
    izi.migrate().await.unwrap();
    izi.start().await.unwrap();
    izi
}

async fn wait_for_state(izi: &Izi<InMemoryAdapter>, id: JobId, state: JobState) -> Job {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = izi.get_job(id).await.unwrap().unwrap();
            if job.state == state {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {id} never reached {state}"))
}

/// Fails with "temp" until `succeed_on`, then succeeds. Immediate retries.
struct Flaky {
    succeed_on: i32,
}

#[async_trait]
impl Worker for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn perform(&self, job: Job) -> WorkerResult {
        if job.attempt >= self.succeed_on {
            WorkerResult::ok()
        } else {
            WorkerResult::error("temp")
        }
    }

    fn backoff(&self, _job: &Job) -> Option<TimeDelta> {
        Some(TimeDelta::zero())
    }
}

struct AlwaysOk;

#[async_trait]
impl Worker for AlwaysOk {
    fn name(&self) -> &str {
        "always_ok"
    }

    async fn perform(&self, _job: Job) -> WorkerResult {
        WorkerResult::ok()
    }
}

#[tokio::test]
async fn retry_chain_completes_on_third_attempt() {
    let mut izi = started(fast_config()).await;
    izi.register(Flaky { succeed_on: 3 });

    let job = izi
        .insert(JobBuilder::new("flaky").with_max_attempts(5))
        .await
        .unwrap();

    let done = wait_for_state(&izi, job.id, JobState::Completed).await;
    assert_eq!(done.attempt, 3);
    assert_eq!(done.errors.len(), 2);
    assert_eq!(done.errors[0].error, "temp");
    assert_eq!(done.errors[0].attempt, 1);
    assert_eq!(done.errors[1].attempt, 2);
    assert!(done.completed_at.is_some());
    assert!(done.discarded_at.is_none());
    assert!(done.cancelled_at.is_none());

    izi.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn failing_job_discards_at_the_attempt_limit() {
    let mut izi = started(fast_config()).await;
    izi.register(Flaky { succeed_on: i32::MAX });

    let job = izi
        .insert(JobBuilder::new("flaky").with_max_attempts(2))
        .await
        .unwrap();

    let dead = wait_for_state(&izi, job.id, JobState::Discarded).await;
    assert_eq!(dead.attempt, 2);
    assert_eq!(dead.errors.len(), 2);
    assert!(dead.discarded_at.is_some());
    assert!(dead.completed_at.is_none());

    izi.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn unique_insert_returns_the_existing_job() {
    let mut izi = started(Config::new().with_queue(DEFAULT_QUEUE, 5)).await;
    izi.register(AlwaysOk);
    // pause so the first job stays put while we insert the duplicate
    izi.pause_queue(DEFAULT_QUEUE).unwrap();

    let conflicts = Arc::new(AtomicI32::new(0));
    let clone = conflicts.clone();
    izi.on(Event::JobUniqueConflict, move |_| {
        clone.fetch_add(1, Ordering::SeqCst);
    });

    let build = || {
        JobBuilder::new("always_ok")
            .with_args(json!({"user_id": 123}))
            .unique(UniqueOptions::within_secs(60))
    };

    let first = izi.insert_with_result(build()).await.unwrap();
    assert!(!first.conflict);

    let second = izi.insert_with_result(build()).await.unwrap();
    assert!(second.conflict);
    assert_eq!(second.job.id, first.job.id);
    assert_eq!(conflicts.load(Ordering::SeqCst), 1);
    assert_eq!(izi.adapter().all_jobs().len(), 1);

    // different args are not a conflict
    let third = izi
        .insert_with_result(
            JobBuilder::new("always_ok")
                .with_args(json!({"user_id": 124}))
                .unique(UniqueOptions::within_secs(60)),
        )
        .await
        .unwrap();
    assert!(!third.conflict);

    izi.shutdown(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn priority_orders_execution_start() {
    let order = Arc::new(Mutex::new(Vec::new()));

    struct Recorder(Arc<Mutex<Vec<i64>>>);

    #[async_trait]
    impl Worker for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn perform(&self, job: Job) -> WorkerResult {
            self.0.lock().unwrap().push(job.args["n"].as_i64().unwrap());
            WorkerResult::ok()
        }
    }

    let config = Config::new()
        .with_queue_config(QueueConfig::new(DEFAULT_QUEUE, 1).paused())
        .with_poll_interval(Duration::from_millis(20))
        .with_stage_interval(Duration::from_millis(20));
    let mut izi = started(config).await;
    izi.register(Recorder(order.clone()));

    // all three queued before anything can run
    let relaxed = izi
        .insert(JobBuilder::new("recorder").with_args(json!({"n": 10})).with_priority(10))
        .await
        .unwrap();
    let normal = izi
        .insert(JobBuilder::new("recorder").with_args(json!({"n": 0})).with_priority(0))
        .await
        .unwrap();
    let urgent = izi
        .insert(JobBuilder::new("recorder").with_args(json!({"n": -10})).with_priority(-10))
        .await
        .unwrap();

    izi.resume_queue(DEFAULT_QUEUE).unwrap();
    for id in [urgent.id, normal.id, relaxed.id] {
        wait_for_state(&izi, id, JobState::Completed).await;
    }

    assert_eq!(*order.lock().unwrap(), vec![-10, 0, 10]);
    izi.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn future_jobs_wait_for_the_stager() {
    let mut izi = started(fast_config()).await;
    izi.register(AlwaysOk);

    let job = izi
        .insert(JobBuilder::new("always_ok").schedule_in(TimeDelta::milliseconds(150)))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Scheduled);

    // not runnable yet
    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = izi.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Scheduled);

    wait_for_state(&izi, job.id, JobState::Completed).await;
    izi.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn snoozed_jobs_come_back_without_consuming_an_error() {
    struct SnoozeOnce;

    #[async_trait]
    impl Worker for SnoozeOnce {
        fn name(&self) -> &str {
            "snooze_once"
        }

        async fn perform(&self, job: Job) -> WorkerResult {
            if job.meta.contains_key("snoozedAt") {
                WorkerResult::ok()
            } else {
                WorkerResult::snooze(TimeDelta::zero())
            }
        }
    }

    let mut izi = started(fast_config()).await;
    izi.register(SnoozeOnce);

    let job = izi.insert(JobBuilder::new("snooze_once")).await.unwrap();
    let done = wait_for_state(&izi, job.id, JobState::Completed).await;

    assert!(done.meta.contains_key("snoozedAt"));
    assert!(done.errors.is_empty());
    assert_eq!(done.attempt, 2);

    izi.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn rescue_recovers_a_crashed_attempt() {
    let mut izi = started(fast_config()).await;
    // no worker registered yet: claim the row by hand to fake a dead process
    izi.pause_queue(DEFAULT_QUEUE).unwrap();

    let job = izi.insert(JobBuilder::new("always_ok")).await.unwrap();
    let claimed = izi.adapter().fetch_jobs(DEFAULT_QUEUE, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    izi.adapter()
        .update_job(
            job.id,
            JobUpdate {
                attempted_at: Some(Utc::now() - TimeDelta::minutes(10)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let rescued = izi
        .rescue_stuck_jobs(Some(Duration::from_secs(300)))
        .await
        .unwrap();
    assert_eq!(rescued, 1);

    let job = izi.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Available);
    assert!(Utc::now() - job.scheduled_at < TimeDelta::seconds(2));

    izi.shutdown(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn drain_runs_everything_currently_due() {
    let mut izi = started(fast_config()).await;
    izi.register(AlwaysOk);

    let jobs = izi
        .insert_all((0..20).map(|n| JobBuilder::new("always_ok").with_args(json!({"n": n}))))
        .await
        .unwrap();
    izi.drain(None).await.unwrap();

    for job in jobs {
        let job = izi.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    izi.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn cancel_jobs_spares_other_queues() {
    let config = Config::new()
        .with_queue_config(QueueConfig::new(DEFAULT_QUEUE, 5).paused())
        .with_queue_config(QueueConfig::new("imports", 5).paused());
    let mut izi = started(config).await;
    izi.register(AlwaysOk);

    let default_job = izi.insert(JobBuilder::new("always_ok")).await.unwrap();
    let import_job = izi
        .insert(JobBuilder::new("always_ok").on_queue("imports"))
        .await
        .unwrap();

    let cancelled = izi
        .cancel_jobs(CancelCriteria::queue(DEFAULT_QUEUE))
        .await
        .unwrap();
    assert_eq!(cancelled, 1);

    let job = izi.get_job(default_job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.cancelled_at.is_some());
    let job = izi.get_job(import_job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Available);

    izi.shutdown(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn telemetry_reports_the_job_lifecycle() {
    let mut izi = started(fast_config()).await;
    izi.register(Flaky { succeed_on: 2 });

    let events = Arc::new(Mutex::new(Vec::new()));
    let clone = events.clone();
    izi.on_any(move |payload| {
        if payload.queue.as_deref() == Some(DEFAULT_QUEUE) && payload.job.is_some() {
            clone.lock().unwrap().push(payload.event);
        }
    });

    let job = izi
        .insert(JobBuilder::new("flaky").with_max_attempts(5))
        .await
        .unwrap();
    wait_for_state(&izi, job.id, JobState::Completed).await;
    // the completion event lands just after the state write
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            Event::JobStart,
            Event::JobError,
            Event::JobStart,
            Event::JobComplete,
        ]
    );

    izi.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn isolated_timeout_kills_the_context_and_discards() {
    use izi::isolation::IsolationConfig;
    use std::os::unix::fs::PermissionsExt;

    // a context that accepts the job and never answers
    let script = std::env::temp_dir().join(format!("izi-lifecycle-hang-{}", std::process::id()));
    std::fs::write(&script, "#!/bin/sh\nread line\nsleep 30\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    struct Hanging;

    #[async_trait]
    impl Worker for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn perform(&self, _job: Job) -> WorkerResult {
            unreachable!("isolated workers run in the context process")
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(200)
        }

        fn isolation(&self) -> Option<IsolationSpec> {
            Some(IsolationSpec::pooled())
        }
    }

    let config = fast_config().with_isolation(IsolationConfig::new(&script));
    let mut izi = started(config).await;
    izi.register(Hanging);

    let timeouts = Arc::new(AtomicI32::new(0));
    let clone = timeouts.clone();
    izi.on(Event::JobIsolatedTimeout, move |_| {
        clone.fetch_add(1, Ordering::SeqCst);
    });

    let job = izi
        .insert(JobBuilder::new("hanging").with_max_attempts(1))
        .await
        .unwrap();

    let dead = wait_for_state(&izi, job.id, JobState::Discarded).await;
    assert_eq!(dead.attempt, 1);
    assert!(dead.errors[0].error.contains("timed out"));
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);

    izi.shutdown(Duration::from_secs(1)).await.unwrap();
    let _ = std::fs::remove_file(script);
}

#[tokio::test]
async fn queue_status_reflects_configuration() {
    let config = Config::new()
        .with_queue(DEFAULT_QUEUE, 7)
        .with_queue_config(QueueConfig::new("imports", 2).paused());
    let mut izi = started(config).await;

    let status = izi.queue_status(DEFAULT_QUEUE).unwrap();
    assert_eq!(status.limit, 7);
    assert!(!status.paused);
    assert_eq!(status.running, 0);

    let all = izi.all_queue_status();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].name, DEFAULT_QUEUE);
    assert_eq!(all[1].name, "imports");
    assert!(all[1].paused);

    izi.shutdown(Duration::ZERO).await.unwrap();
}
