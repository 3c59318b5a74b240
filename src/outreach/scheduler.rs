//! In-process interval tickers for the three sequence jobs.
//!
//! Each configured job gets its own task. A tick runs exactly one invocation
//! and logs the outcome; errors never stop the ticker.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use super::dispatch::{DispatchEngine, FollowUpOptions};
use super::reconcile::MailboxReconciler;
use crate::config::ScheduleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Warmup,
    FollowUp,
    Reconcile,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Job::Warmup => "warmup",
            Job::FollowUp => "followup",
            Job::Reconcile => "reconcile",
        })
    }
}

/// Running tickers plus the flag that stops them.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn job_count(&self) -> usize {
        self.handles.len()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Stop every ticker. An invocation cut off mid-send leaves its claim to
    /// expire with the lease.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles {
            handle.abort();
            if let Err(e) = handle.await
                && e.is_panic()
            {
                error!("Scheduler task panicked: {e}");
            }
        }
    }
}

/// Spawn one ticker per configured interval.
pub fn spawn_scheduler(
    config: &ScheduleConfig,
    dispatch: Arc<DispatchEngine>,
    reconciler: Arc<MailboxReconciler>,
) -> Scheduler {
    let shutdown = Arc::new(AtomicBool::new(false));
    let jobs = [
        (Job::Warmup, config.warmup_interval),
        (Job::FollowUp, config.followup_interval),
        (Job::Reconcile, config.reconcile_interval),
    ];

    let handles = jobs
        .into_iter()
        .filter_map(|(job, every)| every.map(|every| (job, every)))
        .map(|(job, every)| {
            spawn_ticker(
                job,
                every,
                Arc::clone(&dispatch),
                Arc::clone(&reconciler),
                Arc::clone(&shutdown),
            )
        })
        .collect();

    Scheduler { handles, shutdown }
}

fn spawn_ticker(
    job: Job,
    every: Duration,
    dispatch: Arc<DispatchEngine>,
    reconciler: Arc<MailboxReconciler>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(job = %job, "Ticker started, every {}s", every.as_secs());
        let mut tick = tokio::time::interval(every);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!(job = %job, "Ticker shutting down");
                return;
            }

            run_once(job, &dispatch, &reconciler).await;
        }
    })
}

/// Run a single invocation of `job` and log what it did.
pub async fn run_once(job: Job, dispatch: &DispatchEngine, reconciler: &MailboxReconciler) {
    match job {
        Job::Warmup => match dispatch.first_send().await {
            Ok(report) => info!(job = %job, sent = report.sent, "{}", report.message),
            Err(e) => error!(job = %job, error = %e, "Scheduled run failed"),
        },
        Job::FollowUp => match dispatch.follow_up(&FollowUpOptions::default()).await {
            Ok(report) => info!(
                job = %job,
                sent = report.sent,
                failed = report.failed,
                "{}",
                report.message
            ),
            Err(e) => error!(job = %job, error = %e, "Scheduled run failed"),
        },
        Job::Reconcile => match reconciler.reconcile(None).await {
            Ok(report) => info!(
                job = %job,
                responses = report.responses_found,
                bounces = report.bounces_found,
                "{}",
                report.message
            ),
            Err(e) => error!(job = %job, error = %e, "Scheduled run failed"),
        },
    }
}
