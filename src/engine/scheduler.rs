use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::Sender;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::engine::executor::Executor;
use crate::stats::Metric;
use crate::workload::Workload;

/// How dispatch events are produced over the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleConfig {
    /// Open loop: dispatch instants spaced at `time_unit / rate` for
    /// `duration`, independent of response latency. A saturated worker
    /// pool delays dispatches (recorded as arrival delay), never drops
    /// them; `max_workers` bounds the in-flight count.
    ConstantArrivalRate {
        rate: u64,
        time_unit: Duration,
        duration: Duration,
        /// Pre-allocated worker hint, used for pool sizing
        workers: usize,
        max_workers: usize,
    },
    /// Closed loop: `workers` independent tasks issue requests
    /// back-to-back until `duration` elapses, with an optional pause
    /// between iterations.
    FixedConcurrency {
        workers: usize,
        duration: Duration,
        pause: Duration,
    },
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                max_workers,
                ..
            } => {
                if *rate == 0 {
                    anyhow::bail!("constant-arrival-rate requires rate > 0");
                }
                if time_unit.is_zero() {
                    anyhow::bail!("constant-arrival-rate requires time_unit > 0");
                }
                if duration.is_zero() {
                    anyhow::bail!("constant-arrival-rate requires duration > 0");
                }
                if *max_workers == 0 {
                    anyhow::bail!("constant-arrival-rate requires max_workers > 0");
                }
            }
            Self::FixedConcurrency {
                workers, duration, ..
            } => {
                if *workers == 0 {
                    anyhow::bail!("fixed-concurrency requires workers > 0");
                }
                if duration.is_zero() {
                    anyhow::bail!("fixed-concurrency requires duration > 0");
                }
            }
        }
        Ok(())
    }

    /// The in-flight ceiling this schedule can reach.
    pub fn worker_ceiling(&self) -> usize {
        match self {
            Self::ConstantArrivalRate { max_workers, .. } => *max_workers,
            Self::FixedConcurrency { workers, .. } => *workers,
        }
    }
}

/// Total dispatch events for a constant-arrival-rate schedule:
/// floor(rate x duration / time_unit).
pub fn dispatch_count(rate: u64, time_unit: Duration, duration: Duration) -> u64 {
    (duration.as_nanos() * rate as u128 / time_unit.as_nanos()) as u64
}

/// Offset of dispatch instant `i` from run start. Computed per-event from
/// the rate so truncation never accumulates drift.
fn dispatch_offset(i: u64, rate: u64, time_unit: Duration) -> Duration {
    Duration::from_nanos((i as u128 * time_unit.as_nanos() / rate as u128) as u64)
}

/// Drive one scenario to completion: consume the schedule's dispatch
/// events, run them through the executor, and stream results to the
/// aggregator. Returns once in-flight requests have drained.
pub async fn run(
    schedule: ScheduleConfig,
    executor: Arc<Executor>,
    workload: Arc<Workload>,
    tx: Sender<Metric>,
) {
    match schedule {
        ScheduleConfig::ConstantArrivalRate {
            rate,
            time_unit,
            duration,
            max_workers,
            ..
        } => {
            let total = dispatch_count(rate, time_unit, duration);
            let semaphore = Arc::new(Semaphore::new(max_workers));
            let start = Instant::now();
            let mut tasks = JoinSet::new();

            for i in 0..total {
                let target = start + dispatch_offset(i, rate, time_unit);
                tokio::time::sleep_until(target).await;

                // Reap completed tasks as we go so the set stays small
                while tasks.try_join_next().is_some() {}

                // Saturation queues the event behind a free slot instead of
                // dropping it; the wait shows up in the arrival delay metric
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                let delay = Instant::now().saturating_duration_since(target);
                let _ = tx.send(Metric::ArrivalDelay { delay });

                let executor = executor.clone();
                let workload = workload.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    let spec = workload.next();
                    let result = executor.dispatch(&spec).await;
                    let _ = tx.send(Metric::Result(result));
                    drop(permit);
                });
            }

            // Drain in-flight requests; each is bounded by its own timeout
            while tasks.join_next().await.is_some() {}
        }
        ScheduleConfig::FixedConcurrency {
            workers,
            duration,
            pause,
        } => {
            let deadline = Instant::now() + duration;
            let mut tasks = JoinSet::new();

            for _ in 0..workers {
                let executor = executor.clone();
                let workload = workload.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    while Instant::now() < deadline {
                        let spec = workload.next();
                        let result = executor.dispatch(&spec).await;
                        let _ = tx.send(Metric::Result(result));
                        if !pause.is_zero() {
                            tokio::time::sleep(pause).await;
                        }
                    }
                });
            }

            while tasks.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_count_is_rate_times_duration() {
        let s = Duration::from_secs(1);
        assert_eq!(dispatch_count(200, s, Duration::from_secs(5)), 1000);
        assert_eq!(dispatch_count(1, s, Duration::from_secs(10)), 10);
        // Fractional products truncate
        assert_eq!(dispatch_count(3, s, Duration::from_millis(500)), 1);
        assert_eq!(dispatch_count(200, Duration::from_secs(60), s), 3);
    }

    #[test]
    fn test_dispatch_offsets_do_not_drift() {
        let s = Duration::from_secs(1);
        // 3 per second: offsets at 0, 1/3, 2/3; the 300th lands at 100s
        assert_eq!(dispatch_offset(0, 3, s), Duration::ZERO);
        assert_eq!(dispatch_offset(1, 3, s), Duration::from_nanos(333_333_333));
        assert_eq!(dispatch_offset(300, 3, s), Duration::from_secs(100));
    }

    #[test]
    fn test_validation_rejects_zero_parameters() {
        let bad_rate = ScheduleConfig::ConstantArrivalRate {
            rate: 0,
            time_unit: Duration::from_secs(1),
            duration: Duration::from_secs(5),
            workers: 10,
            max_workers: 100,
        };
        assert!(bad_rate.validate().is_err());

        let bad_duration = ScheduleConfig::FixedConcurrency {
            workers: 10,
            duration: Duration::ZERO,
            pause: Duration::ZERO,
        };
        assert!(bad_duration.validate().is_err());

        let bad_workers = ScheduleConfig::FixedConcurrency {
            workers: 0,
            duration: Duration::from_secs(5),
            pause: Duration::ZERO,
        };
        assert!(bad_workers.validate().is_err());
    }

    #[test]
    fn test_worker_ceiling() {
        let open = ScheduleConfig::ConstantArrivalRate {
            rate: 200,
            time_unit: Duration::from_secs(1),
            duration: Duration::from_secs(5),
            workers: 100,
            max_workers: 500,
        };
        assert_eq!(open.worker_ceiling(), 500);

        let closed = ScheduleConfig::FixedConcurrency {
            workers: 32,
            duration: Duration::from_secs(5),
            pause: Duration::ZERO,
        };
        assert_eq!(closed.worker_ceiling(), 32);
    }
}
