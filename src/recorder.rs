use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, CountdownTimer, SystemClock};
use crate::config::RecorderConfig;
use crate::daemon;
use crate::schedule::RecordingSchedule;
use crate::storage;
use crate::stream::StreamFetcher;

/// Grace before the first firing when the daemon boots inside an active
/// window, so the scheduler finishes starting up first.
const STARTUP_GRACE_SECS: i64 = 5;

/// RAII guard that removes a schedule from the in-flight set on drop.
/// Ensures cleanup even if the recording job panics.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<Uuid>>>,
    schedule_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.schedule_id);
    }
}

/// Run the recording service until SIGINT/SIGTERM.
pub async fn run(config: RecorderConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let schedules = config
        .build_schedules(clock.as_ref())
        .context("building recording schedules")?;
    let fetcher = Arc::new(StreamFetcher::new(config.chunk_size).context("building HTTP client")?);

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(scheduler_loop(
        schedules,
        fetcher,
        clock,
        cancel.clone(),
    ));

    daemon::wait_for_shutdown().await;
    info!("shutdown signal received");
    cancel.cancel();

    // Running jobs exit at their next suspension point; partial recordings
    // stay on disk.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), scheduler).await;
    info!("shutdown complete");
    Ok(())
}

/// Main scheduler loop. Sleeps until the earliest armed firing, spawns one
/// job per due schedule, re-arms from the cron trigger. A job failure never
/// stops the loop; overlapping firings of the same schedule are skipped.
async fn scheduler_loop(
    schedules: Vec<RecordingSchedule>,
    fetcher: Arc<StreamFetcher>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    info!(schedules = schedules.len(), "recording scheduler started");

    let in_flight: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));

    let now = clock.now_utc();
    let mut next_fire: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    for schedule in &schedules {
        match initial_fire(schedule, now) {
            Some(at) => {
                info!(schedule = %schedule.title, next_run = %at, "job armed");
                next_fire.insert(schedule.id, at);
            }
            None => {
                warn!(schedule = %schedule.title, "cron trigger yields no firing, schedule disarmed");
            }
        }
    }

    loop {
        let now = clock.now_utc();
        let Some(earliest) = next_fire.values().min().copied() else {
            warn!("no schedules armed, scheduler idle until shutdown");
            cancel.cancelled().await;
            return;
        };

        let wait = (earliest - now).to_std().unwrap_or(std::time::Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduler shutting down");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let now = clock.now_utc();
        for schedule in &schedules {
            let Some(due) = next_fire.get(&schedule.id).copied() else {
                continue;
            };
            if due > now {
                continue;
            }

            // Re-arm before the job runs; its outcome never changes the cadence.
            match schedule.next_fire(now) {
                Some(at) => {
                    next_fire.insert(schedule.id, at);
                }
                None => {
                    warn!(schedule = %schedule.title, "cron trigger exhausted, schedule disarmed");
                    next_fire.remove(&schedule.id);
                }
            }

            // Two firings of the same schedule never overlap; a late-running
            // one makes the next firing a skip, not a queue entry.
            if in_flight.lock().unwrap().contains(&schedule.id) {
                warn!(schedule = %schedule.title, "previous firing still running, skipping");
                continue;
            }
            in_flight.lock().unwrap().insert(schedule.id);

            let schedule = schedule.clone();
            let fetcher = fetcher.clone();
            let clock = clock.clone();
            let cancel = cancel.clone();
            let in_flight = in_flight.clone();

            tokio::spawn(async move {
                let _guard = InFlightGuard {
                    set: in_flight,
                    schedule_id: schedule.id,
                };

                info!(schedule = %schedule.title, "recording job starting");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(schedule = %schedule.title, "recording job cancelled");
                    }
                    result = run_recording_job(&schedule, &fetcher, clock) => match result {
                        Ok(bytes) => {
                            info!(schedule = %schedule.title, bytes, "recording job complete");
                        }
                        Err(e) => {
                            error!(schedule = %schedule.title, error = %e, "recording job failed");
                        }
                    }
                }
            });
        }
    }
}

/// First firing for a schedule at daemon start. Booting inside an active
/// window fires after a short grace instead of waiting a whole cron period.
fn initial_fire(schedule: &RecordingSchedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let window = schedule.current_or_next_window(now);
    if window.is_active(now) {
        let at = now + Duration::seconds(STARTUP_GRACE_SECS);
        info!(
            schedule = %schedule.title,
            next_run = %at,
            "started inside an active recording window, job will run after the grace period"
        );
        return Some(at);
    }
    schedule.next_fire(now)
}

/// One firing: resolve the window, wait for its start, then stream the
/// remaining duration into the task's output file.
async fn run_recording_job(
    schedule: &RecordingSchedule,
    fetcher: &StreamFetcher,
    clock: Arc<dyn Clock>,
) -> Result<u64> {
    let now = clock.now_utc();
    let task = schedule.current_or_next_task(now);
    info!(
        task = %task.id,
        window_start = %task.window.start(),
        window_end = %task.window.end(),
        path = %task.file_path.display(),
        "resolved recording task"
    );

    let until_start = task.window.time_until_start(now);
    if until_start > Duration::zero() {
        info!(task = %task.id, wait = %until_start, "waiting for window start");
        tokio::time::sleep(until_start.to_std().unwrap_or_default()).await;
    }

    let now = clock.now_utc();
    let remaining = task.window.time_remaining(now);
    if remaining <= Duration::zero() {
        // The window was resolved moments ago; ending up past it is a bug.
        bail!(
            "window {}..{} already over at {now}",
            task.window.start(),
            task.window.end()
        );
    }

    let mut countdown = CountdownTimer::new(remaining, clock.clone());
    countdown.start()?;
    let chunks = fetcher.fetch(&task.stream_url, countdown);

    let bytes = storage::store(chunks, &task.file_path, &schedule.metadata)
        .await
        .with_context(|| format!("recording task {}", task.id))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use super::*;
    use crate::models::ValidUrl;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn schedule_at(start_utc: &str, duration_hours: i64, url: &str, dir: &Path) -> RecordingSchedule {
        RecordingSchedule::new(
            "Morning Show",
            start_utc.parse().unwrap(),
            Duration::hours(duration_hours),
            ValidUrl::parse(url).unwrap(),
            dir,
            BTreeMap::new(),
            "*",
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn boot_inside_active_window_fires_after_grace() {
        let s = schedule_at("08:00:00", 2, "http://example.invalid/radio", Path::new("/data"));
        let now = utc("2024-01-15T09:30:00Z");
        assert_eq!(initial_fire(&s, now), Some(utc("2024-01-15T09:30:05Z")));
    }

    #[test]
    fn boot_outside_window_waits_for_the_cron_instant() {
        let s = schedule_at("08:00:00", 2, "http://example.invalid/radio", Path::new("/data"));
        assert_eq!(
            initial_fire(&s, utc("2024-01-15T07:59:55Z")),
            Some(utc("2024-01-15T08:00:00Z"))
        );
        assert_eq!(
            initial_fire(&s, utc("2024-01-15T12:00:00Z")),
            Some(utc("2024-01-16T08:00:00Z"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn job_sleeps_until_the_window_start_before_recording() {
        use crate::clock::testing::TokioClock;

        let dir = tempfile::tempdir().unwrap();
        let s = schedule_at("08:00:00", 2, "http://127.0.0.1:9/stream", dir.path());
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::at(utc("2024-01-15T07:59:55Z")));
        let fetcher = StreamFetcher::new(1024).unwrap();

        // The pre-start sleep is taken (auto-advanced here), after which the
        // unreachable stream fails the job with the full window remaining.
        let result = run_recording_job(&s, &fetcher, clock.clone()).await;
        assert!(result.is_err());
        assert!(clock.now_utc() >= utc("2024-01-15T08:00:00Z"));
    }

    #[tokio::test]
    async fn failed_fetch_surfaces_as_a_job_error() {
        use crate::clock::testing::FixedClock;

        let dir = tempfile::tempdir().unwrap();
        // Nothing listens on the discard port; the connect fails immediately
        // and the job reports the failure instead of panicking.
        let s = schedule_at("08:00:00", 2, "http://127.0.0.1:9/stream", dir.path());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(utc("2024-01-15T09:00:00Z")));
        let fetcher = StreamFetcher::new(1024).unwrap();

        let result = run_recording_job(&s, &fetcher, clock).await;
        assert!(result.is_err());
    }
}
