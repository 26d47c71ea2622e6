use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::models::PodcastUpdatedEvent;

/// Coalesces bursts of file events per path: one update is emitted only after
/// `debounce_time` passes with no further event for that path. This keeps a
/// recording that is still being written from triggering feed rebuilds.
pub struct Debouncer {
    debounce_time: Duration,
    clock: Arc<dyn Clock>,
    /// Basenames that never produce updates. The feed file must be in here,
    /// otherwise writing the regenerated feed would re-trigger the watcher
    /// forever.
    ignored_files: HashSet<String>,
    /// Paths waiting out their quiet period, keyed to the last event time.
    pending: Arc<Mutex<HashMap<PathBuf, DateTime<Utc>>>>,
    events: UnboundedSender<PodcastUpdatedEvent>,
}

impl Debouncer {
    pub fn new(
        debounce_time: std::time::Duration,
        ignored_files: impl IntoIterator<Item = String>,
        clock: Arc<dyn Clock>,
        events: UnboundedSender<PodcastUpdatedEvent>,
    ) -> Self {
        Self {
            debounce_time: Duration::from_std(debounce_time).unwrap_or(Duration::minutes(5)),
            clock,
            ignored_files: ignored_files.into_iter().collect(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Feed one raw file event into the debouncer.
    pub fn observe(&self, path: PathBuf) {
        if path.is_dir() {
            return;
        }
        if let Some(name) = path.file_name().and_then(|name| name.to_str())
            && self.ignored_files.contains(name)
        {
            debug!(path = %path.display(), "ignoring event for excluded file");
            return;
        }

        let now = self.clock.now_utc();
        let mut pending = self.pending.lock().unwrap();
        if !pending.contains_key(&path) {
            self.spawn_delayed_check(path.clone());
        }
        pending.insert(path, now);
    }

    /// Wake after the quiet period; if events kept arriving, wait out the
    /// remainder measured from the latest one.
    fn spawn_delayed_check(&self, path: PathBuf) {
        let pending = self.pending.clone();
        let clock = self.clock.clone();
        let events = self.events.clone();
        let debounce_time = self.debounce_time;

        tokio::spawn(async move {
            let mut wait = debounce_time;
            loop {
                tokio::time::sleep(wait.to_std().unwrap_or_default()).await;

                let mut pending_guard = pending.lock().unwrap();
                let Some(last) = pending_guard.get(&path).copied() else {
                    return;
                };

                let now = clock.now_utc();
                if now - last >= debounce_time {
                    pending_guard.remove(&path);
                    drop(pending_guard);
                    info!(path = %path.display(), "file settled after quiet period");
                    let _ = events.send(PodcastUpdatedEvent { episode_path: path });
                    return;
                }
                wait = debounce_time - (now - last);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::clock::testing::TokioClock;

    fn debouncer(
        quiet_secs: u64,
    ) -> (Debouncer, mpsc::UnboundedReceiver<PodcastUpdatedEvent>) {
        let clock = Arc::new(TokioClock::at("2024-01-15T08:00:00Z".parse().unwrap()));
        let (tx, rx) = mpsc::unbounded_channel();
        let debouncer = Debouncer::new(
            StdDuration::from_secs(quiet_secs),
            ["feed.rss".to_string()],
            clock,
            tx,
        );
        (debouncer, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn a_burst_collapses_to_one_event_timed_from_the_last_write() {
        let (debouncer, mut rx) = debouncer(300);
        let path = PathBuf::from("/data/morning-show/episode.mp3");

        // Writes at t=0s and t=120s; quiet from then on.
        debouncer.observe(path.clone());
        tokio::time::sleep(StdDuration::from_secs(120)).await;
        debouncer.observe(path.clone());

        // At t=270s nothing has settled yet.
        tokio::time::sleep(StdDuration::from_secs(150)).await;
        assert!(rx.try_recv().is_err());

        // The quiet period ends 300s after the LAST write, at t=420s.
        tokio::time::sleep(StdDuration::from_secs(600)).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.episode_path, path);
        assert!(rx.try_recv().is_err(), "must fire exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn feed_file_events_never_fire() {
        let (debouncer, mut rx) = debouncer(1);
        debouncer.observe(PathBuf::from("/data/morning-show/feed.rss"));

        tokio::time::sleep(StdDuration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_paths_fire_independently() {
        let (debouncer, mut rx) = debouncer(10);
        let first = PathBuf::from("/data/morning-show/a.mp3");
        let second = PathBuf::from("/data/night-owls/b.mp3");

        debouncer.observe(first.clone());
        debouncer.observe(second.clone());

        tokio::time::sleep(StdDuration::from_secs(60)).await;
        let mut fired = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        fired.sort_by(|a, b| a.episode_path.cmp(&b.episode_path));
        assert_eq!(fired[0].episode_path, first);
        assert_eq!(fired[1].episode_path, second);
    }

    #[tokio::test(start_paused = true)]
    async fn a_path_can_debounce_again_after_firing() {
        let (debouncer, mut rx) = debouncer(10);
        let path = PathBuf::from("/data/morning-show/a.mp3");

        debouncer.observe(path.clone());
        tokio::time::sleep(StdDuration::from_secs(30)).await;
        assert_eq!(rx.recv().await.unwrap().episode_path, path);

        debouncer.observe(path.clone());
        tokio::time::sleep(StdDuration::from_secs(30)).await;
        assert_eq!(rx.recv().await.unwrap().episode_path, path);
        assert!(rx.try_recv().is_err());
    }
}
