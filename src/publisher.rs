use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::PublisherConfig;
use crate::daemon;
use crate::debounce::Debouncer;
use crate::feed::{self, FeedService};
use crate::watcher;

const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run the feed publisher service until SIGINT/SIGTERM.
pub async fn run(config: PublisherConfig) -> Result<()> {
    config.validate()?;
    let base_url = config.base_url()?;
    let debounce_time = config.debounce_time()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let feeds = Arc::new(FeedService::new(config.base_directory.clone(), base_url));

    if config.should_update_feeds_on_startup {
        info!("updating all podcast feeds on startup");
        feeds.update_all().await.context("startup feed update")?;
    }

    let (watcher, mut file_events) =
        watcher::spawn(&config.base_directory, WATCH_POLL_INTERVAL)?;
    info!(
        dir = %config.base_directory.display(),
        debounce = %humantime::format_duration(debounce_time),
        "watching for podcast changes"
    );

    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    let debouncer = Debouncer::new(
        debounce_time,
        [feed::FEED_FILE_NAME.to_string()],
        clock,
        updates_tx,
    );

    let cancel = CancellationToken::new();
    let worker = {
        let feeds = feeds.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("feed publisher shutting down");
                        return;
                    }
                    event = file_events.recv() => {
                        match event {
                            Some(event) => debouncer.observe(event.path),
                            None => {
                                warn!("watcher channel closed");
                                return;
                            }
                        }
                    }
                    update = updates.recv() => {
                        let Some(update) = update else { continue };
                        // The feed-write lock inside FeedService serializes
                        // concurrent fires.
                        let feeds = feeds.clone();
                        tokio::spawn(async move {
                            if let Err(e) = feeds.update_for_episode(&update.episode_path).await {
                                error!(
                                    path = %update.episode_path.display(),
                                    error = %e,
                                    "feed update failed"
                                );
                            }
                        });
                    }
                }
            }
        })
    };

    daemon::wait_for_shutdown().await;
    info!("shutdown signal received");
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(10), worker).await;
    drop(watcher);
    info!("shutdown complete");
    Ok(())
}
