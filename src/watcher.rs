use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A create/modify/delete observed on a file under the watched root.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: EventKind,
    pub path: PathBuf,
}

/// Start a recursive polling watcher rooted at `root`. Polling is deliberate:
/// native OS events are not reliably emitted for files another process is
/// still writing (notably on Windows). The returned watcher handle must stay
/// alive; dropping it stops the polling thread.
pub fn spawn(
    root: &Path,
    poll_interval: Duration,
) -> Result<(PollWatcher, mpsc::UnboundedReceiver<FileEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let config = notify::Config::default().with_poll_interval(poll_interval);
    let mut watcher = PollWatcher::new(
        move |result: notify::Result<Event>| match result {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                let kind = event.kind;
                for path in event.paths {
                    // Directory events are noise; every file change also
                    // touches its directory.
                    if path.is_dir() {
                        continue;
                    }
                    debug!(kind = ?kind, path = %path.display(), "file event");
                    let _ = tx.send(FileEvent { kind, path });
                }
            }
            Err(e) => {
                // Never stops the service; polling resumes on the next tick.
                error!(error = %e, "filesystem watch error");
            }
        },
        config,
    )
    .context("creating poll watcher")?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("watching {}", root.display()))?;

    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_files_created_under_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, mut rx) = spawn(dir.path(), Duration::from_millis(50)).unwrap();

        let podcast_dir = dir.path().join("morning-show");
        std::fs::create_dir(&podcast_dir).unwrap();
        std::fs::write(podcast_dir.join("episode.mp3"), b"abc").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("watcher channel closed");
                if event
                    .path
                    .file_name()
                    .is_some_and(|name| name == "episode.mp3")
                {
                    return event;
                }
            }
        })
        .await
        .expect("no file event within timeout");

        assert!(event.path.ends_with("morning-show/episode.mp3"));
        drop(watcher);
    }
}
