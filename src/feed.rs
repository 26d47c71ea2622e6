use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use rss::{Channel, ChannelBuilder, EnclosureBuilder, GuidBuilder, ImageBuilder, ItemBuilder};
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::models::{Podcast, PodcastEpisode, PodcastMetadata, ValidUrl};
use crate::storage::METADATA_FILE_NAME;

pub const FEED_FILE_NAME: &str = "feed.rss";

/// Canonical episode file name grammar, shared by producer and consumer:
/// `2023-04-03--1200-1400--episode-title--ee1ad7c6-95bf-4116-a1f8-060053e80a73.mp3`
static EPISODE_FILE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<date>\d{4}-\d{2}-\d{2})--(?P<start_time>\d{4})-(?P<end_time>\d{4})--(?P<title>.*?)--(?P<uuid>[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12})\.(?P<file_ext>mp3|mp4)$",
    )
    .expect("episode file pattern must compile")
});

/// Fields carried by a canonical episode file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEpisodeName {
    pub date: DateTime<Utc>,
    pub start_time: String,
    pub end_time: String,
    pub slug: String,
    pub uuid: String,
    pub extension: String,
}

/// Parse an episode file name; anything not matching the grammar is not an
/// episode.
pub fn parse_episode_file_name(name: &str) -> Option<ParsedEpisodeName> {
    let captures = EPISODE_FILE_PATTERN.captures(name)?;
    let date = NaiveDate::parse_from_str(&captures["date"], "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)?
        .and_utc();
    Some(ParsedEpisodeName {
        date,
        start_time: captures["start_time"].to_string(),
        end_time: captures["end_time"].to_string(),
        slug: captures["title"].to_string(),
        uuid: captures["uuid"].to_string(),
        extension: captures["file_ext"].to_string(),
    })
}

/// Map a podcast directory to the domain model. Files not matching the
/// episode grammar (the feed file, metadata, strays) are ignored.
pub fn load_podcast(dir: &Path) -> Result<Podcast, FeedError> {
    debug!(dir = %dir.display(), "loading podcast");
    if !dir.is_dir() {
        return Err(FeedError::MissingDir(dir.to_path_buf()));
    }
    let dir_name = dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    let metadata = read_metadata(dir);
    let title = metadata
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| titleize(&dir_name));

    let image_url = metadata.image_url.as_deref().and_then(|value| {
        ValidUrl::parse(value)
            .inspect_err(|e| warn!(dir = %dir.display(), error = %e, "ignoring bad image_url"))
            .ok()
    });

    let mut episodes = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| FeedError::ReadDir {
        path: dir.to_path_buf(),
        source: e,
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| FeedError::ReadDir {
            path: dir.to_path_buf(),
            source: e,
        })?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(parsed) = parse_episode_file_name(&file_name) else {
            continue;
        };

        let file_size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if file_size_bytes == 0 {
            debug!(file = %file_name, "skipping empty episode file");
            continue;
        }

        episodes.push(PodcastEpisode {
            title: parsed.date.format("%Y-%m-%d").to_string(),
            date: parsed.date,
            uuid: parsed.uuid,
            file_size_bytes,
            file_name,
        });
    }

    // Newest first, with the file name as a stable tie-breaker.
    episodes.sort_by(|a, b| b.file_name.cmp(&a.file_name));

    debug!(podcast = %title, episodes = episodes.len(), "podcast loaded");
    Ok(Podcast {
        title,
        episodes,
        file_name: dir_name,
        description: metadata.description,
        image_url,
    })
}

fn read_metadata(dir: &Path) -> PodcastMetadata {
    let path = dir.join(METADATA_FILE_NAME);
    let Ok(content) = std::fs::read_to_string(&path) else {
        return PodcastMetadata::default();
    };
    serde_yml::from_str(&content).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "unreadable metadata file, using defaults");
        PodcastMetadata::default()
    })
}

/// `morning-show` back to `Morning Show`, for directories without metadata.
fn titleize(dir_name: &str) -> String {
    dir_name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Regenerates `feed.rss` files under the base directory. A single writer
/// holds the feed-write lock, so concurrent debounce fires cannot interleave
/// bytes of the same or different feeds.
pub struct FeedService {
    base_dir: PathBuf,
    base_url: ValidUrl,
    write_lock: tokio::sync::Mutex<()>,
}

impl FeedService {
    pub fn new(base_dir: PathBuf, base_url: ValidUrl) -> Self {
        Self {
            base_dir,
            base_url,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Regenerate feeds for every podcast directory under the base dir.
    /// Per-podcast failures are logged; the rest still update.
    pub async fn update_all(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.base_dir)
            .with_context(|| format!("reading base directory {}", self.base_dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let dir = entry.path();
            if let Err(e) = self.update_podcast_dir(&dir).await {
                warn!(dir = %dir.display(), error = %e, "feed update failed");
            }
        }
        Ok(())
    }

    /// Regenerate the feed of the podcast directory containing this episode.
    pub async fn update_for_episode(&self, episode_path: &Path) -> Result<PathBuf> {
        let dir = episode_path
            .parent()
            .with_context(|| format!("episode path {} has no parent", episode_path.display()))?;
        self.update_podcast_dir(dir).await
    }

    pub async fn update_podcast_dir(&self, dir: &Path) -> Result<PathBuf> {
        let podcast = load_podcast(dir)?;
        let channel = self.build_channel(&podcast)?;
        let feed_path = self.write_feed(dir, &channel).await?;
        info!(
            podcast = %podcast.title,
            episodes = podcast.episodes.len(),
            path = %feed_path.display(),
            "podcast feed updated"
        );
        Ok(feed_path)
    }

    fn build_channel(&self, podcast: &Podcast) -> Result<Channel> {
        let podcast_url = self
            .base_url
            .join(&format!("{}/", slug::slugify(&podcast.title)))
            .context("building podcast url")?;

        let mut items = Vec::with_capacity(podcast.episodes.len());
        for episode in &podcast.episodes {
            let episode_url = podcast_url
                .join(&episode.file_name)
                .with_context(|| format!("building episode url for {}", episode.file_name))?;

            let enclosure = EnclosureBuilder::default()
                .url(episode_url.to_string())
                .length(episode.file_size_bytes.to_string())
                .mime_type("audio/mpeg".to_string())
                .build();
            // The UUID is unique across podcasts, which is exactly what a
            // permanent guid needs.
            let guid = GuidBuilder::default()
                .value(episode.uuid.clone())
                .permalink(true)
                .build();

            items.push(
                ItemBuilder::default()
                    .title(Some(episode.title.clone()))
                    .link(Some(episode_url.to_string()))
                    .enclosure(Some(enclosure))
                    .guid(Some(guid))
                    .pub_date(Some(episode.date.to_rfc2822()))
                    .build(),
            );
        }

        let image = podcast.image_url.as_ref().map(|image_url| {
            ImageBuilder::default()
                .url(image_url.to_string())
                .title(podcast.title.clone())
                .link(podcast_url.to_string())
                .build()
        });

        Ok(ChannelBuilder::default()
            .title(podcast.title.clone())
            .link(podcast_url.to_string())
            // A channel must carry a description; fall back to the title.
            .description(
                podcast
                    .description
                    .clone()
                    .unwrap_or_else(|| podcast.title.clone()),
            )
            .image(image)
            .items(items)
            .build())
    }

    /// Write the feed atomically: render into a temp file in the same
    /// directory, then rename over `feed.rss` under the write lock.
    async fn write_feed(&self, dir: &Path, channel: &Channel) -> Result<PathBuf, FeedError> {
        let feed_path = dir.join(FEED_FILE_NAME);
        let _lock = self.write_lock.lock().await;

        let to_feed_error = |source: std::io::Error| FeedError::WriteFeed {
            path: feed_path.clone(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(to_feed_error)?;
        channel
            .pretty_write_to(&mut tmp, b' ', 2)
            .map_err(|e| to_feed_error(std::io::Error::other(e)))?;
        tmp.persist(&feed_path)
            .map_err(|e| to_feed_error(e.error))?;
        Ok(feed_path)
    }
}
