use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::InvalidUrl;

/// An absolute http(s) URL, validated at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ValidUrl(Url);

impl ValidUrl {
    pub fn parse(value: &str) -> Result<Self, InvalidUrl> {
        let url = Url::parse(value).map_err(|_| InvalidUrl(value.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(InvalidUrl(value.to_string()));
        }
        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Resolve a (possibly relative) reference against this URL.
    pub fn join(&self, reference: &str) -> Result<Self, InvalidUrl> {
        let joined = self
            .0
            .join(reference)
            .map_err(|_| InvalidUrl(reference.to_string()))?;
        Ok(Self(joined))
    }
}

impl fmt::Display for ValidUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for ValidUrl {
    type Error = InvalidUrl;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ValidUrl> for String {
    fn from(url: ValidUrl) -> Self {
        url.0.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Mp4,
}

impl AudioFormat {
    /// HLS playlist URLs produce mp4 segments; everything else is treated as mp3.
    pub fn for_stream_url(url: &ValidUrl) -> Self {
        if url.as_str().ends_with(".m3u8") {
            AudioFormat::Mp4
        } else {
            AudioFormat::Mp3
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Mp4 => "mp4",
        }
    }
}

/// One recorded file in a podcast directory, reconstructed from its file name.
#[derive(Debug, Clone)]
pub struct PodcastEpisode {
    pub date: DateTime<Utc>,
    pub title: String,
    pub uuid: String,
    pub file_size_bytes: u64,
    pub file_name: String,
}

/// A station directory mapped to podcast metadata plus its episodes.
#[derive(Debug, Clone)]
pub struct Podcast {
    pub title: String,
    pub episodes: Vec<PodcastEpisode>,
    /// Directory name under the base directory.
    pub file_name: String,
    pub description: Option<String>,
    pub image_url: Option<ValidUrl>,
}

/// Contents of a podcast directory's `metadata.yml`, written by the recorder.
/// Unknown keys are ignored; every field is optional so a hand-made directory
/// still gets a feed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodcastMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

/// Emitted by the debouncer once an episode file has stabilised on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodcastUpdatedEvent {
    pub episode_path: PathBuf,
}
