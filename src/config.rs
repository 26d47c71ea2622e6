use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::clock::Clock;
use crate::error::ConfigError;
use crate::models::ValidUrl;
use crate::schedule::{self, RecordingSchedule};

#[derive(Debug, Deserialize)]
pub struct RecorderConfig {
    pub stream_url: String,
    pub output_dir: PathBuf,
    pub time_zone: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Bytes per chunk yielded by the stream client.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    pub recording_schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub title: String,
    pub start_timeofday: String,
    pub end_timeofday: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default = "default_frequency")]
    pub frequency: String,
}

#[derive(Debug, Deserialize)]
pub struct PublisherConfig {
    pub base_directory: PathBuf,
    pub base_url: String,
    #[serde(default)]
    pub should_update_feeds_on_startup: bool,
    /// Quiet period before a changed episode file triggers a feed rebuild.
    #[serde(default = "default_debounce_time")]
    pub debounce_time: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_chunk_size() -> usize {
    1024
}
fn default_frequency() -> String {
    "*".to_string()
}
fn default_debounce_time() -> String {
    "5m".to_string()
}

pub fn load_recorder_config(path: &Path) -> Result<RecorderConfig> {
    load_yaml(path)
}

pub fn load_publisher_config(path: &Path) -> Result<PublisherConfig> {
    load_yaml(path)
}

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = serde_yml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

impl RecorderConfig {
    /// Validate the raw config and convert it into domain schedules.
    /// `clock` supplies "today" for the local-to-UTC start time conversion.
    pub fn build_schedules(&self, clock: &dyn Clock) -> Result<Vec<RecordingSchedule>> {
        if self.recording_schedules.is_empty() {
            return Err(ConfigError::Validation(
                "recording_schedules cannot be empty".to_string(),
            )
            .into());
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Validation("chunk_size cannot be 0".to_string()).into());
        }

        let stream_url = url_value(&self.stream_url)
            .map_err(|e| ConfigError::Validation(format!("stream_url: {e}")))?;
        let zone: Tz = self.time_zone.parse().map_err(|_| {
            ConfigError::Validation(format!("unknown time zone '{}'", self.time_zone))
        })?;
        let now = clock.now_utc();

        let mut schedules = Vec::with_capacity(self.recording_schedules.len());
        for raw in &self.recording_schedules {
            let start_local = parse_timeofday(&raw.start_timeofday)?;
            let end_local = parse_timeofday(&raw.end_timeofday)?;

            // Duration in local time first, so a period crossing midnight
            // keeps its length through the zone conversion.
            let duration = schedule::duration_between(start_local, end_local);
            let start_utc = schedule::timeofday_to_utc(start_local, zone, now)?;

            let image_url = match &raw.image_url {
                Some(value) => Some(url_value(value).map_err(|e| {
                    ConfigError::Validation(format!("schedule '{}': image_url: {e}", raw.title))
                })?),
                None => None,
            };

            let schedule = RecordingSchedule::new(
                &raw.title,
                start_utc,
                duration,
                stream_url.clone(),
                &self.output_dir,
                raw.metadata_map(),
                &raw.frequency,
                raw.description.clone(),
                image_url,
            )?;
            schedules.push(schedule);
        }

        Ok(schedules)
    }
}

impl ScheduleConfig {
    /// The mapping persisted as the podcast directory's `metadata.yml`.
    /// BTreeMap keeps the serialization stable across runs.
    pub fn metadata_map(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("title".to_string(), self.title.clone());
        metadata.insert(
            "start_timeofday".to_string(),
            self.start_timeofday.clone(),
        );
        metadata.insert("end_timeofday".to_string(), self.end_timeofday.clone());
        metadata.insert("frequency".to_string(), self.frequency.clone());
        if let Some(description) = &self.description {
            metadata.insert("description".to_string(), description.clone());
        }
        if let Some(image_url) = &self.image_url {
            metadata.insert("image_url".to_string(), image_url.clone());
        }
        metadata
    }
}

impl PublisherConfig {
    pub fn base_url(&self) -> Result<ValidUrl, ConfigError> {
        url_value(&self.base_url).map_err(|e| ConfigError::Validation(format!("base_url: {e}")))
    }

    pub fn debounce_time(&self) -> Result<std::time::Duration, ConfigError> {
        humantime::parse_duration(&self.debounce_time).map_err(|e| {
            ConfigError::Validation(format!(
                "invalid debounce_time '{}': {e}",
                self.debounce_time
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.base_url()?;
        self.debounce_time()?;

        // Fail fast when the base directory is missing or unreadable.
        std::fs::read_dir(&self.base_directory).map_err(|e| {
            ConfigError::Validation(format!(
                "base_directory '{}' is not readable: {e}",
                self.base_directory.display()
            ))
        })?;
        Ok(())
    }
}

fn url_value(value: &str) -> Result<ValidUrl, String> {
    if value.trim().is_empty() {
        return Err("url cannot be empty".to_string());
    }
    ValidUrl::parse(value).map_err(|e| e.to_string())
}

fn parse_timeofday(value: &str) -> Result<NaiveTime, ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Validation(
            "time of day cannot be empty".to_string(),
        ));
    }
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ConfigError::Validation(format!("invalid time of day '{value}'")))
}
