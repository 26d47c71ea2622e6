use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::models::{AudioFormat, ValidUrl};

/// A `[start, end)` interval in UTC; the actual recording interval of one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    fn starting_at(start: DateTime<Utc>, duration: Duration) -> Self {
        debug_assert!(duration > Duration::zero());
        Self {
            start,
            end: start + duration,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }

    pub fn time_until_start(&self, now: DateTime<Utc>) -> Duration {
        (self.start - now).max(Duration::zero())
    }

    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        if now < self.start {
            self.duration()
        } else if now >= self.end {
            Duration::zero()
        } else {
            self.end - now
        }
    }
}

/// One concrete firing of a schedule: the resolved window plus the output file.
#[derive(Debug, Clone)]
pub struct RecordingTask {
    pub id: Uuid,
    pub title: String,
    pub stream_url: ValidUrl,
    pub audio_format: AudioFormat,
    pub window: TimeWindow,
    pub file_path: PathBuf,
}

/// A daily recording period. The start time of day is held in UTC; the
/// local-to-UTC conversion and the cross-midnight duration are resolved when
/// the config is parsed.
#[derive(Debug, Clone)]
pub struct RecordingSchedule {
    pub id: Uuid,
    pub title: String,
    pub start_timeofday_utc: NaiveTime,
    pub duration: Duration,
    pub stream_url: ValidUrl,
    pub audio_format: AudioFormat,
    pub output_dir: PathBuf,
    pub metadata: BTreeMap<String, String>,
    pub description: Option<String>,
    pub image_url: Option<ValidUrl>,
    trigger: cron::Schedule,
}

impl RecordingSchedule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        title: &str,
        start_timeofday_utc: NaiveTime,
        duration: Duration,
        stream_url: ValidUrl,
        base_output_dir: &Path,
        metadata: BTreeMap<String, String>,
        frequency: &str,
        description: Option<String>,
        image_url: Option<ValidUrl>,
    ) -> Result<Self, ConfigError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ConfigError::Validation(
                "schedule title cannot be empty".to_string(),
            ));
        }

        let day_of_week = cron_day_of_week(frequency)?;
        let expression = format!(
            "{} {} {} * * {} *",
            start_timeofday_utc.second(),
            start_timeofday_utc.minute(),
            start_timeofday_utc.hour(),
            day_of_week,
        );
        let trigger = cron::Schedule::from_str(&expression).map_err(|e| {
            ConfigError::Validation(format!("invalid frequency '{frequency}': {e}"))
        })?;

        let audio_format = AudioFormat::for_stream_url(&stream_url);

        Ok(Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            start_timeofday_utc,
            duration,
            stream_url,
            audio_format,
            output_dir: base_output_dir.join(slug::slugify(title)),
            metadata,
            description,
            image_url,
            trigger,
        })
    }

    /// Next cron instant strictly after `after`, in UTC.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.trigger.after(&after).next()
    }

    /// The window `now` falls inside, or the next one.
    ///
    /// A window that began yesterday may still be running when the schedule
    /// crosses midnight, so yesterday's firing is checked first.
    pub fn current_or_next_window(&self, now: DateTime<Utc>) -> TimeWindow {
        let start_today = now.date_naive().and_time(self.start_timeofday_utc).and_utc();
        let end_today = start_today + self.duration;

        let end_yesterday = end_today - Duration::days(1);
        if now < end_yesterday {
            return TimeWindow::starting_at(start_today - Duration::days(1), self.duration);
        }

        // Covers both "starts later today" and "currently running".
        if now < end_today {
            return TimeWindow::starting_at(start_today, self.duration);
        }

        TimeWindow::starting_at(start_today + Duration::days(1), self.duration)
    }

    /// Build the task for the current-or-next window. Firing slightly before
    /// the window start still yields the right window.
    pub fn current_or_next_task(&self, now: DateTime<Utc>) -> RecordingTask {
        let window = self.current_or_next_window(now);
        let id = Uuid::new_v4();
        let file_name = format!(
            "{}--{}-{}--{}--{}.{}",
            window.start().format("%Y-%m-%d"),
            window.start().format("%H%M"),
            window.end().format("%H%M"),
            slug::slugify(&self.title),
            id,
            self.audio_format.extension(),
        );

        RecordingTask {
            id,
            title: self.title.clone(),
            stream_url: self.stream_url.clone(),
            audio_format: self.audio_format,
            window,
            file_path: self.output_dir.join(file_name),
        }
    }
}

/// Convert a local time of day to UTC using today's date in the zone.
pub fn timeofday_to_utc(
    timeofday: NaiveTime,
    zone: Tz,
    now: DateTime<Utc>,
) -> Result<NaiveTime, ConfigError> {
    let today = now.with_timezone(&zone).date_naive();
    let local = zone
        .from_local_datetime(&today.and_time(timeofday))
        .earliest()
        .ok_or_else(|| {
            ConfigError::Validation(format!(
                "time {timeofday} does not exist in zone {zone} today (DST gap)"
            ))
        })?;
    Ok(local.with_timezone(&Utc).time())
}

/// Duration between two local times of day. An end at or before the start
/// means the period crosses midnight into the next day.
pub fn duration_between(start: NaiveTime, end: NaiveTime) -> Duration {
    let diff = end.signed_duration_since(start);
    if diff > Duration::zero() {
        diff
    } else {
        diff + Duration::days(1)
    }
}

/// Translate a standard cron day-of-week field (0-6 with 0 = Sunday, names,
/// `*`, lists, ranges) into the named form the `cron` crate agrees with
/// regardless of numbering convention.
fn cron_day_of_week(field: &str) -> Result<String, ConfigError> {
    let field = field.trim();
    if field.is_empty() {
        return Err(ConfigError::Validation(
            "frequency cannot be empty".to_string(),
        ));
    }
    if field == "*" {
        return Ok("*".to_string());
    }

    let mut parts = Vec::new();
    for token in field.split(',') {
        let range: Vec<&str> = token.split('-').collect();
        if range.len() > 2 {
            return Err(ConfigError::Validation(format!(
                "invalid day-of-week token '{token}'"
            )));
        }
        let converted: Result<Vec<String>, ConfigError> =
            range.into_iter().map(day_name).collect();
        parts.push(converted?.join("-"));
    }
    Ok(parts.join(","))
}

fn day_name(token: &str) -> Result<String, ConfigError> {
    const NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

    let token = token.trim();
    if let Ok(number) = token.parse::<u8>() {
        // 7 is a common alias for Sunday.
        let index = if number == 7 { 0 } else { number as usize };
        return NAMES
            .get(index)
            .map(|name| name.to_string())
            .ok_or_else(|| {
                ConfigError::Validation(format!("day-of-week number '{token}' out of range"))
            });
    }

    let upper = token.to_ascii_uppercase();
    if NAMES.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(ConfigError::Validation(format!(
            "unknown day-of-week '{token}'"
        )))
    }
}
