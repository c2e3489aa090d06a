//! Core domain model for aptwatch: listing snapshots, change records,
//! crawl jobs and schedule entries.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aptwatch-core";

/// One raw listing as delivered by the scrape source. Prices are minor-unit
/// integers (만원); a listing the portal returned without a price keeps `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub article_no: Option<String>,
    pub trade_type: Option<String>,
    pub price: Option<i64>,
    pub area_name: Option<String>,
    pub area: Option<f64>,
    pub floor_info: Option<String>,
    pub direction: Option<String>,
    pub building_name: Option<String>,
    pub realtor_name: Option<String>,
}

/// One observation of a listing. At most one row per
/// `(complex_id, article_no)` has `is_active = true` at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub complex_id: String,
    pub article_no: String,
    pub trade_type: Option<String>,
    pub price: Option<i64>,
    pub area_name: Option<String>,
    pub area: Option<f64>,
    pub floor_info: Option<String>,
    pub direction: Option<String>,
    pub building_name: Option<String>,
    pub realtor_name: Option<String>,
    pub is_active: bool,
    pub captured_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    /// Job id of the crawl cycle that inserted this row.
    pub crawl_session_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    New,
    Removed,
    PriceUp,
    PriceDown,
}

impl ChangeType {
    pub fn is_price_move(self) -> bool {
        matches!(self, ChangeType::PriceUp | ChangeType::PriceDown)
    }
}

/// Immutable change event between two consecutive crawl cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleChange {
    /// Database-assigned id; `None` until persisted.
    pub id: Option<i64>,
    pub complex_id: String,
    pub article_no: String,
    pub change_type: ChangeType,
    pub old_price: Option<i64>,
    pub new_price: Option<i64>,
    pub price_change_amount: Option<i64>,
    pub price_change_percent: Option<f64>,
    pub trade_type: Option<String>,
    pub area_name: Option<String>,
    pub building_name: Option<String>,
    pub floor_info: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub crawl_session_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    SingleComplex,
    AllComplexes,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

/// Tracked unit of work for one crawl cycle (or a batch of them).
/// PENDING -> RUNNING -> SUCCESS | FAILED; no transition out of a terminal
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub complex_id: Option<String>,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub articles_collected: i64,
    pub articles_new: i64,
    pub articles_updated: i64,
    pub articles_skipped: i64,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
}

impl CrawlJob {
    pub fn new(kind: JobKind, complex_id: Option<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            kind,
            complex_id,
            status: JobStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            articles_collected: 0,
            articles_new: 0,
            articles_updated: 0,
            articles_skipped: 0,
            error_message: None,
            error_traceback: None,
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Registered complex, the unit of scraping and aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexSummary {
    pub complex_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledTask {
    CrawlAllComplexes,
    CleanupSnapshots,
}

/// Day-of-week component of a schedule. Weekdays use the 0=Sunday..6=Saturday
/// convention; `MonthDay` and `QuarterDay` match calendar dates instead
/// (quarters fire in January, April, July and October).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayRule {
    Any,
    Weekday(u8),
    MonthDay(u32),
    QuarterDay(u32),
}

impl DayRule {
    pub fn matches(self, date: NaiveDate) -> bool {
        match self {
            DayRule::Any => true,
            DayRule::Weekday(dow) => date.weekday().num_days_from_sunday() == dow as u32,
            DayRule::MonthDay(day) => date.day() == day,
            DayRule::QuarterDay(day) => {
                date.day() == day && matches!(date.month(), 1 | 4 | 7 | 10)
            }
        }
    }
}

impl std::fmt::Display for DayRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DayRule::Any => write!(f, "*"),
            DayRule::Weekday(dow) => write!(f, "{dow}"),
            DayRule::MonthDay(day) => write!(f, "MONTHLY_{day}"),
            DayRule::QuarterDay(day) => write!(f, "QUARTERLY_{day}"),
        }
    }
}

impl std::str::FromStr for DayRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(DayRule::Any);
        }
        if let Some(day) = s.strip_prefix("MONTHLY_") {
            let day: u32 = day.parse().map_err(|_| format!("bad day rule: {s}"))?;
            if !(1..=31).contains(&day) {
                return Err(format!("month day out of range: {s}"));
            }
            return Ok(DayRule::MonthDay(day));
        }
        if let Some(day) = s.strip_prefix("QUARTERLY_") {
            let day: u32 = day.parse().map_err(|_| format!("bad day rule: {s}"))?;
            if !(1..=31).contains(&day) {
                return Err(format!("quarter day out of range: {s}"));
            }
            return Ok(DayRule::QuarterDay(day));
        }
        let dow: u8 = s.parse().map_err(|_| format!("bad day rule: {s}"))?;
        if dow > 6 {
            return Err(format!("weekday out of range: {s}"));
        }
        Ok(DayRule::Weekday(dow))
    }
}

impl Serialize for DayRule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DayRule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Recurring schedule definition, keyed by unique `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub task: ScheduledTask,
    pub hour: u32,
    pub minute: u32,
    pub day_of_week: DayRule,
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn day_rule_round_trips_through_strings() {
        for raw in ["*", "0", "6", "MONTHLY_1", "MONTHLY_15", "QUARTERLY_1"] {
            let rule: DayRule = raw.parse().unwrap();
            assert_eq!(rule.to_string(), raw);
        }
        assert!("7".parse::<DayRule>().is_err());
        assert!("MONTHLY_40".parse::<DayRule>().is_err());
        assert!("often".parse::<DayRule>().is_err());
    }

    #[test]
    fn weekday_rule_uses_sunday_zero() {
        // 2026-08-30 is a Sunday.
        assert!(DayRule::Weekday(0).matches(date(2026, 8, 30)));
        assert!(!DayRule::Weekday(1).matches(date(2026, 8, 30)));
        assert!(DayRule::Weekday(1).matches(date(2026, 8, 31)));
    }

    #[test]
    fn quarterly_rule_only_fires_in_quarter_months() {
        let rule = DayRule::QuarterDay(15);
        assert!(rule.matches(date(2026, 1, 15)));
        assert!(rule.matches(date(2026, 7, 15)));
        assert!(!rule.matches(date(2026, 2, 15)));
        assert!(!rule.matches(date(2026, 1, 14)));
    }

    #[test]
    fn monthly_rule_matches_every_month() {
        let rule = DayRule::MonthDay(1);
        assert!(rule.matches(date(2026, 3, 1)));
        assert!(rule.matches(date(2026, 11, 1)));
        assert!(!rule.matches(date(2026, 3, 2)));
    }

    #[test]
    fn job_duration_is_derived_from_timestamps() {
        let mut job = CrawlJob::new(JobKind::SingleComplex, Some("1482".into()));
        assert_eq!(job.duration_seconds(), None);
        job.finished_at = Some(job.started_at + chrono::Duration::milliseconds(2500));
        assert_eq!(job.duration_seconds(), Some(2.5));
        assert!(!job.status.is_terminal());
        job.status = JobStatus::Failed;
        assert!(job.status.is_terminal());
    }

    #[test]
    fn schedule_entry_serializes_day_rule_as_string() {
        let entry = ScheduleEntry {
            name: "nightly-crawl".into(),
            task: ScheduledTask::CrawlAllComplexes,
            hour: 6,
            minute: 0,
            day_of_week: DayRule::Any,
            enabled: true,
            description: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["day_of_week"], "*");
        assert_eq!(json["task"], "crawl_all_complexes");
    }
}
