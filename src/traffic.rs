use chrono::{DateTime, Duration, FixedOffset, Local, TimeZone};
use serde::{Deserialize, Serialize};

/// Wire format of the dates in traffic requests.
pub const TRAFFIC_DATE_FORMAT: &str = "%m/%d/%Y";

/// Date-time range for a traffic query.
///
/// Both ends carry the viewer's UTC offset; only their calendar dates are
/// sent to the traffic service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// Start of the range (inclusive)
    pub start: DateTime<FixedOffset>,
    /// End of the range (inclusive)
    pub end: DateTime<FixedOffset>,
}

impl DateRange {
    /// Creates a new DateRange.
    pub fn new(start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> Self {
        DateRange { start, end }
    }

    /// The default window relative to `now`: from midnight three days ago to
    /// exactly one day ago, in the offset of `now`.
    pub fn trailing(now: DateTime<FixedOffset>) -> Self {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_else(|| now.naive_local());
        let today_start = now
            .offset()
            .from_local_datetime(&midnight)
            .single()
            .unwrap_or(now);

        DateRange {
            start: today_start - Duration::days(3),
            end: now - Duration::days(1),
        }
    }

    /// The default window for the local clock.
    pub fn default_window() -> Self {
        Self::trailing(Local::now().fixed_offset())
    }

    /// Returns true if start is not after end.
    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// Start and end dates formatted for the traffic endpoint.
    pub fn api_dates(&self) -> (String, String) {
        (
            self.start.format(TRAFFIC_DATE_FORMAT).to_string(),
            self.end.format(TRAFFIC_DATE_FORMAT).to_string(),
        )
    }
}

impl Default for DateRange {
    fn default() -> Self {
        Self::default_window()
    }
}

/// Parses a date-time in RFC 3339 or `YYYY-MM-DDTHH:MM:SS+HHMM` form.
pub fn parse_date_time(value: &str) -> Result<DateTime<FixedOffset>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
}

/// Assignment ratios of all charted experiments for one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRatio {
    pub date: String,
    #[serde(default)]
    pub values: Vec<f64>,
}

/// Traffic statistics for an experiment and its siblings over a date range.
///
/// `priorities` and `sampling_percentages` run parallel to `experiments`;
/// every `AssignmentRatio::values` is parallel to them as well.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficResult {
    #[serde(default)]
    pub experiments: Vec<String>,
    #[serde(default)]
    pub priorities: Vec<u32>,
    #[serde(default)]
    pub sampling_percentages: Vec<f64>,
    #[serde(default)]
    pub assignment_ratios: Vec<AssignmentRatio>,
}
