//! Canonical timestamps and the business calendar.
//!
//! Every stored instant is a `DateTime<Utc>`. A local business *date* only ever
//! comes out of [`BusinessCalendar`], which applies one fixed UTC offset. Nothing in
//! this crate consults the host timezone.

use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc,
};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Parse a boundary timestamp into a canonical UTC instant.
///
/// Accepts RFC 3339 only, so the offset is always explicit (`Z` or `±hh:mm`).
/// Naive strings such as `2025-01-01T00:15:00` are rejected instead of being
/// guessed into some timezone.
pub fn parse_utc_instant(raw: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::validation(format!("timestamp '{raw}' is not RFC 3339: {e}")))
}

/// Fixed-offset business calendar used for every date filter and grouping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusinessCalendar {
    offset: FixedOffset,
}

impl BusinessCalendar {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Build from a signed number of seconds east of UTC.
    pub fn from_offset_seconds(seconds: i32) -> DomainResult<Self> {
        FixedOffset::east_opt(seconds)
            .map(Self::new)
            .ok_or_else(|| DomainError::validation(format!("utc offset out of range: {seconds}s")))
    }

    /// Parse `+05:30`, `-0800`, `+05` or `Z`.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("z") {
            return Ok(Self::utc());
        }

        let invalid = || DomainError::validation(format!("invalid utc offset '{raw}'"));

        let (sign, rest) = match raw.as_bytes().first() {
            Some(b'+') => (1, &raw[1..]),
            Some(b'-') => (-1, &raw[1..]),
            _ => return Err(invalid()),
        };

        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let (hours, minutes) = match digits.len() {
            2 => (digits.parse::<i32>().map_err(|_| invalid())?, 0),
            4 => (
                digits[..2].parse::<i32>().map_err(|_| invalid())?,
                digits[2..].parse::<i32>().map_err(|_| invalid())?,
            ),
            _ => return Err(invalid()),
        };
        if hours > 23 || minutes > 59 {
            return Err(invalid());
        }

        Self::from_offset_seconds(sign * (hours * 3600 + minutes * 60))
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Local business date of a stored instant.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    /// Local wall-clock time of a stored instant.
    pub fn local_datetime(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.offset).naive_local()
    }

    /// Canonicalize a local wall-clock time into a UTC instant.
    pub fn local_to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let shifted = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&shifted)
    }

    /// UTC instant at which a local business day starts.
    pub fn day_start_utc(&self, date: NaiveDate) -> DateTime<Utc> {
        self.local_to_utc(date.and_time(NaiveTime::MIN))
    }

    /// Half-open UTC interval `[start, end)` covering the local dates `from..=to`.
    pub fn date_range_utc(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> DomainResult<(DateTime<Utc>, DateTime<Utc>)> {
        if from > to {
            return Err(DomainError::validation(format!(
                "date range is inverted ({from} > {to})"
            )));
        }
        let after_end = to
            .succ_opt()
            .ok_or_else(|| DomainError::validation("date range end out of range"))?;
        Ok((self.day_start_utc(from), self.day_start_utc(after_end)))
    }

    /// Whether a stored instant falls on one of the local dates `from..=to`.
    pub fn contains(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        instant: DateTime<Utc>,
    ) -> bool {
        let date = self.local_date(instant);
        from.is_none_or(|f| date >= f) && to.is_none_or(|t| date <= t)
    }
}

impl Default for BusinessCalendar {
    fn default() -> Self {
        Self::utc()
    }
}

impl core::fmt::Display for BusinessCalendar {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.offset, f)
    }
}

impl TryFrom<String> for BusinessCalendar {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BusinessCalendar> for String {
    fn from(value: BusinessCalendar) -> Self {
        value.to_string()
    }
}
