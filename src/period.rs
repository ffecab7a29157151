// Copyright Materialize, Inc. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::util::days_in_year_month;
use time::{Date, Duration, Month, OffsetDateTime};

use crate::error::ParseLabelError;

/// The unit of a billing cycle's duration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    /// Calendar days.
    Days,
    /// Seven-day weeks.
    Weeks,
    /// Calendar months, clamped to the last day of the target month.
    #[default]
    Months,
    /// Calendar years, clamped for Feb 29 starts.
    Years,
    /// No duration: the billing period never ends.
    Forever,
}

impl DurationUnit {
    /// The persisted label for this unit.
    pub fn as_str(&self) -> &'static str {
        match self {
            DurationUnit::Days => "days",
            DurationUnit::Weeks => "weeks",
            DurationUnit::Months => "months",
            DurationUnit::Years => "years",
            DurationUnit::Forever => "forever",
        }
    }

    /// Whether this is the open-ended unit.
    pub fn is_forever(&self) -> bool {
        matches!(self, DurationUnit::Forever)
    }
}

impl fmt::Display for DurationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DurationUnit {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<DurationUnit, ParseLabelError> {
        match s {
            "days" => Ok(DurationUnit::Days),
            "weeks" => Ok(DurationUnit::Weeks),
            "months" => Ok(DurationUnit::Months),
            "years" => Ok(DurationUnit::Years),
            "forever" => Ok(DurationUnit::Forever),
            other => Err(ParseLabelError::new("duration unit", other)),
        }
    }
}

/// Computes the end of a billing period that starts at `start` and runs for
/// `value` `unit`s. Returns `None` for [`DurationUnit::Forever`].
///
/// Month and year arithmetic is calendar arithmetic: when the source day
/// does not exist in the target month, the last day of the target month is
/// chosen (Jan 31 + 1 month = Feb 28/29). The time of day is preserved.
pub fn advance_period(
    start: OffsetDateTime,
    value: i32,
    unit: DurationUnit,
) -> Option<OffsetDateTime> {
    match unit {
        DurationUnit::Days => Some(start + Duration::days(i64::from(value))),
        DurationUnit::Weeks => Some(start + Duration::weeks(i64::from(value))),
        DurationUnit::Months => Some(start.replace_date(add_months(start.date(), value))),
        DurationUnit::Years => Some(start.replace_date(add_months(start.date(), value * 12))),
        DurationUnit::Forever => None,
    }
}

fn add_months(date: Date, months: i32) -> Date {
    let linear = date.year() * 12 + i32::from(u8::from(date.month())) - 1 + months;
    let year = linear.div_euclid(12);
    let month = Month::try_from((linear.rem_euclid(12) + 1) as u8).expect("month index in 1..=12");
    let day = date.day().min(days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day).expect("day clamped to target month")
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn month_end_clamps_to_target_month() {
        assert_eq!(
            advance_period(datetime!(2024-01-31 00:00 UTC), 1, DurationUnit::Months),
            Some(datetime!(2024-02-29 00:00 UTC)),
        );
        assert_eq!(
            advance_period(datetime!(2023-01-31 12:30 UTC), 1, DurationUnit::Months),
            Some(datetime!(2023-02-28 12:30 UTC)),
        );
        assert_eq!(
            advance_period(datetime!(2023-03-31 00:00 UTC), 1, DurationUnit::Months),
            Some(datetime!(2023-04-30 00:00 UTC)),
        );
    }

    #[test]
    fn months_cross_year_boundaries() {
        assert_eq!(
            advance_period(datetime!(2023-11-15 00:00 UTC), 3, DurationUnit::Months),
            Some(datetime!(2024-02-15 00:00 UTC)),
        );
        assert_eq!(
            advance_period(datetime!(2023-06-01 00:00 UTC), 12, DurationUnit::Months),
            Some(datetime!(2024-06-01 00:00 UTC)),
        );
    }

    #[test]
    fn leap_day_year_arithmetic() {
        assert_eq!(
            advance_period(datetime!(2024-02-29 00:00 UTC), 1, DurationUnit::Years),
            Some(datetime!(2025-02-28 00:00 UTC)),
        );
        assert_eq!(
            advance_period(datetime!(2024-02-29 00:00 UTC), 4, DurationUnit::Years),
            Some(datetime!(2028-02-29 00:00 UTC)),
        );
    }

    #[test]
    fn days_and_weeks() {
        assert_eq!(
            advance_period(datetime!(2024-12-30 00:00 UTC), 3, DurationUnit::Days),
            Some(datetime!(2025-01-02 00:00 UTC)),
        );
        assert_eq!(
            advance_period(datetime!(2024-01-01 00:00 UTC), 2, DurationUnit::Weeks),
            Some(datetime!(2024-01-15 00:00 UTC)),
        );
    }

    #[test]
    fn forever_has_no_end() {
        assert_eq!(
            advance_period(datetime!(2024-01-01 00:00 UTC), 1, DurationUnit::Forever),
            None,
        );
    }
}
