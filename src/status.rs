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

//! Derived subscription status.
//!
//! Status is not a stored field. It is a view over the temporal state of a
//! subscription, recomputed from dates and flags on every read, so it can
//! never drift from the dates that define it. Stores that filter by status
//! apply the equivalent predicate over the date columns.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ParseLabelError;

/// The lifecycle state of a subscription at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// The activation date is still in the future.
    Pending,
    /// The trial period has not ended yet.
    Trial,
    /// The subscription is in good standing.
    Active,
    /// Cancellation is requested but the paid period has not run out.
    CancellationPending,
    /// Cancellation has taken effect.
    Cancelled,
    /// The expiration date has passed without a cancellation.
    Expired,
    /// The subscription is archived.
    Archived,
}

impl SubscriptionStatus {
    /// The label used at the API boundary and in filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::CancellationPending => "cancellation_pending",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<SubscriptionStatus, ParseLabelError> {
        match s {
            "pending" => Ok(SubscriptionStatus::Pending),
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "cancellation_pending" => Ok(SubscriptionStatus::CancellationPending),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            "archived" => Ok(SubscriptionStatus::Archived),
            other => Err(ParseLabelError::new("subscription status", other)),
        }
    }
}

/// Derives the status of a subscription at `now`.
///
/// Rules are evaluated top to bottom; the first match wins:
///
/// 1. archived flag set → `Archived`
/// 2. cancellation date set and the current period has ended (or the
///    subscription has no period end) → `Cancelled`
/// 3. cancellation date set, period still running → `CancellationPending`
/// 4. expiration date set and passed → `Expired`
/// 5. trial end date set and in the future → `Trial`
/// 6. activation date in the future → `Pending`
/// 7. otherwise → `Active`
pub fn derive_status(
    is_archived: bool,
    activation_date: Option<OffsetDateTime>,
    trial_end_date: Option<OffsetDateTime>,
    expiration_date: Option<OffsetDateTime>,
    cancellation_date: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> SubscriptionStatus {
    if is_archived {
        SubscriptionStatus::Archived
    } else if cancellation_date.is_some() {
        match current_period_end {
            Some(end) if end > now => SubscriptionStatus::CancellationPending,
            // No period end means there is no remaining period to serve out.
            _ => SubscriptionStatus::Cancelled,
        }
    } else if expiration_date.is_some_and(|at| at <= now) {
        SubscriptionStatus::Expired
    } else if trial_end_date.is_some_and(|at| at > now) {
        SubscriptionStatus::Trial
    } else if activation_date.is_some_and(|at| at > now) {
        SubscriptionStatus::Pending
    } else {
        SubscriptionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use time::Duration;

    use super::*;

    const NOW: OffsetDateTime = datetime!(2024-06-15 12:00 UTC);

    fn status(
        is_archived: bool,
        activation: Option<OffsetDateTime>,
        trial_end: Option<OffsetDateTime>,
        expiration: Option<OffsetDateTime>,
        cancellation: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
    ) -> SubscriptionStatus {
        derive_status(
            is_archived,
            activation,
            trial_end,
            expiration,
            cancellation,
            period_end,
            NOW,
        )
    }

    #[test]
    fn precedence_table() {
        let past = NOW - Duration::days(1);
        let future = NOW + Duration::days(1);

        // Archived shadows everything.
        assert_eq!(
            status(true, None, Some(future), Some(past), Some(past), Some(future)),
            SubscriptionStatus::Archived,
        );
        // Cancellation beats expiration.
        assert_eq!(
            status(false, None, None, Some(past), Some(past), Some(past)),
            SubscriptionStatus::Cancelled,
        );
        assert_eq!(
            status(false, None, None, None, Some(past), Some(future)),
            SubscriptionStatus::CancellationPending,
        );
        // A cancelled subscription with no period end has nothing pending.
        assert_eq!(
            status(false, None, None, None, Some(past), None),
            SubscriptionStatus::Cancelled,
        );
        // Expiration beats trial.
        assert_eq!(
            status(false, None, Some(future), Some(past), None, None),
            SubscriptionStatus::Expired,
        );
        // Trial beats pending.
        assert_eq!(
            status(false, Some(future), Some(future), None, None, None),
            SubscriptionStatus::Trial,
        );
        assert_eq!(
            status(false, Some(future), None, None, None, None),
            SubscriptionStatus::Pending,
        );
        assert_eq!(
            status(false, Some(past), Some(past), Some(future), None, Some(future)),
            SubscriptionStatus::Active,
        );
        assert_eq!(status(false, None, None, None, None, None), SubscriptionStatus::Active);
    }

    #[test]
    fn boundary_instants() {
        // Expiration and trial end are compared with opposite senses: an
        // expiration at exactly `now` has expired, a trial ending exactly at
        // `now` is over.
        assert_eq!(
            status(false, None, None, Some(NOW), None, None),
            SubscriptionStatus::Expired,
        );
        assert_eq!(
            status(false, None, Some(NOW), None, None, None),
            SubscriptionStatus::Active,
        );
        assert_eq!(
            status(false, Some(NOW), None, None, None, None),
            SubscriptionStatus::Active,
        );
        assert_eq!(
            status(false, None, None, None, Some(NOW), Some(NOW)),
            SubscriptionStatus::Cancelled,
        );
    }

    #[test]
    fn monotonic_under_advancing_clock() {
        // trial → active → cancellation_pending → cancelled as now advances.
        let activation = datetime!(2024-01-01 00:00 UTC);
        let trial_end = datetime!(2024-01-15 00:00 UTC);
        let cancellation = datetime!(2024-02-01 00:00 UTC);
        let period_end = datetime!(2024-03-01 00:00 UTC);

        let rank = |s: SubscriptionStatus| match s {
            SubscriptionStatus::Trial => 0,
            SubscriptionStatus::Active => 1,
            SubscriptionStatus::CancellationPending => 2,
            SubscriptionStatus::Cancelled => 3,
            other => panic!("unexpected status {other}"),
        };

        let mut last = None;
        let mut now = activation;
        while now <= period_end + Duration::days(30) {
            let s = derive_status(
                false,
                Some(activation),
                Some(trial_end),
                None,
                (now >= cancellation).then_some(cancellation),
                Some(period_end),
                now,
            );
            if let Some(prev) = last {
                assert!(rank(s) >= rank(prev), "status went backwards at {now}");
            }
            last = Some(s);
            now += Duration::hours(6);
        }
        assert_eq!(last, Some(SubscriptionStatus::Cancelled));
    }

    #[test]
    fn totality() {
        // Every combination of set/unset dates, before/after now, derives
        // exactly one of the seven statuses without panicking.
        let past = Some(NOW - Duration::days(2));
        let future = Some(NOW + Duration::days(2));
        let choices = [None, past, future];
        for archived in [false, true] {
            for activation in choices {
                for trial in choices {
                    for expiration in choices {
                        for cancellation in choices {
                            for period_end in choices {
                                let _ = status(
                                    archived,
                                    activation,
                                    trial,
                                    expiration,
                                    cancellation,
                                    period_end,
                                );
                            }
                        }
                    }
                }
            }
        }
    }
}
