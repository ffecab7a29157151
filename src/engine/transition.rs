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

//! The transition worker: archives expired paid subscriptions and opens
//! successor subscriptions on their plan's configured fallback cycle.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::subscriptions::{period_end_for_cycle, Subscription};
use crate::engine::Engine;
use crate::error::Error;
use crate::storage::NewSubscription;

/// The maximum number of expired subscriptions examined per pass.
pub const TRANSITION_BATCH_LIMIT: u64 = 1000;

/// The outcome of one transition worker pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionReport {
    /// A unique identifier for this pass, for log correlation.
    pub run_id: Uuid,
    /// How many expired subscriptions were examined.
    pub processed: u64,
    /// How many successor subscriptions were created.
    pub transitioned: u64,
    /// How many expired subscriptions were archived.
    pub archived: u64,
    /// Per-subscription failures. Errors never abort the batch.
    pub errors: Vec<TransitionError>,
}

/// A per-subscription failure in a transition pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionError {
    /// The key of the subscription that failed to transition.
    pub subscription_key: String,
    /// What went wrong.
    pub message: String,
}

/// Generates the key for the successor of a transitioned subscription.
///
/// A trailing `-v<digits>` suffix is treated as a version counter and
/// incremented; any other key gains a `-v1` suffix:
///
/// ```
/// # use subscrio::successor_key;
/// assert_eq!(successor_key("sub"), "sub-v1");
/// assert_eq!(successor_key("sub-v1"), "sub-v2");
/// assert_eq!(successor_key("foo-v1-bar"), "foo-v1-bar-v1");
/// ```
pub fn successor_key(key: &str) -> String {
    if let Some(idx) = key.rfind("-v") {
        let digits = &key[idx + 2..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = digits.parse::<u64>() {
                return format!("{}-v{}", &key[..idx], n + 1);
            }
        }
    }
    format!("{key}-v1")
}

impl Engine {
    /// Runs one pass of the transition worker.
    ///
    /// Finds non-archived, non-cancelled subscriptions whose expiration
    /// date has passed and whose plan configures a fallback billing cycle,
    /// then for each: archives it (stamping `transitioned_at`) and opens a
    /// successor subscription on the fallback cycle under a versioned key.
    /// The successor starts now, carries the old subscription's metadata,
    /// and has no trial, no cancellation, and no Stripe binding — the
    /// external payment-processor record belongs to the archived period.
    ///
    /// Each subscription is processed independently: a failure is recorded
    /// in the report and the batch continues. The archive-first ordering
    /// means a crash mid-subscription leaves an archived record with no
    /// successor rather than a spurious extra subscription; operators
    /// detect that via the error report.
    ///
    /// The host invokes this on a schedule; once every few minutes is
    /// sufficient for hourly-granularity accuracy.
    pub async fn run_transitions(&self) -> Result<TransitionReport, Error> {
        self.guarded(async {
            let run_id = Uuid::new_v4();
            let now = self.now();
            let candidates = self
                .storage
                .find_expired_with_transition_plans(now, TRANSITION_BATCH_LIMIT)
                .await?;
            let mut report = TransitionReport {
                run_id,
                processed: 0,
                transitioned: 0,
                archived: 0,
                errors: Vec::new(),
            };
            for subscription in candidates {
                report.processed += 1;
                self.transition_one(&subscription, now, &mut report).await;
            }
            info!(
                %run_id,
                processed = report.processed,
                transitioned = report.transitioned,
                archived = report.archived,
                errors = report.errors.len(),
                "transition pass complete"
            );
            Ok(report)
        })
        .await
    }

    async fn transition_one(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
        report: &mut TransitionReport,
    ) {
        if let Err(message) = self.try_transition(subscription, now, report).await {
            warn!(
                subscription = %subscription.key,
                message = %message,
                "subscription failed to transition"
            );
            report.errors.push(TransitionError {
                subscription_key: subscription.key.clone(),
                message,
            });
        }
    }

    // Returns Err(message) for per-subscription failures; store failures
    // are reported the same way.
    async fn try_transition(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
        report: &mut TransitionReport,
    ) -> Result<(), String> {
        // Reload the plan: the fallback reference may have been cleared
        // since the candidate query ran.
        let plan = self
            .storage
            .plan_by_id(subscription.plan_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("plan {} no longer exists", subscription.plan_key))?;
        let cycle_id = plan
            .on_expire_transition_to_billing_cycle_id
            .ok_or_else(|| {
                format!("plan {} no longer configures a transition cycle", plan.key)
            })?;
        let cycle = self
            .storage
            .billing_cycle_by_id(cycle_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("transition billing cycle {cycle_id} no longer exists"))?;
        // The fallback cycle typically belongs to a different plan (a free
        // tier); the successor's plan and product follow the cycle.
        let target_plan = self
            .storage
            .plan_by_id(cycle.plan_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("plan {} no longer exists", cycle.plan_key))?;

        // Archive first. If the successor create below fails, the record is
        // out of the candidate set and the miss is visible in the report.
        self.storage
            .mark_transitioned(subscription.id, now)
            .await
            .map_err(|e| e.to_string())?;
        self.storage
            .clear_overrides(subscription.id)
            .await
            .map_err(|e| e.to_string())?;
        report.archived += 1;

        let new_key = successor_key(&subscription.key);
        let exists = self
            .storage
            .subscription_by_key(&new_key)
            .await
            .map_err(|e| e.to_string())?
            .is_some();
        if exists {
            return Err(format!(
                "successor key {new_key} already exists; prior partial run suspected"
            ));
        }

        let successor = self
            .storage
            .insert_subscription(NewSubscription {
                key: new_key,
                customer_id: subscription.customer_id,
                billing_cycle_id: cycle.id,
                plan_id: target_plan.id,
                product_id: target_plan.product_id,
                activation_date: Some(now),
                trial_end_date: None,
                expiration_date: None,
                cancellation_date: None,
                current_period_start: Some(now),
                current_period_end: period_end_for_cycle(&cycle, now),
                stripe_subscription_id: None,
                metadata: subscription.metadata.clone(),
                created_at: now,
            })
            .await
            .map_err(|e| e.to_string())?;
        report.transitioned += 1;
        debug!(
            from = %subscription.key,
            to = %successor.key,
            billing_cycle = %cycle.key,
            "opened successor subscription"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_key_law() {
        assert_eq!(successor_key("sub"), "sub-v1");
        assert_eq!(successor_key("sub-v1"), "sub-v2");
        assert_eq!(successor_key("sub-v42"), "sub-v43");
        assert_eq!(successor_key("foo-bar"), "foo-bar-v1");
        assert_eq!(successor_key("foo-v1-bar"), "foo-v1-bar-v1");
    }

    #[test]
    fn successor_key_edge_cases() {
        // "-v" with no digits is not a version suffix.
        assert_eq!(successor_key("sub-v"), "sub-v-v1");
        // Mixed suffixes are not version suffixes.
        assert_eq!(successor_key("sub-v1a"), "sub-v1a-v1");
        // Numbers elsewhere in the key are untouched.
        assert_eq!(successor_key("plan9"), "plan9-v1");
    }
}
