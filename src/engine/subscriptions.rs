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

//! The subscription manager: subscription lifecycle and feature overrides.

use std::fmt;
use std::str::FromStr;

use async_stream::try_stream;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::config::{FieldUpdate, ListParams};
use crate::engine::catalog::BillingCycle;
use crate::engine::Engine;
use crate::error::{EntityKind, Error, FieldIssue, ParseLabelError};
use crate::period::advance_period;
use crate::status::{derive_status, SubscriptionStatus};
use crate::storage::{NewSubscription, SubscriptionFilter};
use crate::values;

/// A customer's participation in a billing cycle over a period of time.
///
/// Status is not stored on the subscription: call
/// [`status`](Subscription::status) to derive it from the dates and flags
/// at a given instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// The storage-assigned unique identifier for the subscription.
    pub id: i64,
    /// The user-supplied key for the subscription, unique among
    /// subscriptions and immutable after creation.
    pub key: String,
    /// The storage-assigned identifier of the owning customer.
    pub customer_id: i64,
    /// The key of the owning customer.
    pub customer_key: String,
    /// The storage-assigned identifier of the billing cycle.
    pub billing_cycle_id: i64,
    /// The key of the billing cycle.
    pub billing_cycle_key: String,
    /// The storage-assigned identifier of the plan, derived from the
    /// billing cycle.
    pub plan_id: i64,
    /// The key of the plan.
    pub plan_key: String,
    /// The storage-assigned identifier of the product, derived from the
    /// plan.
    pub product_id: i64,
    /// The key of the product.
    pub product_key: String,
    /// The date the subscription takes effect. A future activation date
    /// derives the `pending` status.
    #[serde(with = "time::serde::rfc3339::option")]
    pub activation_date: Option<OffsetDateTime>,
    /// The end of the trial period, if any. Cleared on trial conversion.
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end_date: Option<OffsetDateTime>,
    /// The date the subscription expires, if any.
    #[serde(with = "time::serde::rfc3339::option")]
    pub expiration_date: Option<OffsetDateTime>,
    /// The date cancellation was requested, if any.
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancellation_date: Option<OffsetDateTime>,
    /// The start of the current billing period.
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    /// The end of the current billing period. `None` for forever cycles.
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    /// The subscription's identifier in Stripe, if any. Unique when
    /// present. Retained by the archived subscription on transition.
    pub stripe_subscription_id: Option<String>,
    /// Whether the subscription is archived. Archived subscriptions accept
    /// no further writes until unarchived.
    pub is_archived: bool,
    /// When the transition worker archived this subscription, if it did.
    #[serde(with = "time::serde::rfc3339::option")]
    pub transitioned_at: Option<OffsetDateTime>,
    /// Caller-defined metadata. Always a JSON object.
    pub metadata: serde_json::Value,
    /// The time at which the subscription was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// The time at which the subscription was last updated.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Derives the status of this subscription at `now`.
    pub fn status(&self, now: OffsetDateTime) -> SubscriptionStatus {
        derive_status(
            self.is_archived,
            self.activation_date,
            self.trial_end_date,
            self.expiration_date,
            self.cancellation_date,
            self.current_period_end,
            now,
        )
    }
}

/// The lifecycle of a feature override.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideType {
    /// The override survives renewals.
    #[default]
    Permanent,
    /// The override is erased by
    /// [`clear_temporary_overrides`](Engine::clear_temporary_overrides),
    /// typically at the end of a billing period.
    Temporary,
}

impl OverrideType {
    /// The persisted label for this override type.
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideType::Permanent => "permanent",
            OverrideType::Temporary => "temporary",
        }
    }
}

impl fmt::Display for OverrideType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverrideType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<OverrideType, ParseLabelError> {
        match s {
            "permanent" => Ok(OverrideType::Permanent),
            "temporary" => Ok(OverrideType::Temporary),
            other => Err(ParseLabelError::new("override type", other)),
        }
    }
}

/// A per-subscription feature value that supersedes the plan value.
///
/// At most one override exists per (subscription, feature) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureOverride {
    /// The storage-assigned identifier of the owning subscription.
    pub subscription_id: i64,
    /// The storage-assigned identifier of the feature.
    pub feature_id: i64,
    /// The key of the feature.
    pub feature_key: String,
    /// The overriding value. Parseable under the feature's value type.
    pub value: String,
    /// Whether the override survives renewal.
    pub override_type: OverrideType,
    /// The time at which the override was first set.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// The time at which the override was last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The subset of [`Subscription`] used in create requests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CreateSubscriptionRequest<'a> {
    /// The key for the new subscription.
    pub key: &'a str,
    /// The key of the owning customer.
    pub customer_key: &'a str,
    /// The key of the billing cycle to subscribe to. The plan and product
    /// are derived from it.
    pub billing_cycle_key: &'a str,
    /// The date the subscription takes effect. Immutable after creation.
    pub activation_date: Option<OffsetDateTime>,
    /// The end of the trial period, if the subscription starts in trial.
    pub trial_end_date: Option<OffsetDateTime>,
    /// The date the subscription expires.
    pub expiration_date: Option<OffsetDateTime>,
    /// The date cancellation was requested.
    pub cancellation_date: Option<OffsetDateTime>,
    /// The start of the current billing period. Defaults to now.
    pub current_period_start: Option<OffsetDateTime>,
    /// The end of the current billing period. If absent, computed from the
    /// billing cycle's duration; `None` stays `None` for forever cycles.
    pub current_period_end: Option<OffsetDateTime>,
    /// The subscription's identifier in Stripe. Unique when present.
    pub stripe_subscription_id: Option<&'a str>,
    /// Caller-defined metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// The subset of [`Subscription`] used in update requests.
///
/// Re-pointing `billing_cycle_key` at a cycle of a different plan is how
/// plan upgrades and downgrades are expressed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateSubscriptionRequest<'a> {
    /// The key of a billing cycle to move the subscription to. The plan and
    /// product references follow the new cycle.
    pub billing_cycle_key: Option<&'a str>,
    /// A patch for the trial end date. Clearing it represents trial
    /// conversion.
    pub trial_end_date: FieldUpdate<OffsetDateTime>,
    /// A patch for the expiration date.
    pub expiration_date: FieldUpdate<OffsetDateTime>,
    /// A patch for the cancellation date.
    pub cancellation_date: FieldUpdate<OffsetDateTime>,
    /// A patch for the start of the current billing period.
    pub current_period_start: FieldUpdate<OffsetDateTime>,
    /// A patch for the end of the current billing period.
    pub current_period_end: FieldUpdate<OffsetDateTime>,
    /// Replacement metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// Parameters for a subscription list operation.
///
/// Filters are specified as keys. A filter key that does not resolve yields
/// an empty listing rather than an error, which keeps list calls idempotent
/// under eventually-consistent upstream systems.
#[derive(Debug, Clone)]
pub struct SubscriptionListParams<'a> {
    inner: ListParams,
    customer_key: Option<&'a str>,
    product_key: Option<&'a str>,
    plan_key: Option<&'a str>,
    billing_cycle_key: Option<&'a str>,
    status: Option<SubscriptionStatus>,
}

impl<'a> Default for SubscriptionListParams<'a> {
    fn default() -> SubscriptionListParams<'a> {
        SubscriptionListParams::DEFAULT
    }
}

impl<'a> SubscriptionListParams<'a> {
    /// The default subscription list parameters.
    ///
    /// Exposed as a constant for use in constant evaluation contexts.
    pub const DEFAULT: SubscriptionListParams<'static> = SubscriptionListParams {
        inner: ListParams::DEFAULT,
        customer_key: None,
        product_key: None,
        plan_key: None,
        billing_cycle_key: None,
        status: None,
    };

    /// Sets the page size for the list operation.
    pub const fn page_size(mut self, page_size: u64) -> Self {
        self.inner = self.inner.page_size(page_size);
        self
    }

    /// Filters the listing to subscriptions of the specified customer.
    pub const fn customer_key(mut self, customer_key: &'a str) -> Self {
        self.customer_key = Some(customer_key);
        self
    }

    /// Filters the listing to subscriptions under the specified product.
    pub const fn product_key(mut self, product_key: &'a str) -> Self {
        self.product_key = Some(product_key);
        self
    }

    /// Filters the listing to subscriptions on the specified plan.
    pub const fn plan_key(mut self, plan_key: &'a str) -> Self {
        self.plan_key = Some(plan_key);
        self
    }

    /// Filters the listing to subscriptions on the specified billing cycle.
    pub const fn billing_cycle_key(mut self, billing_cycle_key: &'a str) -> Self {
        self.billing_cycle_key = Some(billing_cycle_key);
        self
    }

    /// Filters the listing to subscriptions whose derived status matches.
    pub const fn status(mut self, status: SubscriptionStatus) -> Self {
        self.status = Some(status);
        self
    }
}

impl Engine {
    /// Creates a new subscription.
    ///
    /// The plan and product are derived from the billing cycle. If the
    /// current period bounds are not given, the period starts now and ends
    /// one cycle duration later (never, for forever cycles).
    pub async fn create_subscription(
        &self,
        subscription: &CreateSubscriptionRequest<'_>,
    ) -> Result<Subscription, Error> {
        self.guarded(async {
            let mut issues = Vec::new();
            values::check_key("key", subscription.key, &mut issues);
            if let Some(metadata) = subscription.metadata {
                values::check_metadata("metadata", metadata, &mut issues);
            }
            if subscription.customer_key.is_empty() {
                issues.push(FieldIssue::new("customer_key", "customer key is required"));
            }
            if subscription.billing_cycle_key.is_empty() {
                issues.push(FieldIssue::new(
                    "billing_cycle_key",
                    "billing cycle key is required",
                ));
            }
            if !issues.is_empty() {
                return Err(Error::validation(issues));
            }

            let customer = self
                .storage
                .customer_by_key(subscription.customer_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Customer, subscription.customer_key))?;
            let cycle = self
                .storage
                .billing_cycle_by_key(subscription.billing_cycle_key)
                .await?
                .ok_or_else(|| {
                    Error::not_found(EntityKind::BillingCycle, subscription.billing_cycle_key)
                })?;
            let plan = self
                .storage
                .plan_by_id(cycle.plan_id)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Plan, cycle.plan_id.to_string()))?;

            if self
                .storage
                .subscription_by_key(subscription.key)
                .await?
                .is_some()
            {
                return Err(Error::conflict(format!(
                    "subscription key already exists: {}",
                    subscription.key
                )));
            }
            if let Some(stripe_id) = subscription.stripe_subscription_id {
                if self
                    .storage
                    .subscription_by_stripe_id(stripe_id)
                    .await?
                    .is_some()
                {
                    return Err(Error::conflict(format!(
                        "stripe subscription id already in use: {stripe_id}"
                    )));
                }
            }

            let now = self.now();
            let current_period_start = subscription.current_period_start.unwrap_or(now);
            let current_period_end = match subscription.current_period_end {
                Some(end) => Some(end),
                None => period_end_for_cycle(&cycle, current_period_start),
            };

            let created = self
                .storage
                .insert_subscription(NewSubscription {
                    key: subscription.key.to_owned(),
                    customer_id: customer.id,
                    billing_cycle_id: cycle.id,
                    plan_id: plan.id,
                    product_id: plan.product_id,
                    activation_date: subscription.activation_date,
                    trial_end_date: subscription.trial_end_date,
                    expiration_date: subscription.expiration_date,
                    cancellation_date: subscription.cancellation_date,
                    current_period_start: Some(current_period_start),
                    current_period_end,
                    stripe_subscription_id: subscription
                        .stripe_subscription_id
                        .map(str::to_owned),
                    metadata: subscription
                        .metadata
                        .cloned()
                        .unwrap_or_else(values::empty_metadata),
                    created_at: now,
                })
                .await?;
            debug!(
                subscription = %created.key,
                customer = %created.customer_key,
                billing_cycle = %created.billing_cycle_key,
                "created subscription"
            );
            Ok(created)
        })
        .await
    }

    /// Gets a subscription by key.
    pub async fn get_subscription(&self, key: &str) -> Result<Option<Subscription>, Error> {
        self.guarded(self.storage.subscription_by_key(key)).await
    }

    /// Gets a subscription by Stripe subscription identifier.
    pub async fn get_subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, Error> {
        self.guarded(self.storage.subscription_by_stripe_id(stripe_subscription_id))
            .await
    }

    /// Updates a subscription.
    ///
    /// The activation date is immutable after creation, and archived
    /// subscriptions reject all writes.
    pub async fn update_subscription(
        &self,
        key: &str,
        update: &UpdateSubscriptionRequest<'_>,
    ) -> Result<Subscription, Error> {
        self.guarded(async {
            let mut subscription = self
                .storage
                .subscription_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Subscription, key))?;
            if subscription.is_archived {
                return Err(Error::domain(format!(
                    "subscription {key} is archived and accepts no writes"
                )));
            }
            if let Some(metadata) = update.metadata {
                let mut issues = Vec::new();
                values::check_metadata("metadata", metadata, &mut issues);
                if !issues.is_empty() {
                    return Err(Error::validation(issues));
                }
                subscription.metadata = metadata.clone();
            }
            if let Some(cycle_key) = update.billing_cycle_key {
                let cycle = self
                    .storage
                    .billing_cycle_by_key(cycle_key)
                    .await?
                    .ok_or_else(|| Error::not_found(EntityKind::BillingCycle, cycle_key))?;
                let plan = self
                    .storage
                    .plan_by_id(cycle.plan_id)
                    .await?
                    .ok_or_else(|| Error::not_found(EntityKind::Plan, cycle.plan_id.to_string()))?;
                subscription.billing_cycle_id = cycle.id;
                subscription.billing_cycle_key = cycle.key;
                subscription.plan_id = plan.id;
                subscription.plan_key = plan.key;
                subscription.product_id = plan.product_id;
                subscription.product_key = plan.product_key;
            }
            subscription.trial_end_date =
                update.trial_end_date.apply(subscription.trial_end_date);
            subscription.expiration_date =
                update.expiration_date.apply(subscription.expiration_date);
            subscription.cancellation_date =
                update.cancellation_date.apply(subscription.cancellation_date);
            subscription.current_period_start = update
                .current_period_start
                .apply(subscription.current_period_start);
            subscription.current_period_end = update
                .current_period_end
                .apply(subscription.current_period_end);
            subscription.updated_at = self.now();
            self.storage.update_subscription(&subscription).await?;
            debug!(subscription = %subscription.key, "updated subscription");
            Ok(subscription)
        })
        .await
    }

    /// Archives a subscription, clearing its feature overrides.
    ///
    /// Dates are not mutated; status derivation returns
    /// [`SubscriptionStatus::Archived`] until the subscription is
    /// unarchived.
    pub async fn archive_subscription(&self, key: &str) -> Result<Subscription, Error> {
        self.guarded(async {
            let mut subscription = self
                .storage
                .subscription_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Subscription, key))?;
            if !subscription.is_archived {
                self.storage.clear_overrides(subscription.id).await?;
                subscription.is_archived = true;
                subscription.updated_at = self.now();
                self.storage.update_subscription(&subscription).await?;
            }
            Ok(subscription)
        })
        .await
    }

    /// Returns an archived subscription to date-derived status.
    pub async fn unarchive_subscription(&self, key: &str) -> Result<Subscription, Error> {
        self.guarded(async {
            let mut subscription = self
                .storage
                .subscription_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Subscription, key))?;
            if subscription.is_archived {
                subscription.is_archived = false;
                subscription.updated_at = self.now();
                self.storage.update_subscription(&subscription).await?;
            }
            Ok(subscription)
        })
        .await
    }

    /// Physically deletes a subscription and its overrides. Permitted
    /// regardless of status.
    pub async fn delete_subscription(&self, key: &str) -> Result<(), Error> {
        self.guarded(async {
            let subscription = self
                .storage
                .subscription_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Subscription, key))?;
            self.storage.delete_subscription(subscription.id).await
        })
        .await
    }

    /// Sets a feature override on a subscription. Replaces any existing
    /// override for the same feature.
    pub async fn add_feature_override(
        &self,
        subscription_key: &str,
        feature_key: &str,
        value: &str,
        override_type: OverrideType,
    ) -> Result<FeatureOverride, Error> {
        self.guarded(async {
            let subscription = self
                .storage
                .subscription_by_key(subscription_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Subscription, subscription_key))?;
            if subscription.is_archived {
                return Err(Error::domain(format!(
                    "subscription {subscription_key} is archived and accepts no writes"
                )));
            }
            let feature = self
                .storage
                .feature_by_key(feature_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Feature, feature_key))?;
            let mut issues = Vec::new();
            values::check_value("value", feature.value_type, value, &mut issues);
            if !issues.is_empty() {
                return Err(Error::validation(issues));
            }
            self.storage
                .upsert_override(subscription.id, feature.id, value, override_type, self.now())
                .await
        })
        .await
    }

    /// Removes a feature override from a subscription. No-op if no
    /// override exists.
    pub async fn remove_feature_override(
        &self,
        subscription_key: &str,
        feature_key: &str,
    ) -> Result<(), Error> {
        self.guarded(async {
            let subscription = self
                .storage
                .subscription_by_key(subscription_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Subscription, subscription_key))?;
            let feature = self
                .storage
                .feature_by_key(feature_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Feature, feature_key))?;
            self.storage
                .remove_override(subscription.id, feature.id)
                .await?;
            Ok(())
        })
        .await
    }

    /// Removes every temporary override on a subscription, leaving
    /// permanent overrides untouched. Returns the number removed.
    ///
    /// Callers invoke this at the end of a billing period, typically as
    /// part of renewal.
    pub async fn clear_temporary_overrides(&self, subscription_key: &str) -> Result<u64, Error> {
        self.guarded(async {
            let subscription = self
                .storage
                .subscription_by_key(subscription_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Subscription, subscription_key))?;
            if subscription.is_archived {
                return Err(Error::domain(format!(
                    "subscription {subscription_key} is archived and accepts no writes"
                )));
            }
            let cleared = self
                .storage
                .clear_temporary_overrides(subscription.id)
                .await?;
            debug!(
                subscription = %subscription.key,
                cleared, "cleared temporary overrides"
            );
            Ok(cleared)
        })
        .await
    }

    /// Lists the feature overrides on a subscription.
    pub async fn list_feature_overrides(
        &self,
        subscription_key: &str,
    ) -> Result<Vec<FeatureOverride>, Error> {
        self.guarded(async {
            let subscription = self
                .storage
                .subscription_by_key(subscription_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Subscription, subscription_key))?;
            self.storage.overrides_for_subscription(subscription.id).await
        })
        .await
    }

    /// Lists subscriptions as configured by `params`.
    ///
    /// The underlying store reads are paginated. The returned stream will
    /// fetch additional pages as it is consumed. Status filters are applied
    /// against the status derived at the time of the call.
    pub fn list_subscriptions<'a>(
        &'a self,
        params: &SubscriptionListParams<'a>,
    ) -> impl Stream<Item = Result<Subscription, Error>> + 'a {
        let page_size = params.inner.page_size;
        let status = params.status;
        let customer_key = params.customer_key.map(str::to_owned);
        let product_key = params.product_key.map(str::to_owned);
        let plan_key = params.plan_key.map(str::to_owned);
        let billing_cycle_key = params.billing_cycle_key.map(str::to_owned);
        try_stream! {
            let mut filter = SubscriptionFilter {
                statuses: status.into_iter().collect(),
                ..Default::default()
            };
            // Resolve filter keys to ids up front; unknown keys yield the
            // empty listing rather than an error.
            let mut resolved = true;
            if let Some(key) = &customer_key {
                match self.storage.customer_by_key(key).await? {
                    Some(customer) => filter.customer_id = Some(customer.id),
                    None => resolved = false,
                }
            }
            if let Some(key) = &product_key {
                match self.storage.product_by_key(key).await? {
                    Some(product) => filter.product_id = Some(product.id),
                    None => resolved = false,
                }
            }
            if let Some(key) = &plan_key {
                match self.storage.plan_by_key(key).await? {
                    Some(plan) => filter.plan_id = Some(plan.id),
                    None => resolved = false,
                }
            }
            if let Some(key) = &billing_cycle_key {
                match self.storage.billing_cycle_by_key(key).await? {
                    Some(cycle) => filter.billing_cycle_id = Some(cycle.id),
                    None => resolved = false,
                }
            }
            if resolved {
                let now = self.now();
                let mut offset = 0u64;
                loop {
                    let page = self
                        .storage
                        .list_subscriptions(&filter, now, Some(page_size), offset)
                        .await?;
                    let fetched = page.len() as u64;
                    for subscription in page {
                        yield subscription;
                    }
                    if fetched < page_size {
                        break;
                    }
                    offset += fetched;
                }
            }
        }
    }
}

/// Computes the end of a billing period starting at `start` for `cycle`.
pub(crate) fn period_end_for_cycle(
    cycle: &BillingCycle,
    start: OffsetDateTime,
) -> Option<OffsetDateTime> {
    match cycle.duration_value {
        Some(value) => advance_period(start, value, cycle.duration_unit),
        None => None,
    }
}
