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

//! The feature checker: effective feature values across a customer's
//! active subscriptions.

use std::collections::BTreeMap;

use futures_util::try_join;
use tracing::debug;

use crate::engine::catalog::PlanFeature;
use crate::engine::subscriptions::{FeatureOverride, Subscription};
use crate::engine::Engine;
use crate::error::Error;
use crate::status::SubscriptionStatus;
use crate::storage::SubscriptionFilter;

/// Resolves the effective value of a feature for a single subscription.
///
/// The three-level hierarchy, in order of precedence:
///
/// 1. the subscription's override for the feature, if any
///    (permanent and temporary overrides participate equally);
/// 2. the value the subscription's plan assigns to the feature, if any;
/// 3. the feature's default value.
///
/// Pure: no I/O, no time dependency, total over its inputs.
pub fn resolve_feature_value(
    default_value: &str,
    plan_value: Option<&str>,
    override_value: Option<&str>,
) -> String {
    override_value
        .or(plan_value)
        .unwrap_or(default_value)
        .to_owned()
}

impl Engine {
    /// Returns the effective value of a feature for a customer across all
    /// of the customer's entitled subscriptions for a product (active,
    /// trialing, or cancellation-pending).
    ///
    /// Missing references degrade rather than error: an unknown customer or
    /// feature key resolves to `default_value`, an unknown product key to
    /// `None`. When the customer has no active subscription for the
    /// product, the feature's own default value is returned.
    ///
    /// With multiple concurrent subscriptions, candidates are considered in
    /// ascending internal-id order (insertion order): the first
    /// subscription carrying an override for the feature wins, since
    /// overrides express intentional per-customer decisions and must not be
    /// shadowed by another subscription's plan value; otherwise the first
    /// subscription's resolved value is kept.
    pub async fn get_value_for_customer(
        &self,
        customer_key: &str,
        product_key: &str,
        feature_key: &str,
        default_value: Option<&str>,
    ) -> Result<Option<String>, Error> {
        self.guarded(async {
            let Some(customer) = self.storage.customer_by_key(customer_key).await? else {
                debug!(customer = customer_key, "feature check: unknown customer");
                return Ok(default_value.map(str::to_owned));
            };
            let Some(product) = self.storage.product_by_key(product_key).await? else {
                debug!(product = product_key, "feature check: unknown product");
                return Ok(None);
            };
            let Some(feature) = self.storage.feature_by_key(feature_key).await? else {
                debug!(feature = feature_key, "feature check: unknown feature");
                return Ok(default_value.map(str::to_owned));
            };

            let subscriptions = self
                .entitled_subscriptions(customer.id, product.id)
                .await?;
            if subscriptions.is_empty() {
                debug!(
                    customer = customer_key,
                    product = product_key,
                    "feature check: no active subscriptions, using feature default"
                );
                return Ok(finish(feature.default_value, default_value));
            }

            let subscription_ids: Vec<i64> =
                subscriptions.iter().map(|s| s.id).collect();
            let overrides = self
                .storage
                .overrides_for_subscriptions(&subscription_ids)
                .await?;
            if let Some(value) =
                first_override(&subscriptions, &overrides, feature.id)
            {
                return Ok(finish(value.to_owned(), default_value));
            }

            let plan_ids: Vec<i64> = subscriptions.iter().map(|s| s.plan_id).collect();
            let plan_values = self.storage.plan_features_for_plans(&plan_ids).await?;
            let first = &subscriptions[0];
            let plan_value = plan_value_for(&plan_values, first.plan_id, feature.id);
            let resolved =
                resolve_feature_value(&feature.default_value, plan_value, None);
            Ok(finish(resolved, default_value))
        })
        .await
    }

    /// Returns whether a toggle feature is enabled for a customer.
    ///
    /// True iff the effective value is the literal `"true"`,
    /// case-insensitively.
    pub async fn is_enabled_for_customer(
        &self,
        customer_key: &str,
        product_key: &str,
        feature_key: &str,
    ) -> Result<bool, Error> {
        let value = self
            .get_value_for_customer(customer_key, product_key, feature_key, None)
            .await?;
        Ok(value.is_some_and(|v| v.eq_ignore_ascii_case("true")))
    }

    /// Returns the effective value of every feature associated with a
    /// product for a customer.
    ///
    /// Each feature is resolved by the same algorithm as
    /// [`get_value_for_customer`](Engine::get_value_for_customer), with
    /// batched store reads. An unknown customer or product key yields an
    /// empty map.
    pub async fn get_all_features_for_customer(
        &self,
        customer_key: &str,
        product_key: &str,
    ) -> Result<BTreeMap<String, String>, Error> {
        self.guarded(async {
            let Some(customer) = self.storage.customer_by_key(customer_key).await? else {
                return Ok(BTreeMap::new());
            };
            let Some(product) = self.storage.product_by_key(product_key).await? else {
                return Ok(BTreeMap::new());
            };
            let features = self.storage.features_for_product(product.id).await?;
            if features.is_empty() {
                return Ok(BTreeMap::new());
            }

            let subscriptions = self
                .entitled_subscriptions(customer.id, product.id)
                .await?;
            let subscription_ids: Vec<i64> =
                subscriptions.iter().map(|s| s.id).collect();
            let plan_ids: Vec<i64> = subscriptions.iter().map(|s| s.plan_id).collect();
            let (overrides, plan_values) = try_join!(
                self.storage.overrides_for_subscriptions(&subscription_ids),
                self.storage.plan_features_for_plans(&plan_ids),
            )?;

            let mut resolved = BTreeMap::new();
            for feature in features {
                let value = match first_override(&subscriptions, &overrides, feature.id) {
                    Some(value) => value.to_owned(),
                    None => {
                        let plan_value = subscriptions.first().and_then(|first| {
                            plan_value_for(&plan_values, first.plan_id, feature.id)
                        });
                        resolve_feature_value(&feature.default_value, plan_value, None)
                    }
                };
                resolved.insert(feature.key, value);
            }
            Ok(resolved)
        })
        .await
    }

    /// Loads the customer's subscriptions that participate in feature
    /// resolution for a product, ordered by ascending id.
    ///
    /// Active and trialing subscriptions participate, as do
    /// cancellation-pending ones: a cancellation that has not reached the
    /// period end keeps its entitlements until the period runs out.
    /// Archived, expired, cancelled, and pending subscriptions never
    /// participate.
    async fn entitled_subscriptions(
        &self,
        customer_id: i64,
        product_id: i64,
    ) -> Result<Vec<Subscription>, Error> {
        let filter = SubscriptionFilter {
            customer_id: Some(customer_id),
            product_id: Some(product_id),
            statuses: vec![
                SubscriptionStatus::Active,
                SubscriptionStatus::Trial,
                SubscriptionStatus::CancellationPending,
            ],
            ..Default::default()
        };
        self.storage
            .list_subscriptions(&filter, self.now(), None, 0)
            .await
    }
}

/// Finds the override value of the first subscription (in the given order)
/// that carries an override for `feature_id`.
fn first_override<'a>(
    subscriptions: &[Subscription],
    overrides: &'a [FeatureOverride],
    feature_id: i64,
) -> Option<&'a str> {
    for subscription in subscriptions {
        let found = overrides.iter().find(|o| {
            o.subscription_id == subscription.id && o.feature_id == feature_id
        });
        if let Some(o) = found {
            return Some(&o.value);
        }
    }
    None
}

fn plan_value_for(plan_values: &[PlanFeature], plan_id: i64, feature_id: i64) -> Option<&str> {
    plan_values
        .iter()
        .find(|pf| pf.plan_id == plan_id && pf.feature_id == feature_id)
        .map(|pf| pf.value.as_str())
}

/// Applies the caller's default to an empty resolution.
fn finish(resolved: String, default_value: Option<&str>) -> Option<String> {
    if resolved.trim().is_empty() {
        if let Some(default) = default_value {
            return Some(default.to_owned());
        }
    }
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_prefers_override_then_plan_then_default() {
        assert_eq!(
            resolve_feature_value("3", Some("5"), Some("10")),
            "10",
        );
        assert_eq!(resolve_feature_value("3", Some("5"), None), "5");
        assert_eq!(resolve_feature_value("3", None, None), "3");
    }

    #[test]
    fn override_wins_even_when_equal_to_default() {
        assert_eq!(resolve_feature_value("3", None, Some("3")), "3");
        assert_eq!(resolve_feature_value("3", Some(""), None), "");
    }
}
