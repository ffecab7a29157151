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

//! The key-addressable persistence contract.
//!
//! [`Storage`] is the port the engine drives. Two implementations ship with
//! the crate: [`postgres::PostgresStorage`] for production and
//! [`memory::MemoryStorage`] for tests and embedding.
//!
//! Storage is clock-free: operations whose results depend on derived
//! subscription status take `now` as an argument, so the engine's injected
//! clock remains the single source of time.

use std::fmt;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::engine::catalog::{
    BillingCycle, EntityStatus, Feature, Plan, PlanFeature, Product,
};
use crate::engine::customers::{Customer, CustomerStatus};
use crate::engine::subscriptions::{FeatureOverride, OverrideType, Subscription};
use crate::error::Error;
use crate::period::DurationUnit;
use crate::status::SubscriptionStatus;
use crate::values::FeatureValueType;

pub mod memory;
pub mod postgres;

/// The fields of a [`Product`] row at insertion time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProduct {
    pub key: String,
    pub display_name: String,
    pub description: String,
    pub status: EntityStatus,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// The fields of a [`Feature`] row at insertion time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeature {
    pub key: String,
    pub display_name: String,
    pub description: String,
    pub value_type: FeatureValueType,
    pub default_value: String,
    pub group_name: Option<String>,
    pub status: EntityStatus,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// The fields of a [`Plan`] row at insertion time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPlan {
    pub key: String,
    pub product_id: i64,
    pub display_name: String,
    pub description: String,
    pub status: EntityStatus,
    pub on_expire_transition_to_billing_cycle_id: Option<i64>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// The fields of a [`BillingCycle`] row at insertion time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBillingCycle {
    pub key: String,
    pub plan_id: i64,
    pub display_name: String,
    pub description: String,
    pub status: EntityStatus,
    pub duration_value: Option<i32>,
    pub duration_unit: DurationUnit,
    pub external_product_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// The fields of a [`Customer`] row at insertion time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCustomer {
    pub key: String,
    pub display_name: String,
    pub email: String,
    pub external_billing_id: Option<String>,
    pub status: CustomerStatus,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// The fields of a [`Subscription`] row at insertion time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    pub key: String,
    pub customer_id: i64,
    pub billing_cycle_id: i64,
    pub plan_id: i64,
    pub product_id: i64,
    pub activation_date: Option<OffsetDateTime>,
    pub trial_end_date: Option<OffsetDateTime>,
    pub expiration_date: Option<OffsetDateTime>,
    pub cancellation_date: Option<OffsetDateTime>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub stripe_subscription_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// A filter over subscriptions. All set fields must match; `statuses`
/// matches any of the listed derived statuses (empty means all).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubscriptionFilter {
    pub customer_id: Option<i64>,
    pub product_id: Option<i64>,
    pub plan_id: Option<i64>,
    pub billing_cycle_id: Option<i64>,
    pub statuses: Vec<SubscriptionStatus>,
}

/// The persistence port the engine drives.
///
/// Contracts common to all entities:
///
/// - inserts fail with [`Error::Conflict`] when the key (or any stated
///   unique field) collides;
/// - `*_by_key` / `*_by_id` lookups return `Ok(None)` when absent;
/// - updates replace the mutable columns of the row addressed by id and
///   fail with [`Error::NotFound`] when the row is gone;
/// - deletes cascade along the ownership tree (product → plans → billing
///   cycles → subscriptions → overrides) and are no-ops when the row is
///   already gone;
/// - lists return rows in ascending id order;
/// - writes are atomic at the entity level.
///
/// Uniqueness enforced by the store: entity keys per type, plan keys and
/// billing cycle keys globally, `stripe_subscription_id` and
/// `external_billing_id` when present, and one override per
/// (subscription, feature).
#[async_trait]
pub trait Storage: fmt::Debug + Send + Sync {
    // === Products ===

    async fn insert_product(&self, new: NewProduct) -> Result<Product, Error>;
    async fn product_by_key(&self, key: &str) -> Result<Option<Product>, Error>;
    async fn update_product(&self, product: &Product) -> Result<(), Error>;
    async fn delete_product(&self, id: i64) -> Result<(), Error>;
    async fn list_products(
        &self,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Product>, Error>;

    // === Product-feature associations ===

    /// Associates a feature with a product. Idempotent.
    async fn add_product_feature(
        &self,
        product_id: i64,
        feature_id: i64,
        now: OffsetDateTime,
    ) -> Result<(), Error>;
    /// Removes an association. Returns whether one existed.
    async fn remove_product_feature(
        &self,
        product_id: i64,
        feature_id: i64,
    ) -> Result<bool, Error>;
    /// The features associated with a product, in ascending feature id
    /// order.
    async fn features_for_product(&self, product_id: i64) -> Result<Vec<Feature>, Error>;

    // === Features ===

    async fn insert_feature(&self, new: NewFeature) -> Result<Feature, Error>;
    async fn feature_by_key(&self, key: &str) -> Result<Option<Feature>, Error>;
    async fn update_feature(&self, feature: &Feature) -> Result<(), Error>;
    /// Deletes a feature, cascading its product associations and plan
    /// values.
    ///
    /// Fails with [`Error::PreconditionFailed`] if a non-archived
    /// subscription holds an override referencing the feature.
    async fn delete_feature(&self, id: i64) -> Result<(), Error>;
    async fn list_features(
        &self,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Feature>, Error>;

    // === Plans ===

    async fn insert_plan(&self, new: NewPlan) -> Result<Plan, Error>;
    async fn plan_by_key(&self, key: &str) -> Result<Option<Plan>, Error>;
    async fn plan_by_id(&self, id: i64) -> Result<Option<Plan>, Error>;
    async fn update_plan(&self, plan: &Plan) -> Result<(), Error>;
    async fn delete_plan(&self, id: i64) -> Result<(), Error>;
    async fn list_plans(
        &self,
        product_id: Option<i64>,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Plan>, Error>;

    // === Plan feature values ===

    /// Sets the value a plan assigns to a feature, replacing any existing
    /// value for the pair.
    async fn set_plan_feature(
        &self,
        plan_id: i64,
        feature_id: i64,
        value: &str,
        now: OffsetDateTime,
    ) -> Result<PlanFeature, Error>;
    /// Removes a plan feature value. Returns whether one existed.
    async fn remove_plan_feature(&self, plan_id: i64, feature_id: i64) -> Result<bool, Error>;
    /// The feature values assigned by a plan, in ascending feature id
    /// order.
    async fn plan_features(&self, plan_id: i64) -> Result<Vec<PlanFeature>, Error>;
    /// The feature values assigned by any of the given plans. Batched to
    /// keep feature resolution free of N+1 traversal.
    async fn plan_features_for_plans(&self, plan_ids: &[i64]) -> Result<Vec<PlanFeature>, Error>;

    // === Billing cycles ===

    async fn insert_billing_cycle(&self, new: NewBillingCycle) -> Result<BillingCycle, Error>;
    async fn billing_cycle_by_key(&self, key: &str) -> Result<Option<BillingCycle>, Error>;
    async fn billing_cycle_by_id(&self, id: i64) -> Result<Option<BillingCycle>, Error>;
    async fn update_billing_cycle(&self, cycle: &BillingCycle) -> Result<(), Error>;
    async fn delete_billing_cycle(&self, id: i64) -> Result<(), Error>;
    async fn list_billing_cycles(
        &self,
        plan_id: Option<i64>,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<BillingCycle>, Error>;

    // === Customers ===

    async fn insert_customer(&self, new: NewCustomer) -> Result<Customer, Error>;
    async fn customer_by_key(&self, key: &str) -> Result<Option<Customer>, Error>;
    async fn customer_by_external_billing_id(
        &self,
        external_billing_id: &str,
    ) -> Result<Option<Customer>, Error>;
    async fn update_customer(&self, customer: &Customer) -> Result<(), Error>;
    async fn delete_customer(&self, id: i64) -> Result<(), Error>;
    async fn list_customers(
        &self,
        status: Option<CustomerStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Customer>, Error>;

    // === Subscriptions ===

    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription, Error>;
    async fn subscription_by_key(&self, key: &str) -> Result<Option<Subscription>, Error>;
    async fn subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, Error>;
    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), Error>;
    async fn delete_subscription(&self, id: i64) -> Result<(), Error>;
    /// Lists subscriptions matching `filter` in ascending id order.
    ///
    /// Status filters are evaluated against the status derived at `now`,
    /// as a predicate over the date columns, never a stored status.
    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
        now: OffsetDateTime,
        limit: Option<u64>,
        offset: u64,
    ) -> Result<Vec<Subscription>, Error>;
    /// The transition worker's candidate set: subscriptions that are not
    /// archived, have an expiration date at or before `now`, carry no
    /// cancellation date, and whose plan configures a fallback billing
    /// cycle. The plan join runs in the store.
    async fn find_expired_with_transition_plans(
        &self,
        now: OffsetDateTime,
        limit: u64,
    ) -> Result<Vec<Subscription>, Error>;
    /// Archives a subscription on behalf of the transition worker,
    /// stamping `transitioned_at`.
    async fn mark_transitioned(&self, id: i64, at: OffsetDateTime) -> Result<(), Error>;

    // === Feature overrides ===

    /// Sets an override, replacing any existing override for the
    /// (subscription, feature) pair.
    async fn upsert_override(
        &self,
        subscription_id: i64,
        feature_id: i64,
        value: &str,
        override_type: OverrideType,
        now: OffsetDateTime,
    ) -> Result<FeatureOverride, Error>;
    /// Removes an override. Returns whether one existed.
    async fn remove_override(&self, subscription_id: i64, feature_id: i64) -> Result<bool, Error>;
    /// Removes every override on a subscription. Returns the number
    /// removed.
    async fn clear_overrides(&self, subscription_id: i64) -> Result<u64, Error>;
    /// Removes every temporary override on a subscription, leaving
    /// permanent overrides untouched. Returns the number removed.
    async fn clear_temporary_overrides(&self, subscription_id: i64) -> Result<u64, Error>;
    /// The overrides on a subscription, in ascending feature id order.
    async fn overrides_for_subscription(
        &self,
        subscription_id: i64,
    ) -> Result<Vec<FeatureOverride>, Error>;
    /// The overrides on any of the given subscriptions. Batched to keep
    /// feature resolution free of N+1 traversal.
    async fn overrides_for_subscriptions(
        &self,
        subscription_ids: &[i64],
    ) -> Result<Vec<FeatureOverride>, Error>;
}
