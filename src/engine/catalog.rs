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

//! The catalog: products, features, plans, and billing cycles.

use std::fmt;
use std::str::FromStr;

use async_stream::try_stream;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::{FieldUpdate, ListParams};
use crate::engine::Engine;
use crate::error::{EntityKind, Error, ParseLabelError};
use crate::period::DurationUnit;
use crate::storage::{NewBillingCycle, NewFeature, NewPlan, NewProduct};
use crate::values::{self, FeatureValueType};

/// The administrative status of a catalog entity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// The entity is live.
    #[default]
    Active,
    /// The entity is hidden from new use but not archived.
    Inactive,
    /// The entity is archived.
    Archived,
}

impl EntityStatus {
    /// The persisted label for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Inactive => "inactive",
            EntityStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<EntityStatus, ParseLabelError> {
        match s {
            "active" => Ok(EntityStatus::Active),
            "inactive" => Ok(EntityStatus::Inactive),
            "archived" => Ok(EntityStatus::Archived),
            other => Err(ParseLabelError::new("entity status", other)),
        }
    }
}

/// A sellable product. Features and plans live underneath it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// The storage-assigned unique identifier for the product.
    pub id: i64,
    /// The user-supplied key for the product, unique among products and
    /// immutable after creation.
    pub key: String,
    /// A human-readable name for the product.
    pub display_name: String,
    /// A human-readable description of the product.
    pub description: String,
    /// The administrative status of the product.
    pub status: EntityStatus,
    /// Caller-defined metadata. Always a JSON object.
    pub metadata: serde_json::Value,
    /// The time at which the product was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// The time at which the product was last updated.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A named capability or limit. Features are global: the same feature key
/// may be associated with many products.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// The storage-assigned unique identifier for the feature.
    pub id: i64,
    /// The user-supplied key for the feature, unique among features and
    /// immutable after creation.
    pub key: String,
    /// A human-readable name for the feature.
    pub display_name: String,
    /// A human-readable description of the feature.
    pub description: String,
    /// The type that all of this feature's values must parse under.
    pub value_type: FeatureValueType,
    /// The value resolved when neither a plan value nor an override applies.
    /// Always parseable under `value_type`.
    pub default_value: String,
    /// An optional grouping label for display purposes.
    pub group_name: Option<String>,
    /// The administrative status of the feature.
    pub status: EntityStatus,
    /// Caller-defined metadata. Always a JSON object.
    pub metadata: serde_json::Value,
    /// The time at which the feature was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// The time at which the feature was last updated.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A named tier of a product that assigns values to some of its features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// The storage-assigned unique identifier for the plan.
    pub id: i64,
    /// The user-supplied key for the plan. Plan keys are globally unique,
    /// not merely unique within their product.
    pub key: String,
    /// The storage-assigned identifier of the owning product.
    pub product_id: i64,
    /// The key of the owning product.
    pub product_key: String,
    /// A human-readable name for the plan.
    pub display_name: String,
    /// A human-readable description of the plan.
    pub description: String,
    /// The administrative status of the plan.
    pub status: EntityStatus,
    /// The storage-assigned identifier of the billing cycle that successor
    /// subscriptions are opened on when a subscription of this plan expires.
    pub on_expire_transition_to_billing_cycle_id: Option<i64>,
    /// The key of the fallback billing cycle, if configured.
    ///
    /// This is a soft reference, resolved on demand: the cycle may belong to
    /// a different plan (typically a "free" tier).
    pub on_expire_transition_to_billing_cycle_key: Option<String>,
    /// Caller-defined metadata. Always a JSON object.
    pub metadata: serde_json::Value,
    /// The time at which the plan was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// The time at which the plan was last updated.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The value a plan assigns to a specific feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFeature {
    /// The storage-assigned identifier of the plan.
    pub plan_id: i64,
    /// The storage-assigned identifier of the feature.
    pub feature_id: i64,
    /// The key of the feature.
    pub feature_key: String,
    /// The assigned value. Parseable under the feature's value type.
    pub value: String,
    /// The time at which the value was first set.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// The time at which the value was last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A named period definition owned by a plan. Subscriptions are tied to a
/// billing cycle, not directly to a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingCycle {
    /// The storage-assigned unique identifier for the billing cycle.
    pub id: i64,
    /// The user-supplied key for the billing cycle. Globally unique.
    pub key: String,
    /// The storage-assigned identifier of the owning plan.
    pub plan_id: i64,
    /// The key of the owning plan.
    pub plan_key: String,
    /// A human-readable name for the billing cycle.
    pub display_name: String,
    /// A human-readable description of the billing cycle.
    pub description: String,
    /// The administrative status of the billing cycle.
    pub status: EntityStatus,
    /// The length of one period, in `duration_unit`s. `None` exactly when
    /// `duration_unit` is [`DurationUnit::Forever`]; otherwise at least 1.
    pub duration_value: Option<i32>,
    /// The unit of `duration_value`.
    pub duration_unit: DurationUnit,
    /// An opaque payment-processor reference for this cycle.
    pub external_product_id: Option<String>,
    /// Caller-defined metadata. Always a JSON object.
    pub metadata: serde_json::Value,
    /// The time at which the billing cycle was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// The time at which the billing cycle was last updated.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The subset of [`Product`] used in create requests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CreateProductRequest<'a> {
    /// The key for the new product.
    pub key: &'a str,
    /// A human-readable name for the product.
    pub display_name: &'a str,
    /// A human-readable description of the product.
    pub description: Option<&'a str>,
    /// The initial status. Defaults to [`EntityStatus::Active`].
    pub status: Option<EntityStatus>,
    /// Caller-defined metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// The subset of [`Product`] used in update requests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateProductRequest<'a> {
    /// A new display name.
    pub display_name: Option<&'a str>,
    /// A new description.
    pub description: Option<&'a str>,
    /// A new status.
    pub status: Option<EntityStatus>,
    /// Replacement metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// The subset of [`Feature`] used in create requests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CreateFeatureRequest<'a> {
    /// The key for the new feature.
    pub key: &'a str,
    /// A human-readable name for the feature.
    pub display_name: &'a str,
    /// A human-readable description of the feature.
    pub description: Option<&'a str>,
    /// The type that all of this feature's values must parse under.
    /// Immutable after creation.
    pub value_type: FeatureValueType,
    /// The default value. Must parse under `value_type`.
    pub default_value: &'a str,
    /// An optional grouping label.
    pub group_name: Option<&'a str>,
    /// The initial status. Defaults to [`EntityStatus::Active`].
    pub status: Option<EntityStatus>,
    /// Caller-defined metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// The subset of [`Feature`] used in update requests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateFeatureRequest<'a> {
    /// A new display name.
    pub display_name: Option<&'a str>,
    /// A new description.
    pub description: Option<&'a str>,
    /// A new default value. Must parse under the feature's value type.
    pub default_value: Option<&'a str>,
    /// A patch for the grouping label.
    pub group_name: FieldUpdate<&'a str>,
    /// A new status.
    pub status: Option<EntityStatus>,
    /// Replacement metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// The subset of [`Plan`] used in create requests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CreatePlanRequest<'a> {
    /// The key for the new plan. Globally unique.
    pub key: &'a str,
    /// The key of the owning product.
    pub product_key: &'a str,
    /// A human-readable name for the plan.
    pub display_name: &'a str,
    /// A human-readable description of the plan.
    pub description: Option<&'a str>,
    /// The initial status. Defaults to [`EntityStatus::Active`].
    pub status: Option<EntityStatus>,
    /// The key of the billing cycle successor subscriptions are opened on
    /// when a subscription of this plan expires.
    ///
    /// Usually configured later via [`Engine::update_plan`], since billing
    /// cycles are created under plans.
    pub on_expire_transition_to_billing_cycle_key: Option<&'a str>,
    /// Caller-defined metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// The subset of [`Plan`] used in update requests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdatePlanRequest<'a> {
    /// A new display name.
    pub display_name: Option<&'a str>,
    /// A new description.
    pub description: Option<&'a str>,
    /// A new status.
    pub status: Option<EntityStatus>,
    /// A patch for the fallback billing cycle reference.
    pub on_expire_transition_to_billing_cycle_key: FieldUpdate<&'a str>,
    /// Replacement metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// The subset of [`BillingCycle`] used in create requests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CreateBillingCycleRequest<'a> {
    /// The key for the new billing cycle. Globally unique.
    pub key: &'a str,
    /// The key of the owning plan.
    pub plan_key: &'a str,
    /// A human-readable name for the billing cycle.
    pub display_name: &'a str,
    /// A human-readable description of the billing cycle.
    pub description: Option<&'a str>,
    /// The initial status. Defaults to [`EntityStatus::Active`].
    pub status: Option<EntityStatus>,
    /// The length of one period. Required unless `duration_unit` is
    /// [`DurationUnit::Forever`]; must then be at least 1.
    pub duration_value: Option<i32>,
    /// The unit of `duration_value`.
    pub duration_unit: DurationUnit,
    /// An opaque payment-processor reference for this cycle.
    pub external_product_id: Option<&'a str>,
    /// Caller-defined metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// The subset of [`BillingCycle`] used in update requests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateBillingCycleRequest<'a> {
    /// A new display name.
    pub display_name: Option<&'a str>,
    /// A new description.
    pub description: Option<&'a str>,
    /// A new status.
    pub status: Option<EntityStatus>,
    /// A patch for the period length. The resulting (value, unit) pair must
    /// satisfy the duration invariant.
    pub duration_value: FieldUpdate<i32>,
    /// A new duration unit.
    pub duration_unit: Option<DurationUnit>,
    /// A patch for the payment-processor reference.
    pub external_product_id: FieldUpdate<&'a str>,
    /// Replacement metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// Parameters for a product list operation.
#[derive(Debug, Clone)]
pub struct ProductListParams {
    inner: ListParams,
    status: Option<EntityStatus>,
}

impl Default for ProductListParams {
    fn default() -> ProductListParams {
        ProductListParams::DEFAULT
    }
}

impl ProductListParams {
    /// The default product list parameters.
    pub const DEFAULT: ProductListParams = ProductListParams {
        inner: ListParams::DEFAULT,
        status: None,
    };

    /// Sets the page size for the list operation.
    pub const fn page_size(mut self, page_size: u64) -> Self {
        self.inner = self.inner.page_size(page_size);
        self
    }

    /// Filters the listing to the specified status.
    pub const fn status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Parameters for a feature list operation.
#[derive(Debug, Clone)]
pub struct FeatureListParams {
    inner: ListParams,
    status: Option<EntityStatus>,
}

impl Default for FeatureListParams {
    fn default() -> FeatureListParams {
        FeatureListParams::DEFAULT
    }
}

impl FeatureListParams {
    /// The default feature list parameters.
    pub const DEFAULT: FeatureListParams = FeatureListParams {
        inner: ListParams::DEFAULT,
        status: None,
    };

    /// Sets the page size for the list operation.
    pub const fn page_size(mut self, page_size: u64) -> Self {
        self.inner = self.inner.page_size(page_size);
        self
    }

    /// Filters the listing to the specified status.
    pub const fn status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Parameters for a plan list operation.
#[derive(Debug, Clone)]
pub struct PlanListParams<'a> {
    inner: ListParams,
    product_key: Option<&'a str>,
    status: Option<EntityStatus>,
}

impl<'a> Default for PlanListParams<'a> {
    fn default() -> PlanListParams<'a> {
        PlanListParams::DEFAULT
    }
}

impl<'a> PlanListParams<'a> {
    /// The default plan list parameters.
    pub const DEFAULT: PlanListParams<'static> = PlanListParams {
        inner: ListParams::DEFAULT,
        product_key: None,
        status: None,
    };

    /// Sets the page size for the list operation.
    pub const fn page_size(mut self, page_size: u64) -> Self {
        self.inner = self.inner.page_size(page_size);
        self
    }

    /// Filters the listing to plans of the specified product.
    ///
    /// An unknown product key yields an empty listing, not an error.
    pub const fn product_key(mut self, product_key: &'a str) -> Self {
        self.product_key = Some(product_key);
        self
    }

    /// Filters the listing to the specified status.
    pub const fn status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Parameters for a billing cycle list operation.
#[derive(Debug, Clone)]
pub struct BillingCycleListParams<'a> {
    inner: ListParams,
    plan_key: Option<&'a str>,
    status: Option<EntityStatus>,
}

impl<'a> Default for BillingCycleListParams<'a> {
    fn default() -> BillingCycleListParams<'a> {
        BillingCycleListParams::DEFAULT
    }
}

impl<'a> BillingCycleListParams<'a> {
    /// The default billing cycle list parameters.
    pub const DEFAULT: BillingCycleListParams<'static> = BillingCycleListParams {
        inner: ListParams::DEFAULT,
        plan_key: None,
        status: None,
    };

    /// Sets the page size for the list operation.
    pub const fn page_size(mut self, page_size: u64) -> Self {
        self.inner = self.inner.page_size(page_size);
        self
    }

    /// Filters the listing to cycles of the specified plan.
    ///
    /// An unknown plan key yields an empty listing, not an error.
    pub const fn plan_key(mut self, plan_key: &'a str) -> Self {
        self.plan_key = Some(plan_key);
        self
    }

    /// Filters the listing to the specified status.
    pub const fn status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }
}

impl Engine {
    /// Creates a new product.
    pub async fn create_product(&self, product: &CreateProductRequest<'_>) -> Result<Product, Error> {
        self.guarded(async {
            let mut issues = Vec::new();
            values::check_key("key", product.key, &mut issues);
            if let Some(metadata) = product.metadata {
                values::check_metadata("metadata", metadata, &mut issues);
            }
            if !issues.is_empty() {
                return Err(Error::validation(issues));
            }
            if self.storage.product_by_key(product.key).await?.is_some() {
                return Err(Error::conflict(format!(
                    "product key already exists: {}",
                    product.key
                )));
            }
            let now = self.now();
            self.storage
                .insert_product(NewProduct {
                    key: product.key.to_owned(),
                    display_name: product.display_name.to_owned(),
                    description: product.description.unwrap_or_default().to_owned(),
                    status: product.status.unwrap_or_default(),
                    metadata: product
                        .metadata
                        .cloned()
                        .unwrap_or_else(values::empty_metadata),
                    created_at: now,
                })
                .await
        })
        .await
    }

    /// Gets a product by key.
    pub async fn get_product(&self, key: &str) -> Result<Option<Product>, Error> {
        self.guarded(self.storage.product_by_key(key)).await
    }

    /// Updates a product.
    pub async fn update_product(
        &self,
        key: &str,
        update: &UpdateProductRequest<'_>,
    ) -> Result<Product, Error> {
        self.guarded(async {
            let mut product = self
                .storage
                .product_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Product, key))?;
            if let Some(metadata) = update.metadata {
                let mut issues = Vec::new();
                values::check_metadata("metadata", metadata, &mut issues);
                if !issues.is_empty() {
                    return Err(Error::validation(issues));
                }
                product.metadata = metadata.clone();
            }
            if let Some(display_name) = update.display_name {
                product.display_name = display_name.to_owned();
            }
            if let Some(description) = update.description {
                product.description = description.to_owned();
            }
            if let Some(status) = update.status {
                product.status = status;
            }
            product.updated_at = self.now();
            self.storage.update_product(&product).await?;
            Ok(product)
        })
        .await
    }

    /// Archives a product.
    pub async fn archive_product(&self, key: &str) -> Result<Product, Error> {
        self.set_product_status(key, EntityStatus::Archived).await
    }

    /// Returns an archived product to the active status.
    pub async fn unarchive_product(&self, key: &str) -> Result<Product, Error> {
        self.set_product_status(key, EntityStatus::Active).await
    }

    async fn set_product_status(&self, key: &str, status: EntityStatus) -> Result<Product, Error> {
        self.update_product(
            key,
            &UpdateProductRequest {
                status: Some(status),
                ..Default::default()
            },
        )
        .await
    }

    /// Deletes a product.
    ///
    /// Removes the product's feature associations, plans, billing cycles,
    /// and dependent subscriptions.
    pub async fn delete_product(&self, key: &str) -> Result<(), Error> {
        self.guarded(async {
            let product = self
                .storage
                .product_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Product, key))?;
            self.storage.delete_product(product.id).await
        })
        .await
    }

    /// Lists products as configured by `params`.
    ///
    /// The underlying store reads are paginated. The returned stream will
    /// fetch additional pages as it is consumed.
    pub fn list_products(
        &self,
        params: &ProductListParams,
    ) -> impl Stream<Item = Result<Product, Error>> + '_ {
        let page_size = params.inner.page_size;
        let status = params.status;
        try_stream! {
            let mut offset = 0u64;
            loop {
                let page = self.storage.list_products(status, page_size, offset).await?;
                let fetched = page.len() as u64;
                for product in page {
                    yield product;
                }
                if fetched < page_size {
                    break;
                }
                offset += fetched;
            }
        }
    }

    /// Associates a feature with a product, declaring that the product
    /// offers the feature. Idempotent.
    pub async fn add_feature_to_product(
        &self,
        product_key: &str,
        feature_key: &str,
    ) -> Result<(), Error> {
        self.guarded(async {
            let product = self
                .storage
                .product_by_key(product_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Product, product_key))?;
            let feature = self
                .storage
                .feature_by_key(feature_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Feature, feature_key))?;
            self.storage
                .add_product_feature(product.id, feature.id, self.now())
                .await
        })
        .await
    }

    /// Removes a feature association from a product. No-op if the
    /// association does not exist.
    pub async fn remove_feature_from_product(
        &self,
        product_key: &str,
        feature_key: &str,
    ) -> Result<(), Error> {
        self.guarded(async {
            let product = self
                .storage
                .product_by_key(product_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Product, product_key))?;
            let feature = self
                .storage
                .feature_by_key(feature_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Feature, feature_key))?;
            self.storage
                .remove_product_feature(product.id, feature.id)
                .await?;
            Ok(())
        })
        .await
    }

    /// Lists the features associated with a product.
    pub async fn list_features_for_product(
        &self,
        product_key: &str,
    ) -> Result<Vec<Feature>, Error> {
        self.guarded(async {
            let product = self
                .storage
                .product_by_key(product_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Product, product_key))?;
            self.storage.features_for_product(product.id).await
        })
        .await
    }

    /// Creates a new feature.
    pub async fn create_feature(&self, feature: &CreateFeatureRequest<'_>) -> Result<Feature, Error> {
        self.guarded(async {
            let mut issues = Vec::new();
            values::check_key("key", feature.key, &mut issues);
            values::check_value(
                "default_value",
                feature.value_type,
                feature.default_value,
                &mut issues,
            );
            if let Some(metadata) = feature.metadata {
                values::check_metadata("metadata", metadata, &mut issues);
            }
            if !issues.is_empty() {
                return Err(Error::validation(issues));
            }
            if self.storage.feature_by_key(feature.key).await?.is_some() {
                return Err(Error::conflict(format!(
                    "feature key already exists: {}",
                    feature.key
                )));
            }
            let now = self.now();
            self.storage
                .insert_feature(NewFeature {
                    key: feature.key.to_owned(),
                    display_name: feature.display_name.to_owned(),
                    description: feature.description.unwrap_or_default().to_owned(),
                    value_type: feature.value_type,
                    default_value: feature.default_value.to_owned(),
                    group_name: feature.group_name.map(str::to_owned),
                    status: feature.status.unwrap_or_default(),
                    metadata: feature
                        .metadata
                        .cloned()
                        .unwrap_or_else(values::empty_metadata),
                    created_at: now,
                })
                .await
        })
        .await
    }

    /// Gets a feature by key.
    pub async fn get_feature(&self, key: &str) -> Result<Option<Feature>, Error> {
        self.guarded(self.storage.feature_by_key(key)).await
    }

    /// Updates a feature. The value type is immutable after creation.
    pub async fn update_feature(
        &self,
        key: &str,
        update: &UpdateFeatureRequest<'_>,
    ) -> Result<Feature, Error> {
        self.guarded(async {
            let mut feature = self
                .storage
                .feature_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Feature, key))?;
            let mut issues = Vec::new();
            if let Some(default_value) = update.default_value {
                values::check_value("default_value", feature.value_type, default_value, &mut issues);
            }
            if let Some(metadata) = update.metadata {
                values::check_metadata("metadata", metadata, &mut issues);
            }
            if !issues.is_empty() {
                return Err(Error::validation(issues));
            }
            if let Some(display_name) = update.display_name {
                feature.display_name = display_name.to_owned();
            }
            if let Some(description) = update.description {
                feature.description = description.to_owned();
            }
            if let Some(default_value) = update.default_value {
                feature.default_value = default_value.to_owned();
            }
            feature.group_name = update
                .group_name
                .map_owned()
                .apply(feature.group_name.take());
            if let Some(status) = update.status {
                feature.status = status;
            }
            if let Some(metadata) = update.metadata {
                feature.metadata = metadata.clone();
            }
            feature.updated_at = self.now();
            self.storage.update_feature(&feature).await?;
            Ok(feature)
        })
        .await
    }

    /// Archives a feature.
    pub async fn archive_feature(&self, key: &str) -> Result<Feature, Error> {
        self.update_feature(
            key,
            &UpdateFeatureRequest {
                status: Some(EntityStatus::Archived),
                ..Default::default()
            },
        )
        .await
    }

    /// Returns an archived feature to the active status.
    pub async fn unarchive_feature(&self, key: &str) -> Result<Feature, Error> {
        self.update_feature(
            key,
            &UpdateFeatureRequest {
                status: Some(EntityStatus::Active),
                ..Default::default()
            },
        )
        .await
    }

    /// Deletes a feature, removing its product associations and plan
    /// values.
    ///
    /// Fails with [`Error::PreconditionFailed`] if a non-archived
    /// subscription holds an override for the feature.
    pub async fn delete_feature(&self, key: &str) -> Result<(), Error> {
        self.guarded(async {
            let feature = self
                .storage
                .feature_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Feature, key))?;
            self.storage.delete_feature(feature.id).await
        })
        .await
    }

    /// Lists features as configured by `params`.
    ///
    /// The underlying store reads are paginated. The returned stream will
    /// fetch additional pages as it is consumed.
    pub fn list_features(
        &self,
        params: &FeatureListParams,
    ) -> impl Stream<Item = Result<Feature, Error>> + '_ {
        let page_size = params.inner.page_size;
        let status = params.status;
        try_stream! {
            let mut offset = 0u64;
            loop {
                let page = self.storage.list_features(status, page_size, offset).await?;
                let fetched = page.len() as u64;
                for feature in page {
                    yield feature;
                }
                if fetched < page_size {
                    break;
                }
                offset += fetched;
            }
        }
    }

    /// Creates a new plan under a product.
    pub async fn create_plan(&self, plan: &CreatePlanRequest<'_>) -> Result<Plan, Error> {
        self.guarded(async {
            let mut issues = Vec::new();
            values::check_key("key", plan.key, &mut issues);
            if let Some(metadata) = plan.metadata {
                values::check_metadata("metadata", metadata, &mut issues);
            }
            if !issues.is_empty() {
                return Err(Error::validation(issues));
            }
            let product = self
                .storage
                .product_by_key(plan.product_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Product, plan.product_key))?;
            // Plan keys are global, so the uniqueness probe ignores the
            // owning product.
            if self.storage.plan_by_key(plan.key).await?.is_some() {
                return Err(Error::conflict(format!("plan key already exists: {}", plan.key)));
            }
            let transition_cycle = match plan.on_expire_transition_to_billing_cycle_key {
                None => None,
                Some(cycle_key) => Some(
                    self.storage
                        .billing_cycle_by_key(cycle_key)
                        .await?
                        .ok_or_else(|| Error::not_found(EntityKind::BillingCycle, cycle_key))?,
                ),
            };
            let now = self.now();
            self.storage
                .insert_plan(NewPlan {
                    key: plan.key.to_owned(),
                    product_id: product.id,
                    display_name: plan.display_name.to_owned(),
                    description: plan.description.unwrap_or_default().to_owned(),
                    status: plan.status.unwrap_or_default(),
                    on_expire_transition_to_billing_cycle_id: transition_cycle.map(|c| c.id),
                    metadata: plan.metadata.cloned().unwrap_or_else(values::empty_metadata),
                    created_at: now,
                })
                .await
        })
        .await
    }

    /// Gets a plan by key.
    pub async fn get_plan(&self, key: &str) -> Result<Option<Plan>, Error> {
        self.guarded(self.storage.plan_by_key(key)).await
    }

    /// Updates a plan.
    pub async fn update_plan(&self, key: &str, update: &UpdatePlanRequest<'_>) -> Result<Plan, Error> {
        self.guarded(async {
            let mut plan = self
                .storage
                .plan_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Plan, key))?;
            if let Some(metadata) = update.metadata {
                let mut issues = Vec::new();
                values::check_metadata("metadata", metadata, &mut issues);
                if !issues.is_empty() {
                    return Err(Error::validation(issues));
                }
                plan.metadata = metadata.clone();
            }
            match update.on_expire_transition_to_billing_cycle_key {
                FieldUpdate::Keep => {}
                FieldUpdate::Clear => {
                    plan.on_expire_transition_to_billing_cycle_id = None;
                    plan.on_expire_transition_to_billing_cycle_key = None;
                }
                FieldUpdate::Set(cycle_key) => {
                    let cycle = self
                        .storage
                        .billing_cycle_by_key(cycle_key)
                        .await?
                        .ok_or_else(|| Error::not_found(EntityKind::BillingCycle, cycle_key))?;
                    plan.on_expire_transition_to_billing_cycle_id = Some(cycle.id);
                    plan.on_expire_transition_to_billing_cycle_key = Some(cycle.key);
                }
            }
            if let Some(display_name) = update.display_name {
                plan.display_name = display_name.to_owned();
            }
            if let Some(description) = update.description {
                plan.description = description.to_owned();
            }
            if let Some(status) = update.status {
                plan.status = status;
            }
            plan.updated_at = self.now();
            self.storage.update_plan(&plan).await?;
            Ok(plan)
        })
        .await
    }

    /// Archives a plan.
    pub async fn archive_plan(&self, key: &str) -> Result<Plan, Error> {
        self.update_plan(
            key,
            &UpdatePlanRequest {
                status: Some(EntityStatus::Archived),
                ..Default::default()
            },
        )
        .await
    }

    /// Returns an archived plan to the active status.
    pub async fn unarchive_plan(&self, key: &str) -> Result<Plan, Error> {
        self.update_plan(
            key,
            &UpdatePlanRequest {
                status: Some(EntityStatus::Active),
                ..Default::default()
            },
        )
        .await
    }

    /// Deletes a plan, removing its feature values, billing cycles, and
    /// dependent subscriptions.
    pub async fn delete_plan(&self, key: &str) -> Result<(), Error> {
        self.guarded(async {
            let plan = self
                .storage
                .plan_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Plan, key))?;
            self.storage.delete_plan(plan.id).await
        })
        .await
    }

    /// Lists plans as configured by `params`.
    ///
    /// The underlying store reads are paginated. The returned stream will
    /// fetch additional pages as it is consumed.
    pub fn list_plans<'a>(
        &'a self,
        params: &PlanListParams<'a>,
    ) -> impl Stream<Item = Result<Plan, Error>> + 'a {
        let page_size = params.inner.page_size;
        let status = params.status;
        let product_key = params.product_key.map(str::to_owned);
        try_stream! {
            // Unknown filter keys resolve to the empty listing.
            let mut resolved = true;
            let mut product_id = None;
            if let Some(key) = &product_key {
                match self.storage.product_by_key(key).await? {
                    Some(product) => product_id = Some(product.id),
                    None => resolved = false,
                }
            }
            if resolved {
                let mut offset = 0u64;
                loop {
                    let page = self
                        .storage
                        .list_plans(product_id, status, page_size, offset)
                        .await?;
                    let fetched = page.len() as u64;
                    for plan in page {
                        yield plan;
                    }
                    if fetched < page_size {
                        break;
                    }
                    offset += fetched;
                }
            }
        }
    }

    /// Sets the value a plan assigns to a feature. Replaces any existing
    /// value for the same (plan, feature) pair.
    pub async fn set_plan_feature_value(
        &self,
        plan_key: &str,
        feature_key: &str,
        value: &str,
    ) -> Result<PlanFeature, Error> {
        self.guarded(async {
            let plan = self
                .storage
                .plan_by_key(plan_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Plan, plan_key))?;
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
                .set_plan_feature(plan.id, feature.id, value, self.now())
                .await
        })
        .await
    }

    /// Removes the value a plan assigns to a feature. No-op if no value is
    /// set.
    pub async fn remove_plan_feature_value(
        &self,
        plan_key: &str,
        feature_key: &str,
    ) -> Result<(), Error> {
        self.guarded(async {
            let plan = self
                .storage
                .plan_by_key(plan_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Plan, plan_key))?;
            let feature = self
                .storage
                .feature_by_key(feature_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Feature, feature_key))?;
            self.storage.remove_plan_feature(plan.id, feature.id).await?;
            Ok(())
        })
        .await
    }

    /// Lists the feature values assigned by a plan.
    pub async fn list_plan_features(&self, plan_key: &str) -> Result<Vec<PlanFeature>, Error> {
        self.guarded(async {
            let plan = self
                .storage
                .plan_by_key(plan_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Plan, plan_key))?;
            self.storage.plan_features(plan.id).await
        })
        .await
    }

    /// Creates a new billing cycle under a plan.
    pub async fn create_billing_cycle(
        &self,
        cycle: &CreateBillingCycleRequest<'_>,
    ) -> Result<BillingCycle, Error> {
        self.guarded(async {
            let mut issues = Vec::new();
            values::check_key("key", cycle.key, &mut issues);
            check_duration("duration_value", cycle.duration_value, cycle.duration_unit, &mut issues);
            if let Some(metadata) = cycle.metadata {
                values::check_metadata("metadata", metadata, &mut issues);
            }
            if !issues.is_empty() {
                return Err(Error::validation(issues));
            }
            let plan = self
                .storage
                .plan_by_key(cycle.plan_key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Plan, cycle.plan_key))?;
            if self.storage.billing_cycle_by_key(cycle.key).await?.is_some() {
                return Err(Error::conflict(format!(
                    "billing cycle key already exists: {}",
                    cycle.key
                )));
            }
            let now = self.now();
            self.storage
                .insert_billing_cycle(NewBillingCycle {
                    key: cycle.key.to_owned(),
                    plan_id: plan.id,
                    display_name: cycle.display_name.to_owned(),
                    description: cycle.description.unwrap_or_default().to_owned(),
                    status: cycle.status.unwrap_or_default(),
                    duration_value: cycle.duration_value,
                    duration_unit: cycle.duration_unit,
                    external_product_id: cycle.external_product_id.map(str::to_owned),
                    metadata: cycle.metadata.cloned().unwrap_or_else(values::empty_metadata),
                    created_at: now,
                })
                .await
        })
        .await
    }

    /// Gets a billing cycle by key.
    pub async fn get_billing_cycle(&self, key: &str) -> Result<Option<BillingCycle>, Error> {
        self.guarded(self.storage.billing_cycle_by_key(key)).await
    }

    /// Updates a billing cycle.
    pub async fn update_billing_cycle(
        &self,
        key: &str,
        update: &UpdateBillingCycleRequest<'_>,
    ) -> Result<BillingCycle, Error> {
        self.guarded(async {
            let mut cycle = self
                .storage
                .billing_cycle_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::BillingCycle, key))?;
            let duration_value = update.duration_value.apply(cycle.duration_value);
            let duration_unit = update.duration_unit.unwrap_or(cycle.duration_unit);
            let mut issues = Vec::new();
            check_duration("duration_value", duration_value, duration_unit, &mut issues);
            if let Some(metadata) = update.metadata {
                values::check_metadata("metadata", metadata, &mut issues);
            }
            if !issues.is_empty() {
                return Err(Error::validation(issues));
            }
            cycle.duration_value = duration_value;
            cycle.duration_unit = duration_unit;
            cycle.external_product_id = update
                .external_product_id
                .map_owned()
                .apply(cycle.external_product_id.take());
            if let Some(display_name) = update.display_name {
                cycle.display_name = display_name.to_owned();
            }
            if let Some(description) = update.description {
                cycle.description = description.to_owned();
            }
            if let Some(status) = update.status {
                cycle.status = status;
            }
            if let Some(metadata) = update.metadata {
                cycle.metadata = metadata.clone();
            }
            cycle.updated_at = self.now();
            self.storage.update_billing_cycle(&cycle).await?;
            Ok(cycle)
        })
        .await
    }

    /// Archives a billing cycle.
    pub async fn archive_billing_cycle(&self, key: &str) -> Result<BillingCycle, Error> {
        self.update_billing_cycle(
            key,
            &UpdateBillingCycleRequest {
                status: Some(EntityStatus::Archived),
                ..Default::default()
            },
        )
        .await
    }

    /// Returns an archived billing cycle to the active status.
    pub async fn unarchive_billing_cycle(&self, key: &str) -> Result<BillingCycle, Error> {
        self.update_billing_cycle(
            key,
            &UpdateBillingCycleRequest {
                status: Some(EntityStatus::Active),
                ..Default::default()
            },
        )
        .await
    }

    /// Deletes a billing cycle, removing the subscriptions that depend on
    /// it.
    pub async fn delete_billing_cycle(&self, key: &str) -> Result<(), Error> {
        self.guarded(async {
            let cycle = self
                .storage
                .billing_cycle_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::BillingCycle, key))?;
            self.storage.delete_billing_cycle(cycle.id).await
        })
        .await
    }

    /// Lists billing cycles as configured by `params`.
    ///
    /// The underlying store reads are paginated. The returned stream will
    /// fetch additional pages as it is consumed.
    pub fn list_billing_cycles<'a>(
        &'a self,
        params: &BillingCycleListParams<'a>,
    ) -> impl Stream<Item = Result<BillingCycle, Error>> + 'a {
        let page_size = params.inner.page_size;
        let status = params.status;
        let plan_key = params.plan_key.map(str::to_owned);
        try_stream! {
            let mut resolved = true;
            let mut plan_id = None;
            if let Some(key) = &plan_key {
                match self.storage.plan_by_key(key).await? {
                    Some(plan) => plan_id = Some(plan.id),
                    None => resolved = false,
                }
            }
            if resolved {
                let mut offset = 0u64;
                loop {
                    let page = self
                        .storage
                        .list_billing_cycles(plan_id, status, page_size, offset)
                        .await?;
                    let fetched = page.len() as u64;
                    for cycle in page {
                        yield cycle;
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

fn check_duration(
    field: &str,
    value: Option<i32>,
    unit: DurationUnit,
    issues: &mut Vec<crate::error::FieldIssue>,
) {
    match (value, unit) {
        (None, DurationUnit::Forever) => {}
        (Some(_), DurationUnit::Forever) => issues.push(crate::error::FieldIssue::new(
            field,
            "a forever cycle must not carry a duration value",
        )),
        (None, _) => issues.push(crate::error::FieldIssue::new(
            field,
            "a bounded cycle requires a duration value",
        )),
        (Some(v), _) if v < 1 => issues.push(crate::error::FieldIssue::new(
            field,
            "duration value must be at least 1",
        )),
        (Some(_), _) => {}
    }
}
