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

//! An in-memory [`Storage`] implementation.
//!
//! Backs the test suite and embedded or demo deployments. Observable
//! behavior matches the PostgreSQL implementation: conflict detection,
//! cascade rules, and id-ordered listings.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::engine::catalog::{BillingCycle, EntityStatus, Feature, Plan, PlanFeature, Product};
use crate::engine::customers::{Customer, CustomerStatus};
use crate::engine::subscriptions::{FeatureOverride, OverrideType, Subscription};
use crate::error::{EntityKind, Error};
use crate::storage::{
    NewBillingCycle, NewCustomer, NewFeature, NewPlan, NewProduct, NewSubscription, Storage,
    SubscriptionFilter,
};

/// An in-memory store. All tables live behind one mutex; rows are held in
/// insertion (and therefore id) order.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    products: Vec<Product>,
    features: Vec<Feature>,
    product_features: Vec<(i64, i64)>,
    plans: Vec<Plan>,
    plan_features: Vec<PlanFeature>,
    billing_cycles: Vec<BillingCycle>,
    customers: Vec<Customer>,
    subscriptions: Vec<Subscription>,
    overrides: Vec<FeatureOverride>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn delete_subscription_rows(&mut self, subscription_id: i64) {
        self.overrides.retain(|o| o.subscription_id != subscription_id);
        self.subscriptions.retain(|s| s.id != subscription_id);
    }

    fn delete_billing_cycle_rows(&mut self, cycle_id: i64) {
        let subscription_ids: Vec<i64> = self
            .subscriptions
            .iter()
            .filter(|s| s.billing_cycle_id == cycle_id)
            .map(|s| s.id)
            .collect();
        for id in subscription_ids {
            self.delete_subscription_rows(id);
        }
        // Fallback references to the deleted cycle are soft; null them.
        for plan in &mut self.plans {
            if plan.on_expire_transition_to_billing_cycle_id == Some(cycle_id) {
                plan.on_expire_transition_to_billing_cycle_id = None;
                plan.on_expire_transition_to_billing_cycle_key = None;
            }
        }
        self.billing_cycles.retain(|c| c.id != cycle_id);
    }

    fn delete_plan_rows(&mut self, plan_id: i64) {
        let cycle_ids: Vec<i64> = self
            .billing_cycles
            .iter()
            .filter(|c| c.plan_id == plan_id)
            .map(|c| c.id)
            .collect();
        for id in cycle_ids {
            self.delete_billing_cycle_rows(id);
        }
        self.plan_features.retain(|pf| pf.plan_id != plan_id);
        // Subscriptions re-pointed at this plan through another cycle would
        // already be gone with their cycles; this catches direct references.
        let subscription_ids: Vec<i64> = self
            .subscriptions
            .iter()
            .filter(|s| s.plan_id == plan_id)
            .map(|s| s.id)
            .collect();
        for id in subscription_ids {
            self.delete_subscription_rows(id);
        }
        self.plans.retain(|p| p.id != plan_id);
    }
}

fn page<T: Clone>(rows: Vec<T>, limit: Option<u64>, offset: u64) -> Vec<T> {
    let iter = rows.into_iter().skip(offset as usize);
    match limit {
        Some(limit) => iter.take(limit as usize).collect(),
        None => iter.collect(),
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_product(&self, new: NewProduct) -> Result<Product, Error> {
        let mut tables = self.lock();
        if tables.products.iter().any(|p| p.key == new.key) {
            return Err(Error::conflict(format!("product key already exists: {}", new.key)));
        }
        let id = tables.next_id();
        let product = Product {
            id,
            key: new.key,
            display_name: new.display_name,
            description: new.description,
            status: new.status,
            metadata: new.metadata,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        tables.products.push(product.clone());
        Ok(product)
    }

    async fn product_by_key(&self, key: &str) -> Result<Option<Product>, Error> {
        Ok(self.lock().products.iter().find(|p| p.key == key).cloned())
    }

    async fn update_product(&self, product: &Product) -> Result<(), Error> {
        let mut tables = self.lock();
        match tables.products.iter_mut().find(|p| p.id == product.id) {
            Some(row) => {
                *row = product.clone();
                Ok(())
            }
            None => Err(Error::not_found(EntityKind::Product, product.id.to_string())),
        }
    }

    async fn delete_product(&self, id: i64) -> Result<(), Error> {
        let mut tables = self.lock();
        let plan_ids: Vec<i64> = tables
            .plans
            .iter()
            .filter(|p| p.product_id == id)
            .map(|p| p.id)
            .collect();
        for plan_id in plan_ids {
            tables.delete_plan_rows(plan_id);
        }
        tables.product_features.retain(|(product_id, _)| *product_id != id);
        tables.products.retain(|p| p.id != id);
        Ok(())
    }

    async fn list_products(
        &self,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Product>, Error> {
        let rows: Vec<Product> = self
            .lock()
            .products
            .iter()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        Ok(page(rows, Some(limit), offset))
    }

    async fn add_product_feature(
        &self,
        product_id: i64,
        feature_id: i64,
        _now: OffsetDateTime,
    ) -> Result<(), Error> {
        let mut tables = self.lock();
        if !tables
            .product_features
            .iter()
            .any(|&(p, f)| p == product_id && f == feature_id)
        {
            tables.product_features.push((product_id, feature_id));
        }
        Ok(())
    }

    async fn remove_product_feature(
        &self,
        product_id: i64,
        feature_id: i64,
    ) -> Result<bool, Error> {
        let mut tables = self.lock();
        let before = tables.product_features.len();
        tables
            .product_features
            .retain(|&(p, f)| !(p == product_id && f == feature_id));
        Ok(tables.product_features.len() != before)
    }

    async fn features_for_product(&self, product_id: i64) -> Result<Vec<Feature>, Error> {
        let tables = self.lock();
        let mut features: Vec<Feature> = tables
            .features
            .iter()
            .filter(|f| {
                tables
                    .product_features
                    .iter()
                    .any(|&(p, fid)| p == product_id && fid == f.id)
            })
            .cloned()
            .collect();
        features.sort_by_key(|f| f.id);
        Ok(features)
    }

    async fn insert_feature(&self, new: NewFeature) -> Result<Feature, Error> {
        let mut tables = self.lock();
        if tables.features.iter().any(|f| f.key == new.key) {
            return Err(Error::conflict(format!("feature key already exists: {}", new.key)));
        }
        let id = tables.next_id();
        let feature = Feature {
            id,
            key: new.key,
            display_name: new.display_name,
            description: new.description,
            value_type: new.value_type,
            default_value: new.default_value,
            group_name: new.group_name,
            status: new.status,
            metadata: new.metadata,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        tables.features.push(feature.clone());
        Ok(feature)
    }

    async fn feature_by_key(&self, key: &str) -> Result<Option<Feature>, Error> {
        Ok(self.lock().features.iter().find(|f| f.key == key).cloned())
    }

    async fn update_feature(&self, feature: &Feature) -> Result<(), Error> {
        let mut tables = self.lock();
        match tables.features.iter_mut().find(|f| f.id == feature.id) {
            Some(row) => {
                *row = feature.clone();
                Ok(())
            }
            None => Err(Error::not_found(EntityKind::Feature, feature.id.to_string())),
        }
    }

    async fn delete_feature(&self, id: i64) -> Result<(), Error> {
        let mut tables = self.lock();
        let live_override = tables.overrides.iter().any(|o| {
            o.feature_id == id
                && tables
                    .subscriptions
                    .iter()
                    .any(|s| s.id == o.subscription_id && !s.is_archived)
        });
        if live_override {
            return Err(Error::PreconditionFailed(format!(
                "feature {id} is overridden by a live subscription"
            )));
        }
        tables.product_features.retain(|&(_, f)| f != id);
        tables.plan_features.retain(|pf| pf.feature_id != id);
        tables.overrides.retain(|o| o.feature_id != id);
        tables.features.retain(|f| f.id != id);
        Ok(())
    }

    async fn list_features(
        &self,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Feature>, Error> {
        let rows: Vec<Feature> = self
            .lock()
            .features
            .iter()
            .filter(|f| status.map_or(true, |s| f.status == s))
            .cloned()
            .collect();
        Ok(page(rows, Some(limit), offset))
    }

    async fn insert_plan(&self, new: NewPlan) -> Result<Plan, Error> {
        let mut tables = self.lock();
        if tables.plans.iter().any(|p| p.key == new.key) {
            return Err(Error::conflict(format!("plan key already exists: {}", new.key)));
        }
        let product_key = tables
            .products
            .iter()
            .find(|p| p.id == new.product_id)
            .map(|p| p.key.clone())
            .ok_or_else(|| Error::not_found(EntityKind::Product, new.product_id.to_string()))?;
        let transition_cycle_key = match new.on_expire_transition_to_billing_cycle_id {
            None => None,
            Some(cycle_id) => Some(
                tables
                    .billing_cycles
                    .iter()
                    .find(|c| c.id == cycle_id)
                    .map(|c| c.key.clone())
                    .ok_or_else(|| {
                        Error::not_found(EntityKind::BillingCycle, cycle_id.to_string())
                    })?,
            ),
        };
        let id = tables.next_id();
        let plan = Plan {
            id,
            key: new.key,
            product_id: new.product_id,
            product_key,
            display_name: new.display_name,
            description: new.description,
            status: new.status,
            on_expire_transition_to_billing_cycle_id: new.on_expire_transition_to_billing_cycle_id,
            on_expire_transition_to_billing_cycle_key: transition_cycle_key,
            metadata: new.metadata,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        tables.plans.push(plan.clone());
        Ok(plan)
    }

    async fn plan_by_key(&self, key: &str) -> Result<Option<Plan>, Error> {
        Ok(self.lock().plans.iter().find(|p| p.key == key).cloned())
    }

    async fn plan_by_id(&self, id: i64) -> Result<Option<Plan>, Error> {
        Ok(self.lock().plans.iter().find(|p| p.id == id).cloned())
    }

    async fn update_plan(&self, plan: &Plan) -> Result<(), Error> {
        let mut tables = self.lock();
        match tables.plans.iter_mut().find(|p| p.id == plan.id) {
            Some(row) => {
                *row = plan.clone();
                Ok(())
            }
            None => Err(Error::not_found(EntityKind::Plan, plan.id.to_string())),
        }
    }

    async fn delete_plan(&self, id: i64) -> Result<(), Error> {
        self.lock().delete_plan_rows(id);
        Ok(())
    }

    async fn list_plans(
        &self,
        product_id: Option<i64>,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Plan>, Error> {
        let rows: Vec<Plan> = self
            .lock()
            .plans
            .iter()
            .filter(|p| product_id.map_or(true, |id| p.product_id == id))
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        Ok(page(rows, Some(limit), offset))
    }

    async fn set_plan_feature(
        &self,
        plan_id: i64,
        feature_id: i64,
        value: &str,
        now: OffsetDateTime,
    ) -> Result<PlanFeature, Error> {
        let mut tables = self.lock();
        let feature_key = tables
            .features
            .iter()
            .find(|f| f.id == feature_id)
            .map(|f| f.key.clone())
            .ok_or_else(|| Error::not_found(EntityKind::Feature, feature_id.to_string()))?;
        if let Some(row) = tables
            .plan_features
            .iter_mut()
            .find(|pf| pf.plan_id == plan_id && pf.feature_id == feature_id)
        {
            row.value = value.to_owned();
            row.updated_at = now;
            return Ok(row.clone());
        }
        let row = PlanFeature {
            plan_id,
            feature_id,
            feature_key,
            value: value.to_owned(),
            created_at: now,
            updated_at: now,
        };
        tables.plan_features.push(row.clone());
        Ok(row)
    }

    async fn remove_plan_feature(&self, plan_id: i64, feature_id: i64) -> Result<bool, Error> {
        let mut tables = self.lock();
        let before = tables.plan_features.len();
        tables
            .plan_features
            .retain(|pf| !(pf.plan_id == plan_id && pf.feature_id == feature_id));
        Ok(tables.plan_features.len() != before)
    }

    async fn plan_features(&self, plan_id: i64) -> Result<Vec<PlanFeature>, Error> {
        let mut rows: Vec<PlanFeature> = self
            .lock()
            .plan_features
            .iter()
            .filter(|pf| pf.plan_id == plan_id)
            .cloned()
            .collect();
        rows.sort_by_key(|pf| pf.feature_id);
        Ok(rows)
    }

    async fn plan_features_for_plans(&self, plan_ids: &[i64]) -> Result<Vec<PlanFeature>, Error> {
        let mut rows: Vec<PlanFeature> = self
            .lock()
            .plan_features
            .iter()
            .filter(|pf| plan_ids.contains(&pf.plan_id))
            .cloned()
            .collect();
        rows.sort_by_key(|pf| (pf.plan_id, pf.feature_id));
        Ok(rows)
    }

    async fn insert_billing_cycle(&self, new: NewBillingCycle) -> Result<BillingCycle, Error> {
        let mut tables = self.lock();
        if tables.billing_cycles.iter().any(|c| c.key == new.key) {
            return Err(Error::conflict(format!(
                "billing cycle key already exists: {}",
                new.key
            )));
        }
        let plan_key = tables
            .plans
            .iter()
            .find(|p| p.id == new.plan_id)
            .map(|p| p.key.clone())
            .ok_or_else(|| Error::not_found(EntityKind::Plan, new.plan_id.to_string()))?;
        let id = tables.next_id();
        let cycle = BillingCycle {
            id,
            key: new.key,
            plan_id: new.plan_id,
            plan_key,
            display_name: new.display_name,
            description: new.description,
            status: new.status,
            duration_value: new.duration_value,
            duration_unit: new.duration_unit,
            external_product_id: new.external_product_id,
            metadata: new.metadata,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        tables.billing_cycles.push(cycle.clone());
        Ok(cycle)
    }

    async fn billing_cycle_by_key(&self, key: &str) -> Result<Option<BillingCycle>, Error> {
        Ok(self
            .lock()
            .billing_cycles
            .iter()
            .find(|c| c.key == key)
            .cloned())
    }

    async fn billing_cycle_by_id(&self, id: i64) -> Result<Option<BillingCycle>, Error> {
        Ok(self
            .lock()
            .billing_cycles
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn update_billing_cycle(&self, cycle: &BillingCycle) -> Result<(), Error> {
        let mut tables = self.lock();
        match tables.billing_cycles.iter_mut().find(|c| c.id == cycle.id) {
            Some(row) => {
                *row = cycle.clone();
                Ok(())
            }
            None => Err(Error::not_found(
                EntityKind::BillingCycle,
                cycle.id.to_string(),
            )),
        }
    }

    async fn delete_billing_cycle(&self, id: i64) -> Result<(), Error> {
        self.lock().delete_billing_cycle_rows(id);
        Ok(())
    }

    async fn list_billing_cycles(
        &self,
        plan_id: Option<i64>,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<BillingCycle>, Error> {
        let rows: Vec<BillingCycle> = self
            .lock()
            .billing_cycles
            .iter()
            .filter(|c| plan_id.map_or(true, |id| c.plan_id == id))
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        Ok(page(rows, Some(limit), offset))
    }

    async fn insert_customer(&self, new: NewCustomer) -> Result<Customer, Error> {
        let mut tables = self.lock();
        if tables.customers.iter().any(|c| c.key == new.key) {
            return Err(Error::conflict(format!(
                "customer key already exists: {}",
                new.key
            )));
        }
        if let Some(external_id) = &new.external_billing_id {
            if tables
                .customers
                .iter()
                .any(|c| c.external_billing_id.as_deref() == Some(external_id))
            {
                return Err(Error::conflict(format!(
                    "external billing id already in use: {external_id}"
                )));
            }
        }
        let id = tables.next_id();
        let customer = Customer {
            id,
            key: new.key,
            display_name: new.display_name,
            email: new.email,
            external_billing_id: new.external_billing_id,
            status: new.status,
            metadata: new.metadata,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        tables.customers.push(customer.clone());
        Ok(customer)
    }

    async fn customer_by_key(&self, key: &str) -> Result<Option<Customer>, Error> {
        Ok(self.lock().customers.iter().find(|c| c.key == key).cloned())
    }

    async fn customer_by_external_billing_id(
        &self,
        external_billing_id: &str,
    ) -> Result<Option<Customer>, Error> {
        Ok(self
            .lock()
            .customers
            .iter()
            .find(|c| c.external_billing_id.as_deref() == Some(external_billing_id))
            .cloned())
    }

    async fn update_customer(&self, customer: &Customer) -> Result<(), Error> {
        let mut tables = self.lock();
        if let Some(external_id) = &customer.external_billing_id {
            if tables
                .customers
                .iter()
                .any(|c| c.id != customer.id && c.external_billing_id.as_deref() == Some(external_id))
            {
                return Err(Error::conflict(format!(
                    "external billing id already in use: {external_id}"
                )));
            }
        }
        match tables.customers.iter_mut().find(|c| c.id == customer.id) {
            Some(row) => {
                *row = customer.clone();
                Ok(())
            }
            None => Err(Error::not_found(
                EntityKind::Customer,
                customer.id.to_string(),
            )),
        }
    }

    async fn delete_customer(&self, id: i64) -> Result<(), Error> {
        let mut tables = self.lock();
        let subscription_ids: Vec<i64> = tables
            .subscriptions
            .iter()
            .filter(|s| s.customer_id == id)
            .map(|s| s.id)
            .collect();
        for subscription_id in subscription_ids {
            tables.delete_subscription_rows(subscription_id);
        }
        tables.customers.retain(|c| c.id != id);
        Ok(())
    }

    async fn list_customers(
        &self,
        status: Option<CustomerStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Customer>, Error> {
        let rows: Vec<Customer> = self
            .lock()
            .customers
            .iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        Ok(page(rows, Some(limit), offset))
    }

    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription, Error> {
        let mut tables = self.lock();
        if tables.subscriptions.iter().any(|s| s.key == new.key) {
            return Err(Error::conflict(format!(
                "subscription key already exists: {}",
                new.key
            )));
        }
        if let Some(stripe_id) = &new.stripe_subscription_id {
            if tables
                .subscriptions
                .iter()
                .any(|s| s.stripe_subscription_id.as_deref() == Some(stripe_id))
            {
                return Err(Error::conflict(format!(
                    "stripe subscription id already in use: {stripe_id}"
                )));
            }
        }
        let customer_key = tables
            .customers
            .iter()
            .find(|c| c.id == new.customer_id)
            .map(|c| c.key.clone())
            .ok_or_else(|| Error::not_found(EntityKind::Customer, new.customer_id.to_string()))?;
        let billing_cycle_key = tables
            .billing_cycles
            .iter()
            .find(|c| c.id == new.billing_cycle_id)
            .map(|c| c.key.clone())
            .ok_or_else(|| {
                Error::not_found(EntityKind::BillingCycle, new.billing_cycle_id.to_string())
            })?;
        let plan_key = tables
            .plans
            .iter()
            .find(|p| p.id == new.plan_id)
            .map(|p| p.key.clone())
            .ok_or_else(|| Error::not_found(EntityKind::Plan, new.plan_id.to_string()))?;
        let product_key = tables
            .products
            .iter()
            .find(|p| p.id == new.product_id)
            .map(|p| p.key.clone())
            .ok_or_else(|| Error::not_found(EntityKind::Product, new.product_id.to_string()))?;
        let id = tables.next_id();
        let subscription = Subscription {
            id,
            key: new.key,
            customer_id: new.customer_id,
            customer_key,
            billing_cycle_id: new.billing_cycle_id,
            billing_cycle_key,
            plan_id: new.plan_id,
            plan_key,
            product_id: new.product_id,
            product_key,
            activation_date: new.activation_date,
            trial_end_date: new.trial_end_date,
            expiration_date: new.expiration_date,
            cancellation_date: new.cancellation_date,
            current_period_start: new.current_period_start,
            current_period_end: new.current_period_end,
            stripe_subscription_id: new.stripe_subscription_id,
            is_archived: false,
            transitioned_at: None,
            metadata: new.metadata,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        tables.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn subscription_by_key(&self, key: &str) -> Result<Option<Subscription>, Error> {
        Ok(self
            .lock()
            .subscriptions
            .iter()
            .find(|s| s.key == key)
            .cloned())
    }

    async fn subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, Error> {
        Ok(self
            .lock()
            .subscriptions
            .iter()
            .find(|s| s.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .cloned())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), Error> {
        let mut tables = self.lock();
        if let Some(stripe_id) = &subscription.stripe_subscription_id {
            if tables.subscriptions.iter().any(|s| {
                s.id != subscription.id && s.stripe_subscription_id.as_deref() == Some(stripe_id)
            }) {
                return Err(Error::conflict(format!(
                    "stripe subscription id already in use: {stripe_id}"
                )));
            }
        }
        match tables
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription.id)
        {
            Some(row) => {
                *row = subscription.clone();
                Ok(())
            }
            None => Err(Error::not_found(
                EntityKind::Subscription,
                subscription.id.to_string(),
            )),
        }
    }

    async fn delete_subscription(&self, id: i64) -> Result<(), Error> {
        self.lock().delete_subscription_rows(id);
        Ok(())
    }

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
        now: OffsetDateTime,
        limit: Option<u64>,
        offset: u64,
    ) -> Result<Vec<Subscription>, Error> {
        let rows: Vec<Subscription> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| filter.customer_id.map_or(true, |id| s.customer_id == id))
            .filter(|s| filter.product_id.map_or(true, |id| s.product_id == id))
            .filter(|s| filter.plan_id.map_or(true, |id| s.plan_id == id))
            .filter(|s| {
                filter
                    .billing_cycle_id
                    .map_or(true, |id| s.billing_cycle_id == id)
            })
            .filter(|s| filter.statuses.is_empty() || filter.statuses.contains(&s.status(now)))
            .cloned()
            .collect();
        Ok(page(rows, limit, offset))
    }

    async fn find_expired_with_transition_plans(
        &self,
        now: OffsetDateTime,
        limit: u64,
    ) -> Result<Vec<Subscription>, Error> {
        let tables = self.lock();
        let rows: Vec<Subscription> = tables
            .subscriptions
            .iter()
            .filter(|s| !s.is_archived)
            .filter(|s| s.cancellation_date.is_none())
            .filter(|s| s.expiration_date.is_some_and(|at| at <= now))
            .filter(|s| {
                tables
                    .plans
                    .iter()
                    .find(|p| p.id == s.plan_id)
                    .is_some_and(|p| p.on_expire_transition_to_billing_cycle_id.is_some())
            })
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn mark_transitioned(&self, id: i64, at: OffsetDateTime) -> Result<(), Error> {
        let mut tables = self.lock();
        match tables.subscriptions.iter_mut().find(|s| s.id == id) {
            Some(row) => {
                row.is_archived = true;
                row.transitioned_at = Some(at);
                row.updated_at = at;
                Ok(())
            }
            None => Err(Error::not_found(EntityKind::Subscription, id.to_string())),
        }
    }

    async fn upsert_override(
        &self,
        subscription_id: i64,
        feature_id: i64,
        value: &str,
        override_type: OverrideType,
        now: OffsetDateTime,
    ) -> Result<FeatureOverride, Error> {
        let mut tables = self.lock();
        let feature_key = tables
            .features
            .iter()
            .find(|f| f.id == feature_id)
            .map(|f| f.key.clone())
            .ok_or_else(|| Error::not_found(EntityKind::Feature, feature_id.to_string()))?;
        if let Some(row) = tables
            .overrides
            .iter_mut()
            .find(|o| o.subscription_id == subscription_id && o.feature_id == feature_id)
        {
            row.value = value.to_owned();
            row.override_type = override_type;
            row.updated_at = now;
            return Ok(row.clone());
        }
        let row = FeatureOverride {
            subscription_id,
            feature_id,
            feature_key,
            value: value.to_owned(),
            override_type,
            created_at: now,
            updated_at: now,
        };
        tables.overrides.push(row.clone());
        Ok(row)
    }

    async fn remove_override(&self, subscription_id: i64, feature_id: i64) -> Result<bool, Error> {
        let mut tables = self.lock();
        let before = tables.overrides.len();
        tables
            .overrides
            .retain(|o| !(o.subscription_id == subscription_id && o.feature_id == feature_id));
        Ok(tables.overrides.len() != before)
    }

    async fn clear_overrides(&self, subscription_id: i64) -> Result<u64, Error> {
        let mut tables = self.lock();
        let before = tables.overrides.len();
        tables.overrides.retain(|o| o.subscription_id != subscription_id);
        Ok((before - tables.overrides.len()) as u64)
    }

    async fn clear_temporary_overrides(&self, subscription_id: i64) -> Result<u64, Error> {
        let mut tables = self.lock();
        let before = tables.overrides.len();
        tables.overrides.retain(|o| {
            o.subscription_id != subscription_id || o.override_type != OverrideType::Temporary
        });
        Ok((before - tables.overrides.len()) as u64)
    }

    async fn overrides_for_subscription(
        &self,
        subscription_id: i64,
    ) -> Result<Vec<FeatureOverride>, Error> {
        let mut rows: Vec<FeatureOverride> = self
            .lock()
            .overrides
            .iter()
            .filter(|o| o.subscription_id == subscription_id)
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.feature_id);
        Ok(rows)
    }

    async fn overrides_for_subscriptions(
        &self,
        subscription_ids: &[i64],
    ) -> Result<Vec<FeatureOverride>, Error> {
        let mut rows: Vec<FeatureOverride> = self
            .lock()
            .overrides
            .iter()
            .filter(|o| subscription_ids.contains(&o.subscription_id))
            .cloned()
            .collect();
        rows.sort_by_key(|o| (o.subscription_id, o.feature_id));
        Ok(rows)
    }
}
