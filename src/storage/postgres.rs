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

//! The PostgreSQL [`Storage`] implementation.
//!
//! Queries are issued at runtime (no compile-time macro checking), so the
//! crate builds without a live database. Foreign keys to lookup entities
//! are carried alongside their keys in every SELECT to keep the engine free
//! of N+1 key resolution.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, QueryBuilder, Row};
use time::OffsetDateTime;

use crate::engine::catalog::{BillingCycle, EntityStatus, Feature, Plan, PlanFeature, Product};
use crate::engine::customers::{Customer, CustomerStatus};
use crate::engine::subscriptions::{FeatureOverride, OverrideType, Subscription};
use crate::error::{EntityKind, Error};
use crate::status::SubscriptionStatus;
use crate::storage::{
    NewBillingCycle, NewCustomer, NewFeature, NewPlan, NewProduct, NewSubscription, Storage,
    SubscriptionFilter,
};

/// A [`Storage`] implementation over a PostgreSQL connection pool.
///
/// A connection is borrowed from the pool for the duration of a single
/// logical operation and returned immediately; nothing is held across
/// suspension points that are not part of the operation.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

const PRODUCT_SELECT: &str = "\
    SELECT id, key, display_name, description, status, metadata, created_at, updated_at \
    FROM products";

const FEATURE_SELECT: &str = "\
    SELECT id, key, display_name, description, value_type, default_value, group_name, \
           status, metadata, created_at, updated_at \
    FROM features";

const PLAN_SELECT: &str = "\
    SELECT p.id, p.key, p.product_id, pr.key AS product_key, p.display_name, \
           p.description, p.status, p.on_expire_transition_to_billing_cycle_id, \
           tbc.key AS on_expire_transition_to_billing_cycle_key, p.metadata, \
           p.created_at, p.updated_at \
    FROM plans p \
    JOIN products pr ON pr.id = p.product_id \
    LEFT JOIN billing_cycles tbc ON tbc.id = p.on_expire_transition_to_billing_cycle_id";

const BILLING_CYCLE_SELECT: &str = "\
    SELECT bc.id, bc.key, bc.plan_id, p.key AS plan_key, bc.display_name, \
           bc.description, bc.status, bc.duration_value, bc.duration_unit, \
           bc.external_product_id, bc.metadata, bc.created_at, bc.updated_at \
    FROM billing_cycles bc \
    JOIN plans p ON p.id = bc.plan_id";

const CUSTOMER_SELECT: &str = "\
    SELECT id, key, display_name, email, external_billing_id, status, metadata, \
           created_at, updated_at \
    FROM customers";

const SUBSCRIPTION_SELECT: &str = "\
    SELECT s.id, s.key, s.customer_id, c.key AS customer_key, \
           s.billing_cycle_id, bc.key AS billing_cycle_key, \
           s.plan_id, p.key AS plan_key, s.product_id, pr.key AS product_key, \
           s.activation_date, s.trial_end_date, s.expiration_date, \
           s.cancellation_date, s.current_period_start, s.current_period_end, \
           s.stripe_subscription_id, s.is_archived, s.transitioned_at, \
           s.metadata, s.created_at, s.updated_at \
    FROM subscriptions s \
    JOIN customers c ON c.id = s.customer_id \
    JOIN billing_cycles bc ON bc.id = s.billing_cycle_id \
    JOIN plans p ON p.id = s.plan_id \
    JOIN products pr ON pr.id = s.product_id";

const PLAN_FEATURE_SELECT: &str = "\
    SELECT pf.plan_id, pf.feature_id, f.key AS feature_key, pf.value, \
           pf.created_at, pf.updated_at \
    FROM plan_features pf \
    JOIN features f ON f.id = pf.feature_id";

const OVERRIDE_SELECT: &str = "\
    SELECT o.subscription_id, o.feature_id, f.key AS feature_key, o.value, \
           o.override_type, o.created_at, o.updated_at \
    FROM subscription_feature_overrides o \
    JOIN features f ON f.id = o.feature_id";

/// The schema, one statement per entry, idempotent. The plan-to-billing-
/// cycle foreign key is added after both tables exist because the two
/// tables reference each other.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS products (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'active',
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS features (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        value_type TEXT NOT NULL,
        default_value TEXT NOT NULL,
        group_name TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS product_features (
        product_id BIGINT NOT NULL REFERENCES products (id) ON DELETE CASCADE,
        feature_id BIGINT NOT NULL REFERENCES features (id) ON DELETE CASCADE,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (product_id, feature_id)
    )",
    "CREATE TABLE IF NOT EXISTS plans (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        product_id BIGINT NOT NULL REFERENCES products (id) ON DELETE CASCADE,
        display_name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'active',
        on_expire_transition_to_billing_cycle_id BIGINT,
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (product_id, key)
    )",
    "CREATE TABLE IF NOT EXISTS billing_cycles (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        plan_id BIGINT NOT NULL REFERENCES plans (id) ON DELETE CASCADE,
        display_name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'active',
        duration_value INTEGER,
        duration_unit TEXT NOT NULL,
        external_product_id TEXT,
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (plan_id, key)
    )",
    "ALTER TABLE plans
        DROP CONSTRAINT IF EXISTS plans_on_expire_transition_fkey",
    "ALTER TABLE plans
        ADD CONSTRAINT plans_on_expire_transition_fkey
        FOREIGN KEY (on_expire_transition_to_billing_cycle_id)
        REFERENCES billing_cycles (id) ON DELETE SET NULL",
    "CREATE TABLE IF NOT EXISTS plan_features (
        plan_id BIGINT NOT NULL REFERENCES plans (id) ON DELETE CASCADE,
        feature_id BIGINT NOT NULL REFERENCES features (id) ON DELETE CASCADE,
        value TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (plan_id, feature_id)
    )",
    "CREATE TABLE IF NOT EXISTS customers (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        email TEXT NOT NULL,
        external_billing_id TEXT UNIQUE,
        status TEXT NOT NULL DEFAULT 'active',
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS subscriptions (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        customer_id BIGINT NOT NULL REFERENCES customers (id) ON DELETE CASCADE,
        billing_cycle_id BIGINT NOT NULL REFERENCES billing_cycles (id) ON DELETE CASCADE,
        plan_id BIGINT NOT NULL REFERENCES plans (id) ON DELETE CASCADE,
        product_id BIGINT NOT NULL REFERENCES products (id) ON DELETE CASCADE,
        activation_date TIMESTAMPTZ,
        trial_end_date TIMESTAMPTZ,
        expiration_date TIMESTAMPTZ,
        cancellation_date TIMESTAMPTZ,
        current_period_start TIMESTAMPTZ,
        current_period_end TIMESTAMPTZ,
        stripe_subscription_id TEXT UNIQUE,
        is_archived BOOLEAN NOT NULL DEFAULT FALSE,
        transitioned_at TIMESTAMPTZ,
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS subscriptions_customer_idx
        ON subscriptions (customer_id)",
    "CREATE INDEX IF NOT EXISTS subscriptions_expiration_idx
        ON subscriptions (expiration_date)
        WHERE NOT is_archived AND cancellation_date IS NULL",
    "CREATE TABLE IF NOT EXISTS subscription_feature_overrides (
        subscription_id BIGINT NOT NULL REFERENCES subscriptions (id) ON DELETE CASCADE,
        feature_id BIGINT NOT NULL REFERENCES features (id) ON DELETE CASCADE,
        value TEXT NOT NULL,
        override_type TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (subscription_id, feature_id)
    )",
    "CREATE TABLE IF NOT EXISTS system_config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
];

impl PostgresStorage {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> PostgresStorage {
        PostgresStorage { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates any missing tables, constraints, and indexes. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_inserted<T>(&self, select: &str, id: i64) -> Result<T, Error>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let sql = format!("{select} WHERE {} = $1", id_column(select));
        sqlx::query_as::<_, T>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::Internal(sqlx::Error::RowNotFound))
    }
}

// The joined SELECTs alias their driving table; plain ones do not.
fn id_column(select: &str) -> &'static str {
    if select.contains("FROM subscriptions s") {
        "s.id"
    } else if select.contains("FROM plans p") {
        "p.id"
    } else if select.contains("FROM billing_cycles bc") {
        "bc.id"
    } else {
        "id"
    }
}

fn parse_field<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|source| sqlx::Error::ColumnDecode {
        index: column.to_owned(),
        source: Box::new(source),
    })
}

impl<'r> FromRow<'r, PgRow> for Product {
    fn from_row(row: &'r PgRow) -> Result<Product, sqlx::Error> {
        Ok(Product {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            display_name: row.try_get("display_name")?,
            description: row.try_get("description")?,
            status: parse_field(row, "status")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for Feature {
    fn from_row(row: &'r PgRow) -> Result<Feature, sqlx::Error> {
        Ok(Feature {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            display_name: row.try_get("display_name")?,
            description: row.try_get("description")?,
            value_type: parse_field(row, "value_type")?,
            default_value: row.try_get("default_value")?,
            group_name: row.try_get("group_name")?,
            status: parse_field(row, "status")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for Plan {
    fn from_row(row: &'r PgRow) -> Result<Plan, sqlx::Error> {
        Ok(Plan {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            product_id: row.try_get("product_id")?,
            product_key: row.try_get("product_key")?,
            display_name: row.try_get("display_name")?,
            description: row.try_get("description")?,
            status: parse_field(row, "status")?,
            on_expire_transition_to_billing_cycle_id: row
                .try_get("on_expire_transition_to_billing_cycle_id")?,
            on_expire_transition_to_billing_cycle_key: row
                .try_get("on_expire_transition_to_billing_cycle_key")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for BillingCycle {
    fn from_row(row: &'r PgRow) -> Result<BillingCycle, sqlx::Error> {
        Ok(BillingCycle {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            plan_id: row.try_get("plan_id")?,
            plan_key: row.try_get("plan_key")?,
            display_name: row.try_get("display_name")?,
            description: row.try_get("description")?,
            status: parse_field(row, "status")?,
            duration_value: row.try_get("duration_value")?,
            duration_unit: parse_field(row, "duration_unit")?,
            external_product_id: row.try_get("external_product_id")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for Customer {
    fn from_row(row: &'r PgRow) -> Result<Customer, sqlx::Error> {
        Ok(Customer {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            display_name: row.try_get("display_name")?,
            email: row.try_get("email")?,
            external_billing_id: row.try_get("external_billing_id")?,
            status: parse_field(row, "status")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for Subscription {
    fn from_row(row: &'r PgRow) -> Result<Subscription, sqlx::Error> {
        Ok(Subscription {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            customer_id: row.try_get("customer_id")?,
            customer_key: row.try_get("customer_key")?,
            billing_cycle_id: row.try_get("billing_cycle_id")?,
            billing_cycle_key: row.try_get("billing_cycle_key")?,
            plan_id: row.try_get("plan_id")?,
            plan_key: row.try_get("plan_key")?,
            product_id: row.try_get("product_id")?,
            product_key: row.try_get("product_key")?,
            activation_date: row.try_get("activation_date")?,
            trial_end_date: row.try_get("trial_end_date")?,
            expiration_date: row.try_get("expiration_date")?,
            cancellation_date: row.try_get("cancellation_date")?,
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            is_archived: row.try_get("is_archived")?,
            transitioned_at: row.try_get("transitioned_at")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for PlanFeature {
    fn from_row(row: &'r PgRow) -> Result<PlanFeature, sqlx::Error> {
        Ok(PlanFeature {
            plan_id: row.try_get("plan_id")?,
            feature_id: row.try_get("feature_id")?,
            feature_key: row.try_get("feature_key")?,
            value: row.try_get("value")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for FeatureOverride {
    fn from_row(row: &'r PgRow) -> Result<FeatureOverride, sqlx::Error> {
        Ok(FeatureOverride {
            subscription_id: row.try_get("subscription_id")?,
            feature_id: row.try_get("feature_id")?,
            feature_key: row.try_get("feature_key")?,
            value: row.try_get("value")?,
            override_type: parse_field(row, "override_type")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Appends the SQL predicate equivalent to deriving `status` at `now`.
///
/// Must match `crate::status::derive_status` clause for clause, including
/// the precedence encoded by the negated earlier rules.
fn push_status_predicate(
    builder: &mut QueryBuilder<'_, sqlx::Postgres>,
    status: SubscriptionStatus,
    now: OffsetDateTime,
) {
    match status {
        SubscriptionStatus::Archived => {
            builder.push("s.is_archived");
        }
        SubscriptionStatus::Cancelled => {
            builder
                .push("NOT s.is_archived AND s.cancellation_date IS NOT NULL AND (s.current_period_end IS NULL OR s.current_period_end <= ");
            builder.push_bind(now);
            builder.push(")");
        }
        SubscriptionStatus::CancellationPending => {
            builder.push(
                "NOT s.is_archived AND s.cancellation_date IS NOT NULL AND s.current_period_end IS NOT NULL AND s.current_period_end > ",
            );
            builder.push_bind(now);
        }
        SubscriptionStatus::Expired => {
            builder.push(
                "NOT s.is_archived AND s.cancellation_date IS NULL AND s.expiration_date IS NOT NULL AND s.expiration_date <= ",
            );
            builder.push_bind(now);
        }
        SubscriptionStatus::Trial => {
            builder.push(
                "NOT s.is_archived AND s.cancellation_date IS NULL AND (s.expiration_date IS NULL OR s.expiration_date > ",
            );
            builder.push_bind(now);
            builder.push(") AND s.trial_end_date IS NOT NULL AND s.trial_end_date > ");
            builder.push_bind(now);
        }
        SubscriptionStatus::Pending => {
            builder.push(
                "NOT s.is_archived AND s.cancellation_date IS NULL AND (s.expiration_date IS NULL OR s.expiration_date > ",
            );
            builder.push_bind(now);
            builder.push(") AND (s.trial_end_date IS NULL OR s.trial_end_date <= ");
            builder.push_bind(now);
            builder.push(") AND s.activation_date IS NOT NULL AND s.activation_date > ");
            builder.push_bind(now);
        }
        SubscriptionStatus::Active => {
            builder.push(
                "NOT s.is_archived AND s.cancellation_date IS NULL AND (s.expiration_date IS NULL OR s.expiration_date > ",
            );
            builder.push_bind(now);
            builder.push(") AND (s.trial_end_date IS NULL OR s.trial_end_date <= ");
            builder.push_bind(now);
            builder.push(") AND (s.activation_date IS NULL OR s.activation_date <= ");
            builder.push_bind(now);
            builder.push(")");
        }
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn insert_product(&self, new: NewProduct) -> Result<Product, Error> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO products (key, display_name, description, status, metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $6) RETURNING id",
        )
        .bind(&new.key)
        .bind(&new.display_name)
        .bind(&new.description)
        .bind(new.status.as_str())
        .bind(&new.metadata)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await?;
        self.fetch_inserted(PRODUCT_SELECT, id).await
    }

    async fn product_by_key(&self, key: &str) -> Result<Option<Product>, Error> {
        let sql = format!("{PRODUCT_SELECT} WHERE key = $1");
        Ok(sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_product(&self, product: &Product) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE products SET display_name = $2, description = $3, status = $4, \
             metadata = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(product.id)
        .bind(&product.display_name)
        .bind(&product.description)
        .bind(product.status.as_str())
        .bind(&product.metadata)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(EntityKind::Product, product.id.to_string()));
        }
        Ok(())
    }

    async fn delete_product(&self, id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_products(
        &self,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Product>, Error> {
        let sql = format!(
            "{PRODUCT_SELECT} WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY id LIMIT $2 OFFSET $3"
        );
        Ok(sqlx::query_as(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn add_product_feature(
        &self,
        product_id: i64,
        feature_id: i64,
        now: OffsetDateTime,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO product_features (product_id, feature_id, created_at) \
             VALUES ($1, $2, $3) ON CONFLICT (product_id, feature_id) DO NOTHING",
        )
        .bind(product_id)
        .bind(feature_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_product_feature(
        &self,
        product_id: i64,
        feature_id: i64,
    ) -> Result<bool, Error> {
        let result =
            sqlx::query("DELETE FROM product_features WHERE product_id = $1 AND feature_id = $2")
                .bind(product_id)
                .bind(feature_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn features_for_product(&self, product_id: i64) -> Result<Vec<Feature>, Error> {
        let sql = format!(
            "{FEATURE_SELECT} WHERE id IN \
             (SELECT feature_id FROM product_features WHERE product_id = $1) \
             ORDER BY id"
        );
        Ok(sqlx::query_as(&sql)
            .bind(product_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_feature(&self, new: NewFeature) -> Result<Feature, Error> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO features (key, display_name, description, value_type, default_value, \
             group_name, status, metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) RETURNING id",
        )
        .bind(&new.key)
        .bind(&new.display_name)
        .bind(&new.description)
        .bind(new.value_type.as_str())
        .bind(&new.default_value)
        .bind(&new.group_name)
        .bind(new.status.as_str())
        .bind(&new.metadata)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await?;
        self.fetch_inserted(FEATURE_SELECT, id).await
    }

    async fn feature_by_key(&self, key: &str) -> Result<Option<Feature>, Error> {
        let sql = format!("{FEATURE_SELECT} WHERE key = $1");
        Ok(sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_feature(&self, feature: &Feature) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE features SET display_name = $2, description = $3, default_value = $4, \
             group_name = $5, status = $6, metadata = $7, updated_at = $8 WHERE id = $1",
        )
        .bind(feature.id)
        .bind(&feature.display_name)
        .bind(&feature.description)
        .bind(&feature.default_value)
        .bind(&feature.group_name)
        .bind(feature.status.as_str())
        .bind(&feature.metadata)
        .bind(feature.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(EntityKind::Feature, feature.id.to_string()));
        }
        Ok(())
    }

    async fn delete_feature(&self, id: i64) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        let live_override: bool = sqlx::query_scalar(
            "SELECT EXISTS (\
                 SELECT 1 FROM subscription_feature_overrides o \
                 JOIN subscriptions s ON s.id = o.subscription_id \
                 WHERE o.feature_id = $1 AND NOT s.is_archived)",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if live_override {
            return Err(Error::PreconditionFailed(format!(
                "feature {id} is overridden by a live subscription"
            )));
        }
        sqlx::query("DELETE FROM features WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_features(
        &self,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Feature>, Error> {
        let sql = format!(
            "{FEATURE_SELECT} WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY id LIMIT $2 OFFSET $3"
        );
        Ok(sqlx::query_as(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_plan(&self, new: NewPlan) -> Result<Plan, Error> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO plans (key, product_id, display_name, description, status, \
             on_expire_transition_to_billing_cycle_id, metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) RETURNING id",
        )
        .bind(&new.key)
        .bind(new.product_id)
        .bind(&new.display_name)
        .bind(&new.description)
        .bind(new.status.as_str())
        .bind(new.on_expire_transition_to_billing_cycle_id)
        .bind(&new.metadata)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await?;
        self.fetch_inserted(PLAN_SELECT, id).await
    }

    async fn plan_by_key(&self, key: &str) -> Result<Option<Plan>, Error> {
        let sql = format!("{PLAN_SELECT} WHERE p.key = $1");
        Ok(sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn plan_by_id(&self, id: i64) -> Result<Option<Plan>, Error> {
        let sql = format!("{PLAN_SELECT} WHERE p.id = $1");
        Ok(sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_plan(&self, plan: &Plan) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE plans SET display_name = $2, description = $3, status = $4, \
             on_expire_transition_to_billing_cycle_id = $5, metadata = $6, updated_at = $7 \
             WHERE id = $1",
        )
        .bind(plan.id)
        .bind(&plan.display_name)
        .bind(&plan.description)
        .bind(plan.status.as_str())
        .bind(plan.on_expire_transition_to_billing_cycle_id)
        .bind(&plan.metadata)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(EntityKind::Plan, plan.id.to_string()));
        }
        Ok(())
    }

    async fn delete_plan(&self, id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM plans WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_plans(
        &self,
        product_id: Option<i64>,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Plan>, Error> {
        let sql = format!(
            "{PLAN_SELECT} WHERE ($1::BIGINT IS NULL OR p.product_id = $1) \
             AND ($2::TEXT IS NULL OR p.status = $2) \
             ORDER BY p.id LIMIT $3 OFFSET $4"
        );
        Ok(sqlx::query_as(&sql)
            .bind(product_id)
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn set_plan_feature(
        &self,
        plan_id: i64,
        feature_id: i64,
        value: &str,
        now: OffsetDateTime,
    ) -> Result<PlanFeature, Error> {
        sqlx::query(
            "INSERT INTO plan_features (plan_id, feature_id, value, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $4) \
             ON CONFLICT (plan_id, feature_id) \
             DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
        )
        .bind(plan_id)
        .bind(feature_id)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let sql = format!("{PLAN_FEATURE_SELECT} WHERE pf.plan_id = $1 AND pf.feature_id = $2");
        sqlx::query_as(&sql)
            .bind(plan_id)
            .bind(feature_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::Internal(sqlx::Error::RowNotFound))
    }

    async fn remove_plan_feature(&self, plan_id: i64, feature_id: i64) -> Result<bool, Error> {
        let result =
            sqlx::query("DELETE FROM plan_features WHERE plan_id = $1 AND feature_id = $2")
                .bind(plan_id)
                .bind(feature_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn plan_features(&self, plan_id: i64) -> Result<Vec<PlanFeature>, Error> {
        let sql = format!("{PLAN_FEATURE_SELECT} WHERE pf.plan_id = $1 ORDER BY pf.feature_id");
        Ok(sqlx::query_as(&sql)
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn plan_features_for_plans(&self, plan_ids: &[i64]) -> Result<Vec<PlanFeature>, Error> {
        let sql = format!(
            "{PLAN_FEATURE_SELECT} WHERE pf.plan_id = ANY($1) \
             ORDER BY pf.plan_id, pf.feature_id"
        );
        Ok(sqlx::query_as(&sql)
            .bind(plan_ids)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_billing_cycle(&self, new: NewBillingCycle) -> Result<BillingCycle, Error> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO billing_cycles (key, plan_id, display_name, description, status, \
             duration_value, duration_unit, external_product_id, metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) RETURNING id",
        )
        .bind(&new.key)
        .bind(new.plan_id)
        .bind(&new.display_name)
        .bind(&new.description)
        .bind(new.status.as_str())
        .bind(new.duration_value)
        .bind(new.duration_unit.as_str())
        .bind(&new.external_product_id)
        .bind(&new.metadata)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await?;
        self.fetch_inserted(BILLING_CYCLE_SELECT, id).await
    }

    async fn billing_cycle_by_key(&self, key: &str) -> Result<Option<BillingCycle>, Error> {
        let sql = format!("{BILLING_CYCLE_SELECT} WHERE bc.key = $1");
        Ok(sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn billing_cycle_by_id(&self, id: i64) -> Result<Option<BillingCycle>, Error> {
        let sql = format!("{BILLING_CYCLE_SELECT} WHERE bc.id = $1");
        Ok(sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_billing_cycle(&self, cycle: &BillingCycle) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE billing_cycles SET display_name = $2, description = $3, status = $4, \
             duration_value = $5, duration_unit = $6, external_product_id = $7, \
             metadata = $8, updated_at = $9 WHERE id = $1",
        )
        .bind(cycle.id)
        .bind(&cycle.display_name)
        .bind(&cycle.description)
        .bind(cycle.status.as_str())
        .bind(cycle.duration_value)
        .bind(cycle.duration_unit.as_str())
        .bind(&cycle.external_product_id)
        .bind(&cycle.metadata)
        .bind(cycle.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(
                EntityKind::BillingCycle,
                cycle.id.to_string(),
            ));
        }
        Ok(())
    }

    async fn delete_billing_cycle(&self, id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM billing_cycles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_billing_cycles(
        &self,
        plan_id: Option<i64>,
        status: Option<EntityStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<BillingCycle>, Error> {
        let sql = format!(
            "{BILLING_CYCLE_SELECT} WHERE ($1::BIGINT IS NULL OR bc.plan_id = $1) \
             AND ($2::TEXT IS NULL OR bc.status = $2) \
             ORDER BY bc.id LIMIT $3 OFFSET $4"
        );
        Ok(sqlx::query_as(&sql)
            .bind(plan_id)
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_customer(&self, new: NewCustomer) -> Result<Customer, Error> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO customers (key, display_name, email, external_billing_id, status, \
             metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7) RETURNING id",
        )
        .bind(&new.key)
        .bind(&new.display_name)
        .bind(&new.email)
        .bind(&new.external_billing_id)
        .bind(new.status.as_str())
        .bind(&new.metadata)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await?;
        self.fetch_inserted(CUSTOMER_SELECT, id).await
    }

    async fn customer_by_key(&self, key: &str) -> Result<Option<Customer>, Error> {
        let sql = format!("{CUSTOMER_SELECT} WHERE key = $1");
        Ok(sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn customer_by_external_billing_id(
        &self,
        external_billing_id: &str,
    ) -> Result<Option<Customer>, Error> {
        let sql = format!("{CUSTOMER_SELECT} WHERE external_billing_id = $1");
        Ok(sqlx::query_as(&sql)
            .bind(external_billing_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_customer(&self, customer: &Customer) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE customers SET display_name = $2, email = $3, external_billing_id = $4, \
             status = $5, metadata = $6, updated_at = $7 WHERE id = $1",
        )
        .bind(customer.id)
        .bind(&customer.display_name)
        .bind(&customer.email)
        .bind(&customer.external_billing_id)
        .bind(customer.status.as_str())
        .bind(&customer.metadata)
        .bind(customer.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(
                EntityKind::Customer,
                customer.id.to_string(),
            ));
        }
        Ok(())
    }

    async fn delete_customer(&self, id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM customers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_customers(
        &self,
        status: Option<CustomerStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Customer>, Error> {
        let sql = format!(
            "{CUSTOMER_SELECT} WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY id LIMIT $2 OFFSET $3"
        );
        Ok(sqlx::query_as(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription, Error> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO subscriptions (key, customer_id, billing_cycle_id, plan_id, product_id, \
             activation_date, trial_end_date, expiration_date, cancellation_date, \
             current_period_start, current_period_end, stripe_subscription_id, is_archived, \
             metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, FALSE, $13, $14, $14) \
             RETURNING id",
        )
        .bind(&new.key)
        .bind(new.customer_id)
        .bind(new.billing_cycle_id)
        .bind(new.plan_id)
        .bind(new.product_id)
        .bind(new.activation_date)
        .bind(new.trial_end_date)
        .bind(new.expiration_date)
        .bind(new.cancellation_date)
        .bind(new.current_period_start)
        .bind(new.current_period_end)
        .bind(&new.stripe_subscription_id)
        .bind(&new.metadata)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await?;
        self.fetch_inserted(SUBSCRIPTION_SELECT, id).await
    }

    async fn subscription_by_key(&self, key: &str) -> Result<Option<Subscription>, Error> {
        let sql = format!("{SUBSCRIPTION_SELECT} WHERE s.key = $1");
        Ok(sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, Error> {
        let sql = format!("{SUBSCRIPTION_SELECT} WHERE s.stripe_subscription_id = $1");
        Ok(sqlx::query_as(&sql)
            .bind(stripe_subscription_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE subscriptions SET billing_cycle_id = $2, plan_id = $3, product_id = $4, \
             trial_end_date = $5, expiration_date = $6, cancellation_date = $7, \
             current_period_start = $8, current_period_end = $9, stripe_subscription_id = $10, \
             is_archived = $11, transitioned_at = $12, metadata = $13, updated_at = $14 \
             WHERE id = $1",
        )
        .bind(subscription.id)
        .bind(subscription.billing_cycle_id)
        .bind(subscription.plan_id)
        .bind(subscription.product_id)
        .bind(subscription.trial_end_date)
        .bind(subscription.expiration_date)
        .bind(subscription.cancellation_date)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(&subscription.stripe_subscription_id)
        .bind(subscription.is_archived)
        .bind(subscription.transitioned_at)
        .bind(&subscription.metadata)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(
                EntityKind::Subscription,
                subscription.id.to_string(),
            ));
        }
        Ok(())
    }

    async fn delete_subscription(&self, id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
        now: OffsetDateTime,
        limit: Option<u64>,
        offset: u64,
    ) -> Result<Vec<Subscription>, Error> {
        let mut builder = QueryBuilder::new(SUBSCRIPTION_SELECT);
        builder.push(" WHERE 1 = 1");
        if let Some(id) = filter.customer_id {
            builder.push(" AND s.customer_id = ");
            builder.push_bind(id);
        }
        if let Some(id) = filter.product_id {
            builder.push(" AND s.product_id = ");
            builder.push_bind(id);
        }
        if let Some(id) = filter.plan_id {
            builder.push(" AND s.plan_id = ");
            builder.push_bind(id);
        }
        if let Some(id) = filter.billing_cycle_id {
            builder.push(" AND s.billing_cycle_id = ");
            builder.push_bind(id);
        }
        if !filter.statuses.is_empty() {
            builder.push(" AND (");
            for (i, status) in filter.statuses.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder.push("(");
                push_status_predicate(&mut builder, *status, now);
                builder.push(")");
            }
            builder.push(")");
        }
        builder.push(" ORDER BY s.id");
        if let Some(limit) = limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }
        builder.push(" OFFSET ");
        builder.push_bind(offset as i64);
        Ok(builder
            .build_query_as::<Subscription>()
            .fetch_all(&self.pool)
            .await?)
    }

    async fn find_expired_with_transition_plans(
        &self,
        now: OffsetDateTime,
        limit: u64,
    ) -> Result<Vec<Subscription>, Error> {
        let sql = format!(
            "{SUBSCRIPTION_SELECT} \
             WHERE NOT s.is_archived \
               AND s.cancellation_date IS NULL \
               AND s.expiration_date IS NOT NULL AND s.expiration_date <= $1 \
               AND p.on_expire_transition_to_billing_cycle_id IS NOT NULL \
             ORDER BY s.id LIMIT $2"
        );
        Ok(sqlx::query_as(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn mark_transitioned(&self, id: i64, at: OffsetDateTime) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE subscriptions SET is_archived = TRUE, transitioned_at = $2, updated_at = $2 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(EntityKind::Subscription, id.to_string()));
        }
        Ok(())
    }

    async fn upsert_override(
        &self,
        subscription_id: i64,
        feature_id: i64,
        value: &str,
        override_type: OverrideType,
        now: OffsetDateTime,
    ) -> Result<FeatureOverride, Error> {
        sqlx::query(
            "INSERT INTO subscription_feature_overrides \
             (subscription_id, feature_id, value, override_type, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5) \
             ON CONFLICT (subscription_id, feature_id) \
             DO UPDATE SET value = EXCLUDED.value, override_type = EXCLUDED.override_type, \
                           updated_at = EXCLUDED.updated_at",
        )
        .bind(subscription_id)
        .bind(feature_id)
        .bind(value)
        .bind(override_type.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        let sql = format!(
            "{OVERRIDE_SELECT} WHERE o.subscription_id = $1 AND o.feature_id = $2"
        );
        sqlx::query_as(&sql)
            .bind(subscription_id)
            .bind(feature_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::Internal(sqlx::Error::RowNotFound))
    }

    async fn remove_override(&self, subscription_id: i64, feature_id: i64) -> Result<bool, Error> {
        let result = sqlx::query(
            "DELETE FROM subscription_feature_overrides \
             WHERE subscription_id = $1 AND feature_id = $2",
        )
        .bind(subscription_id)
        .bind(feature_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_overrides(&self, subscription_id: i64) -> Result<u64, Error> {
        let result =
            sqlx::query("DELETE FROM subscription_feature_overrides WHERE subscription_id = $1")
                .bind(subscription_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn clear_temporary_overrides(&self, subscription_id: i64) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM subscription_feature_overrides \
             WHERE subscription_id = $1 AND override_type = 'temporary'",
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn overrides_for_subscription(
        &self,
        subscription_id: i64,
    ) -> Result<Vec<FeatureOverride>, Error> {
        let sql = format!(
            "{OVERRIDE_SELECT} WHERE o.subscription_id = $1 ORDER BY o.feature_id"
        );
        Ok(sqlx::query_as(&sql)
            .bind(subscription_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn overrides_for_subscriptions(
        &self,
        subscription_ids: &[i64],
    ) -> Result<Vec<FeatureOverride>, Error> {
        let sql = format!(
            "{OVERRIDE_SELECT} WHERE o.subscription_id = ANY($1) \
             ORDER BY o.subscription_id, o.feature_id"
        );
        Ok(sqlx::query_as(&sql)
            .bind(subscription_ids)
            .fetch_all(&self.pool)
            .await?)
    }
}
