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

//! A subscription and feature-entitlement engine for multi-tenant SaaS
//! applications.
//!
//! The engine answers two questions at scale: *which plan does a given
//! customer currently hold for a given product?* and *what is the effective
//! value of a given feature for that customer?* It also advances
//! subscriptions through their lifecycle — trial, active,
//! cancellation-pending, expired — and automatically transitions expired
//! paid subscriptions to a configured fallback plan.
//!
//! # Overview
//!
//! The entry point is [`Engine`], which groups four concerns:
//!
//! * the **catalog**: products, features, plans, plan feature values, and
//!   billing cycles;
//! * the **subscription manager**: create, update, archive, and override
//!   operations (see [`Engine::create_subscription`]);
//! * the **feature checker**: the three-level value resolution of
//!   [`Engine::get_value_for_customer`];
//! * the **transition worker**: [`Engine::run_transitions`], invoked on a
//!   schedule by the host.
//!
//! Subscription status is never stored; it is derived from dates and flags
//! on every read (see [`derive_status`]), with "now" supplied by an
//! injectable [`Clock`].
//!
//! Persistence is a port: [`Storage`] is implemented by
//! [`PostgresStorage`] for production and [`MemoryStorage`] for tests and
//! embedding.
//!
//! # Example
//!
//! ```no_run
//! use subscrio::{Engine, EngineConfig};
//!
//! # async fn example() -> Result<(), subscrio::Error> {
//! let engine = Engine::connect(EngineConfig {
//!     connection_string: "postgres://localhost/subscrio".into(),
//!     pool_size: None,
//!     tls: false,
//! })
//! .await?;
//! let value = engine
//!     .get_value_for_customer("acme-corp", "projecthub", "max-projects", None)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Pricing, invoicing, proration, tax, dunning, and payment collection are
//! out of scope: the engine records a subscription's plan and period, not
//! its money.

#[warn(missing_debug_implementations, missing_docs)]
mod clock;
mod config;
mod engine;
mod error;
mod period;
mod status;
mod storage;
mod values;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{EngineBuilder, EngineConfig, FieldUpdate, ListParams, DEFAULT_POOL_SIZE};
pub use engine::catalog::{
    BillingCycle, BillingCycleListParams, CreateBillingCycleRequest, CreateFeatureRequest,
    CreatePlanRequest, CreateProductRequest, EntityStatus, Feature, FeatureListParams, Plan,
    PlanFeature, PlanListParams, Product, ProductListParams, UpdateBillingCycleRequest,
    UpdateFeatureRequest, UpdatePlanRequest, UpdateProductRequest,
};
pub use engine::customers::{
    CreateCustomerRequest, Customer, CustomerListParams, CustomerStatus, UpdateCustomerRequest,
};
pub use engine::features::resolve_feature_value;
pub use engine::subscriptions::{
    CreateSubscriptionRequest, FeatureOverride, OverrideType, Subscription,
    SubscriptionListParams, UpdateSubscriptionRequest,
};
pub use engine::transition::{
    successor_key, TransitionError, TransitionReport, TRANSITION_BATCH_LIMIT,
};
pub use engine::Engine;
pub use error::{EntityKind, Error, FieldIssue, ParseLabelError};
pub use period::{advance_period, DurationUnit};
pub use status::{derive_status, SubscriptionStatus};
pub use storage::memory::MemoryStorage;
pub use storage::postgres::PostgresStorage;
pub use storage::{
    NewBillingCycle, NewCustomer, NewFeature, NewPlan, NewProduct, NewSubscription, Storage,
    SubscriptionFilter,
};
pub use values::{FeatureValueType, MAX_KEY_LEN};
