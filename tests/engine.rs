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

//! End-to-end engine tests.
//!
//! These drive the engine against the in-memory storage with a pinned
//! clock, so lifecycle progressions are exercised by advancing the clock
//! rather than sleeping.

use std::sync::Arc;

use futures::stream::TryStreamExt;
use test_log::test;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

use subscrio::{
    Clock, CreateBillingCycleRequest, CreateCustomerRequest, CreateFeatureRequest,
    CreatePlanRequest, CreateProductRequest, CreateSubscriptionRequest, DurationUnit, Engine,
    EntityStatus, Error, FeatureValueType, FieldUpdate, FixedClock, MemoryStorage, OverrideType,
    SubscriptionListParams, SubscriptionStatus, UpdatePlanRequest, UpdateSubscriptionRequest,
};

const T0: OffsetDateTime = datetime!(2024-06-01 00:00 UTC);

struct Harness {
    engine: Engine,
    clock: Arc<FixedClock>,
}

fn harness() -> Harness {
    let clock = Arc::new(FixedClock::new(T0));
    let engine = Engine::builder()
        .clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .build_with_storage(Arc::new(MemoryStorage::new()));
    Harness { engine, clock }
}

/// Seeds the catalog from the product team's canonical example: product
/// `projecthub` with numeric feature `max-projects` (default "3"), plan
/// `starter` assigning "5", and a monthly billing cycle.
async fn seed_projecthub(engine: &Engine) {
    engine
        .create_product(&CreateProductRequest {
            key: "projecthub",
            display_name: "ProjectHub",
            ..Default::default()
        })
        .await
        .unwrap();
    engine
        .create_feature(&CreateFeatureRequest {
            key: "max-projects",
            display_name: "Max projects",
            value_type: FeatureValueType::Numeric,
            default_value: "3",
            ..Default::default()
        })
        .await
        .unwrap();
    engine
        .add_feature_to_product("projecthub", "max-projects")
        .await
        .unwrap();
    engine
        .create_plan(&CreatePlanRequest {
            key: "starter",
            product_key: "projecthub",
            display_name: "Starter",
            ..Default::default()
        })
        .await
        .unwrap();
    engine
        .set_plan_feature_value("starter", "max-projects", "5")
        .await
        .unwrap();
    engine
        .create_billing_cycle(&CreateBillingCycleRequest {
            key: "starter-monthly",
            plan_key: "starter",
            display_name: "Starter (monthly)",
            duration_value: Some(1),
            duration_unit: DurationUnit::Months,
            ..Default::default()
        })
        .await
        .unwrap();
    engine
        .create_customer(&CreateCustomerRequest {
            key: "acme-corp",
            display_name: "Acme Corp",
            email: "billing@acme-corp.test",
            ..Default::default()
        })
        .await
        .unwrap();
}

async fn seed_trial_subscription(engine: &Engine) {
    engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "acme-sub",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            trial_end_date: Some(T0 + Duration::days(14)),
            ..Default::default()
        })
        .await
        .unwrap();
}

async fn value_of(engine: &Engine, feature: &str) -> Option<String> {
    engine
        .get_value_for_customer("acme-corp", "projecthub", feature, None)
        .await
        .unwrap()
}

#[test(tokio::test)]
async fn trial_start() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    seed_trial_subscription(&h.engine).await;

    let sub = h.engine.get_subscription("acme-sub").await.unwrap().unwrap();
    assert_eq!(sub.status(h.clock.now()), SubscriptionStatus::Trial);
    assert_eq!(sub.plan_key, "starter");
    assert_eq!(sub.product_key, "projecthub");
    // The monthly period was computed from the cycle.
    assert_eq!(sub.current_period_start, Some(T0));
    assert_eq!(sub.current_period_end, Some(datetime!(2024-07-01 00:00 UTC)));

    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("5"));
}

#[test(tokio::test)]
async fn trial_to_active_conversion() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    seed_trial_subscription(&h.engine).await;

    let sub = h
        .engine
        .update_subscription(
            "acme-sub",
            &UpdateSubscriptionRequest {
                trial_end_date: FieldUpdate::Clear,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(sub.trial_end_date, None);
    assert_eq!(sub.status(h.clock.now()), SubscriptionStatus::Active);
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("5"));
}

#[test(tokio::test)]
async fn override_precedence_and_temporary_clearance() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    seed_trial_subscription(&h.engine).await;

    h.engine
        .add_feature_override("acme-sub", "max-projects", "10", OverrideType::Temporary)
        .await
        .unwrap();
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("10"));

    let cleared = h.engine.clear_temporary_overrides("acme-sub").await.unwrap();
    assert_eq!(cleared, 1);
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("5"));

    h.engine
        .add_feature_override("acme-sub", "max-projects", "10", OverrideType::Permanent)
        .await
        .unwrap();
    let cleared = h.engine.clear_temporary_overrides("acme-sub").await.unwrap();
    assert_eq!(cleared, 0);
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("10"));
}

#[test(tokio::test)]
async fn plan_upgrade_via_billing_cycle() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    seed_trial_subscription(&h.engine).await;

    h.engine
        .create_plan(&CreatePlanRequest {
            key: "professional",
            product_key: "projecthub",
            display_name: "Professional",
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine
        .set_plan_feature_value("professional", "max-projects", "25")
        .await
        .unwrap();
    h.engine
        .create_billing_cycle(&CreateBillingCycleRequest {
            key: "professional-monthly",
            plan_key: "professional",
            display_name: "Professional (monthly)",
            duration_value: Some(1),
            duration_unit: DurationUnit::Months,
            ..Default::default()
        })
        .await
        .unwrap();

    let sub = h
        .engine
        .update_subscription(
            "acme-sub",
            &UpdateSubscriptionRequest {
                billing_cycle_key: Some("professional-monthly"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(sub.plan_key, "professional");
    assert_eq!(sub.billing_cycle_key, "professional-monthly");
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("25"));
}

#[test(tokio::test)]
async fn expire_and_transition() {
    let h = harness();
    seed_projecthub(&h.engine).await;

    // A free tier to land on when starter subscriptions expire.
    h.engine
        .create_plan(&CreatePlanRequest {
            key: "free",
            product_key: "projecthub",
            display_name: "Free",
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine
        .create_billing_cycle(&CreateBillingCycleRequest {
            key: "free-forever",
            plan_key: "free",
            display_name: "Free (forever)",
            duration_value: None,
            duration_unit: DurationUnit::Forever,
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine
        .update_plan(
            "starter",
            &UpdatePlanRequest {
                on_expire_transition_to_billing_cycle_key: FieldUpdate::Set("free-forever"),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    h.engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "s1",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            expiration_date: Some(T0 - Duration::seconds(1)),
            stripe_subscription_id: Some("sub_stripe_1"),
            ..Default::default()
        })
        .await
        .unwrap();

    let report = h.engine.run_transitions().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.transitioned, 1);
    assert_eq!(report.archived, 1);
    assert!(report.errors.is_empty());

    let old = h.engine.get_subscription("s1").await.unwrap().unwrap();
    assert!(old.is_archived);
    assert_eq!(old.transitioned_at, Some(T0));
    assert_eq!(old.status(h.clock.now()), SubscriptionStatus::Archived);
    // The external payment-processor record stays with the archived period.
    assert_eq!(old.stripe_subscription_id.as_deref(), Some("sub_stripe_1"));

    let successor = h.engine.get_subscription("s1-v1").await.unwrap().unwrap();
    assert_eq!(successor.customer_key, "acme-corp");
    assert_eq!(successor.billing_cycle_key, "free-forever");
    assert_eq!(successor.plan_key, "free");
    assert_eq!(successor.activation_date, Some(T0));
    assert_eq!(successor.current_period_start, Some(T0));
    assert_eq!(successor.current_period_end, None);
    assert_eq!(successor.trial_end_date, None);
    assert_eq!(successor.stripe_subscription_id, None);
    assert_eq!(successor.status(h.clock.now()), SubscriptionStatus::Active);

    // Running the worker again finds nothing to do.
    let report = h.engine.run_transitions().await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.transitioned, 0);
    assert_eq!(report.archived, 0);
    assert!(report.errors.is_empty());
}

#[test(tokio::test)]
async fn transition_chains_version_suffixes() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    h.engine
        .create_plan(&CreatePlanRequest {
            key: "free",
            product_key: "projecthub",
            display_name: "Free",
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine
        .create_billing_cycle(&CreateBillingCycleRequest {
            key: "free-forever",
            plan_key: "free",
            display_name: "Free (forever)",
            duration_value: None,
            duration_unit: DurationUnit::Forever,
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine
        .update_plan(
            "starter",
            &UpdatePlanRequest {
                on_expire_transition_to_billing_cycle_key: FieldUpdate::Set("free-forever"),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // A subscription that already carries a version suffix.
    h.engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "acme-sub-v3",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            expiration_date: Some(T0 - Duration::minutes(5)),
            ..Default::default()
        })
        .await
        .unwrap();

    let report = h.engine.run_transitions().await.unwrap();
    assert_eq!(report.transitioned, 1);
    assert!(h
        .engine
        .get_subscription("acme-sub-v4")
        .await
        .unwrap()
        .is_some());
}

#[test(tokio::test)]
async fn cancellation_pending_then_cancelled() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    h.engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "acme-sub",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            current_period_end: Some(T0 + Duration::days(7)),
            ..Default::default()
        })
        .await
        .unwrap();

    let sub = h
        .engine
        .update_subscription(
            "acme-sub",
            &UpdateSubscriptionRequest {
                cancellation_date: FieldUpdate::Set(T0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        sub.status(h.clock.now()),
        SubscriptionStatus::CancellationPending
    );
    // Entitlements keep resolving from the plan until the period ends.
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("5"));

    h.clock.advance(Duration::days(8));
    let sub = h.engine.get_subscription("acme-sub").await.unwrap().unwrap();
    assert_eq!(sub.status(h.clock.now()), SubscriptionStatus::Cancelled);
    // A cancelled subscription no longer grants plan values.
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("3"));
}

#[test(tokio::test)]
async fn override_precedence_across_sibling_subscriptions() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    h.engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "first",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "second",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            ..Default::default()
        })
        .await
        .unwrap();

    // Without overrides, the first subscription's resolved value wins.
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("5"));

    // An override on the later subscription beats the earlier plan value.
    h.engine
        .add_feature_override("second", "max-projects", "50", OverrideType::Permanent)
        .await
        .unwrap();
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("50"));

    // With overrides on both, the earlier subscription's override wins.
    h.engine
        .add_feature_override("first", "max-projects", "40", OverrideType::Permanent)
        .await
        .unwrap();
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("40"));

    // Clearing temporaries on one subscription leaves the rest alone.
    h.engine.clear_temporary_overrides("first").await.unwrap();
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("40"));
}

#[test(tokio::test)]
async fn checker_degrades_to_defaults() {
    let h = harness();
    seed_projecthub(&h.engine).await;

    // Unknown customer: caller default, or None without one.
    assert_eq!(
        h.engine
            .get_value_for_customer("nobody", "projecthub", "max-projects", Some("7"))
            .await
            .unwrap()
            .as_deref(),
        Some("7"),
    );
    assert_eq!(
        h.engine
            .get_value_for_customer("nobody", "projecthub", "max-projects", None)
            .await
            .unwrap(),
        None,
    );
    // Unknown product: None even with a caller default.
    assert_eq!(
        h.engine
            .get_value_for_customer("acme-corp", "no-such-product", "max-projects", Some("7"))
            .await
            .unwrap(),
        None,
    );
    // Unknown feature: caller default.
    assert_eq!(
        h.engine
            .get_value_for_customer("acme-corp", "projecthub", "no-such-feature", Some("7"))
            .await
            .unwrap()
            .as_deref(),
        Some("7"),
    );
    // Known everything, no subscriptions: the feature's own default.
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("3"));
}

#[test(tokio::test)]
async fn toggle_features_and_the_enabled_check() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    h.engine
        .create_feature(&CreateFeatureRequest {
            key: "sso",
            display_name: "Single sign-on",
            value_type: FeatureValueType::Toggle,
            default_value: "false",
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine.add_feature_to_product("projecthub", "sso").await.unwrap();
    seed_trial_subscription(&h.engine).await;

    assert!(!h
        .engine
        .is_enabled_for_customer("acme-corp", "projecthub", "sso")
        .await
        .unwrap());

    h.engine
        .add_feature_override("acme-sub", "sso", "true", OverrideType::Permanent)
        .await
        .unwrap();
    assert!(h
        .engine
        .is_enabled_for_customer("acme-corp", "projecthub", "sso")
        .await
        .unwrap());

    // Toggle values are validated strictly.
    let err = h
        .engine
        .add_feature_override("acme-sub", "sso", "yes", OverrideType::Permanent)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test(tokio::test)]
async fn all_features_for_customer() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    h.engine
        .create_feature(&CreateFeatureRequest {
            key: "sso",
            display_name: "Single sign-on",
            value_type: FeatureValueType::Toggle,
            default_value: "false",
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine.add_feature_to_product("projecthub", "sso").await.unwrap();
    seed_trial_subscription(&h.engine).await;
    h.engine
        .add_feature_override("acme-sub", "sso", "true", OverrideType::Temporary)
        .await
        .unwrap();

    let all = h
        .engine
        .get_all_features_for_customer("acme-corp", "projecthub")
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all.get("max-projects").map(String::as_str), Some("5"));
    assert_eq!(all.get("sso").map(String::as_str), Some("true"));

    // Unknown customer yields an empty map, not an error.
    let none = h
        .engine
        .get_all_features_for_customer("nobody", "projecthub")
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[test(tokio::test)]
async fn create_subscription_period_arithmetic() {
    let h = harness();
    seed_projecthub(&h.engine).await;

    // A period opened on Jan 31 clamps to the end of February.
    let sub = h
        .engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "clamped",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            current_period_start: Some(datetime!(2024-01-31 00:00 UTC)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        sub.current_period_end,
        Some(datetime!(2024-02-29 00:00 UTC)),
    );
}

#[test(tokio::test)]
async fn conflicts_and_validation() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    seed_trial_subscription(&h.engine).await;

    // Duplicate subscription key.
    let err = h
        .engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "acme-sub",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // Duplicate stripe subscription id.
    h.engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "with-stripe",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            stripe_subscription_id: Some("sub_dup"),
            ..Default::default()
        })
        .await
        .unwrap();
    let err = h
        .engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "with-stripe-2",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            stripe_subscription_id: Some("sub_dup"),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // Unknown billing cycle.
    let err = h
        .engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "dangling",
            customer_key: "acme-corp",
            billing_cycle_key: "no-such-cycle",
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    // Malformed keys are rejected before any store write.
    let err = h
        .engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "has spaces",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // A feature default that does not parse under its value type.
    let err = h
        .engine
        .create_feature(&CreateFeatureRequest {
            key: "broken",
            display_name: "Broken",
            value_type: FeatureValueType::Numeric,
            default_value: "many",
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // A bounded cycle without a duration value.
    let err = h
        .engine
        .create_billing_cycle(&CreateBillingCycleRequest {
            key: "broken-cycle",
            plan_key: "starter",
            display_name: "Broken",
            duration_value: None,
            duration_unit: DurationUnit::Months,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test(tokio::test)]
async fn archived_subscriptions_reject_writes() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    seed_trial_subscription(&h.engine).await;
    h.engine
        .add_feature_override("acme-sub", "max-projects", "10", OverrideType::Permanent)
        .await
        .unwrap();

    let sub = h.engine.archive_subscription("acme-sub").await.unwrap();
    assert!(sub.is_archived);
    assert_eq!(sub.status(h.clock.now()), SubscriptionStatus::Archived);
    // Archival clears the override set.
    assert!(h
        .engine
        .list_feature_overrides("acme-sub")
        .await
        .unwrap()
        .is_empty());

    let err = h
        .engine
        .update_subscription(
            "acme-sub",
            &UpdateSubscriptionRequest {
                trial_end_date: FieldUpdate::Clear,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Domain(_)));
    let err = h
        .engine
        .add_feature_override("acme-sub", "max-projects", "10", OverrideType::Permanent)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Domain(_)));
    let err = h.engine.clear_temporary_overrides("acme-sub").await.unwrap_err();
    assert!(matches!(err, Error::Domain(_)));

    // An archived subscription grants nothing.
    assert_eq!(value_of(&h.engine, "max-projects").await.as_deref(), Some("3"));

    // Unarchiving restores date-derived status and writability.
    let sub = h.engine.unarchive_subscription("acme-sub").await.unwrap();
    assert_eq!(sub.status(h.clock.now()), SubscriptionStatus::Trial);
    h.engine
        .update_subscription(
            "acme-sub",
            &UpdateSubscriptionRequest {
                trial_end_date: FieldUpdate::Clear,
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[test(tokio::test)]
async fn list_filters_resolve_keys() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    seed_trial_subscription(&h.engine).await;

    let by_customer: Vec<_> = h
        .engine
        .list_subscriptions(&SubscriptionListParams::DEFAULT.customer_key("acme-corp"))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(by_customer.len(), 1);
    assert_eq!(by_customer[0].key, "acme-sub");

    let by_status: Vec<_> = h
        .engine
        .list_subscriptions(
            &SubscriptionListParams::DEFAULT
                .customer_key("acme-corp")
                .status(SubscriptionStatus::Trial),
        )
        .try_collect()
        .await
        .unwrap();
    assert_eq!(by_status.len(), 1);

    let none: Vec<_> = h
        .engine
        .list_subscriptions(
            &SubscriptionListParams::DEFAULT
                .customer_key("acme-corp")
                .status(SubscriptionStatus::Cancelled),
        )
        .try_collect()
        .await
        .unwrap();
    assert!(none.is_empty());

    // Unknown filter keys yield an empty listing, never an error.
    let unknown: Vec<_> = h
        .engine
        .list_subscriptions(&SubscriptionListParams::DEFAULT.customer_key("no-such-customer"))
        .try_collect()
        .await
        .unwrap();
    assert!(unknown.is_empty());
}

#[test(tokio::test)]
async fn customer_lifecycle_rules() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    seed_trial_subscription(&h.engine).await;

    // Active customers cannot be deleted.
    let err = h.engine.delete_customer("acme-corp").await.unwrap_err();
    assert!(matches!(err, Error::Domain(_)));

    h.engine.archive_customer("acme-corp").await.unwrap();
    h.engine.delete_customer("acme-corp").await.unwrap();

    // The dependent subscription went with the customer.
    assert!(h.engine.get_subscription("acme-sub").await.unwrap().is_none());
}

#[test(tokio::test)]
async fn product_deletion_cascades() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    seed_trial_subscription(&h.engine).await;

    h.engine.delete_product("projecthub").await.unwrap();
    assert!(h.engine.get_plan("starter").await.unwrap().is_none());
    assert!(h
        .engine
        .get_billing_cycle("starter-monthly")
        .await
        .unwrap()
        .is_none());
    assert!(h.engine.get_subscription("acme-sub").await.unwrap().is_none());
    // Features are global and survive their products.
    assert!(h.engine.get_feature("max-projects").await.unwrap().is_some());
}

#[test(tokio::test)]
async fn feature_deletion_respects_live_overrides() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    seed_trial_subscription(&h.engine).await;
    h.engine
        .add_feature_override("acme-sub", "max-projects", "10", OverrideType::Permanent)
        .await
        .unwrap();

    let err = h.engine.delete_feature("max-projects").await.unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));

    h.engine.archive_subscription("acme-sub").await.unwrap();
    h.engine.delete_feature("max-projects").await.unwrap();
    assert!(h.engine.get_feature("max-projects").await.unwrap().is_none());
}

#[test(tokio::test)]
async fn status_progression_is_monotonic_end_to_end() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    h.engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "acme-sub",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            trial_end_date: Some(T0 + Duration::days(14)),
            current_period_end: Some(T0 + Duration::days(30)),
            ..Default::default()
        })
        .await
        .unwrap();

    let status = |h: &Harness, sub: &subscrio::Subscription| sub.status(h.clock.now());

    let sub = h.engine.get_subscription("acme-sub").await.unwrap().unwrap();
    assert_eq!(status(&h, &sub), SubscriptionStatus::Trial);

    h.clock.advance(Duration::days(14));
    assert_eq!(status(&h, &sub), SubscriptionStatus::Active);

    h.engine
        .update_subscription(
            "acme-sub",
            &UpdateSubscriptionRequest {
                cancellation_date: FieldUpdate::Set(T0 + Duration::days(20)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.clock.advance(Duration::days(6));
    let sub = h.engine.get_subscription("acme-sub").await.unwrap().unwrap();
    assert_eq!(status(&h, &sub), SubscriptionStatus::CancellationPending);

    h.clock.advance(Duration::days(30));
    assert_eq!(status(&h, &sub), SubscriptionStatus::Cancelled);
}

#[test(tokio::test)]
async fn update_preserves_unrelated_fields() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    seed_trial_subscription(&h.engine).await;

    let before = h.engine.get_subscription("acme-sub").await.unwrap().unwrap();
    let after = h
        .engine
        .update_subscription(
            "acme-sub",
            &UpdateSubscriptionRequest {
                expiration_date: FieldUpdate::Set(T0 + Duration::days(90)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(after.trial_end_date, before.trial_end_date);
    assert_eq!(after.current_period_start, before.current_period_start);
    assert_eq!(after.current_period_end, before.current_period_end);
    assert_eq!(after.activation_date, before.activation_date);
    assert_eq!(after.expiration_date, Some(T0 + Duration::days(90)));
}

#[test(tokio::test)]
async fn catalog_listings_paginate() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    for i in 0..7 {
        h.engine
            .create_plan(&CreatePlanRequest {
                key: &format!("tier-{i}"),
                product_key: "projecthub",
                display_name: "Tier",
                ..Default::default()
            })
            .await
            .unwrap();
    }

    // A page size smaller than the result set still yields every row.
    let plans: Vec<_> = h
        .engine
        .list_plans(
            &subscrio::PlanListParams::DEFAULT
                .product_key("projecthub")
                .page_size(3),
        )
        .try_collect()
        .await
        .unwrap();
    assert_eq!(plans.len(), 8); // starter + tier-0..=6
    // Ascending id order.
    assert!(plans.windows(2).all(|w| w[0].id < w[1].id));

    let archived: Vec<_> = h
        .engine
        .list_plans(
            &subscrio::PlanListParams::DEFAULT
                .product_key("projecthub")
                .status(EntityStatus::Archived),
        )
        .try_collect()
        .await
        .unwrap();
    assert!(archived.is_empty());
}

#[test(tokio::test)]
async fn archived_subscription_is_not_a_transition_candidate() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    h.engine
        .create_plan(&CreatePlanRequest {
            key: "free",
            product_key: "projecthub",
            display_name: "Free",
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine
        .create_billing_cycle(&CreateBillingCycleRequest {
            key: "free-forever",
            plan_key: "free",
            display_name: "Free (forever)",
            duration_value: None,
            duration_unit: DurationUnit::Forever,
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine
        .update_plan(
            "starter",
            &UpdatePlanRequest {
                on_expire_transition_to_billing_cycle_key: FieldUpdate::Set("free-forever"),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Cancelled subscriptions do not transition even when expired.
    h.engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "cancelled-and-expired",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            expiration_date: Some(T0 - Duration::days(1)),
            cancellation_date: Some(T0 - Duration::days(2)),
            ..Default::default()
        })
        .await
        .unwrap();
    // Neither do manually archived ones.
    h.engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "archived-and-expired",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            expiration_date: Some(T0 - Duration::days(1)),
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine
        .archive_subscription("archived-and-expired")
        .await
        .unwrap();

    let report = h.engine.run_transitions().await.unwrap();
    assert_eq!(report.processed, 0);
}

#[test(tokio::test)]
async fn transition_key_collision_reports_an_error() {
    let h = harness();
    seed_projecthub(&h.engine).await;
    h.engine
        .create_plan(&CreatePlanRequest {
            key: "free",
            product_key: "projecthub",
            display_name: "Free",
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine
        .create_billing_cycle(&CreateBillingCycleRequest {
            key: "free-forever",
            plan_key: "free",
            display_name: "Free (forever)",
            duration_value: None,
            duration_unit: DurationUnit::Forever,
            ..Default::default()
        })
        .await
        .unwrap();
    h.engine
        .update_plan(
            "starter",
            &UpdatePlanRequest {
                on_expire_transition_to_billing_cycle_key: FieldUpdate::Set("free-forever"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "s1",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            expiration_date: Some(T0 - Duration::seconds(1)),
            ..Default::default()
        })
        .await
        .unwrap();
    // A successor key squatter forces the per-subscription error path.
    h.engine
        .create_subscription(&CreateSubscriptionRequest {
            key: "s1-v1",
            customer_key: "acme-corp",
            billing_cycle_key: "starter-monthly",
            ..Default::default()
        })
        .await
        .unwrap();

    let report = h.engine.run_transitions().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.archived, 1);
    assert_eq!(report.transitioned, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].subscription_key, "s1");

    // The failed subscription is archived and out of the candidate set;
    // the next pass is clean.
    let report = h.engine.run_transitions().await.unwrap();
    assert_eq!(report.processed, 0);
    assert!(report.errors.is_empty());
}
