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

use std::fmt;

use serde::{Deserialize, Serialize};

/// An error returned by an [`Engine`] operation.
///
/// The engine performs no automatic retries; every error is surfaced to the
/// caller. Read paths that tolerate missing references degrade to defaults
/// instead of returning [`Error::NotFound`].
///
/// [`Engine`]: crate::Engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input failed shape or value-type validation.
    ///
    /// Not retryable. Carries one issue per offending field.
    #[error("validation failed: {}", format_issues(.0))]
    Validation(Vec<FieldIssue>),
    /// A referenced key does not exist.
    #[error("{kind} not found: {key}")]
    NotFound {
        /// The kind of entity that was looked up.
        kind: EntityKind,
        /// The key (or id) that failed to resolve.
        key: String,
    },
    /// A unique-key collision on create, or a duplicate external id.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The operation is forbidden by a domain invariant, such as writing to
    /// an archived subscription or deleting an active customer.
    #[error("{0}")]
    Domain(String),
    /// A referenced foreign entity is in a state that forbids the operation.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// The caller-supplied deadline tripped before the operation completed.
    ///
    /// Partial state already written is not rolled back except as provided
    /// by the enclosing store transaction.
    #[error("operation cancelled")]
    Cancelled,
    /// An unexpected store or driver failure. Retryable at the caller's
    /// discretion.
    #[error("storage failure: {0}")]
    Internal(#[source] sqlx::Error),
}

impl Error {
    pub(crate) fn not_found(kind: EntityKind, key: impl Into<String>) -> Error {
        Error::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Error {
        Error::Conflict(message.into())
    }

    pub(crate) fn domain(message: impl Into<String>) -> Error {
        Error::Domain(message.into())
    }

    pub(crate) fn validation(issues: Vec<FieldIssue>) -> Error {
        Error::Validation(issues)
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Error {
        // Postgres reports unique violations under SQLSTATE 23505; those are
        // Conflict per the taxonomy, everything else is an internal store
        // failure.
        if let sqlx::Error::Database(db) = &e {
            if db.code().as_deref() == Some("23505") {
                return Error::Conflict(db.message().to_owned());
            }
        }
        Error::Internal(e)
    }
}

/// A single field-level validation issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    /// The field the issue applies to.
    pub field: String,
    /// A human-readable description of the issue.
    pub message: String,
}

impl FieldIssue {
    pub(crate) fn new(field: impl Into<String>, message: impl Into<String>) -> FieldIssue {
        FieldIssue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The kinds of entities that can appear in an [`Error::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A product.
    Product,
    /// A feature.
    Feature,
    /// A plan.
    Plan,
    /// A billing cycle.
    BillingCycle,
    /// A customer.
    Customer,
    /// A subscription.
    Subscription,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Product => "product",
            EntityKind::Feature => "feature",
            EntityKind::Plan => "plan",
            EntityKind::BillingCycle => "billing cycle",
            EntityKind::Customer => "customer",
            EntityKind::Subscription => "subscription",
        })
    }
}

/// An error returned when a persisted enum label cannot be parsed back into
/// its domain type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized {what} label: {label:?}")]
pub struct ParseLabelError {
    /// The domain type the label was parsed for.
    pub what: &'static str,
    /// The offending label.
    pub label: String,
}

impl ParseLabelError {
    pub(crate) fn new(what: &'static str, label: impl Into<String>) -> ParseLabelError {
        ParseLabelError {
            what,
            label: label.into(),
        }
    }
}
