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

//! Customer identities and external-billing aliases.

use std::fmt;
use std::str::FromStr;

use async_stream::try_stream;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::{FieldUpdate, ListParams};
use crate::engine::Engine;
use crate::error::{EntityKind, Error, ParseLabelError};
use crate::storage::NewCustomer;
use crate::values;

/// The administrative status of a customer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerStatus {
    /// The customer is live.
    #[default]
    Active,
    /// The customer is archived. Deletion is only permitted from this
    /// state.
    Archived,
}

impl CustomerStatus {
    /// The persisted label for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomerStatus::Active => "active",
            CustomerStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for CustomerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CustomerStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<CustomerStatus, ParseLabelError> {
        match s {
            "active" => Ok(CustomerStatus::Active),
            "archived" => Ok(CustomerStatus::Archived),
            other => Err(ParseLabelError::new("customer status", other)),
        }
    }
}

/// A customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    /// The storage-assigned unique identifier for the customer.
    pub id: i64,
    /// The user-supplied key for the customer, unique among customers and
    /// immutable after creation.
    pub key: String,
    /// A human-readable name for the customer.
    pub display_name: String,
    /// A contact email for the customer.
    pub email: String,
    /// The customer's identifier in an external billing system, such as
    /// Stripe. Unique when present.
    pub external_billing_id: Option<String>,
    /// The administrative status of the customer.
    pub status: CustomerStatus,
    /// Caller-defined metadata. Always a JSON object.
    pub metadata: serde_json::Value,
    /// The time at which the customer was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// The time at which the customer was last updated.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The subset of [`Customer`] used in create requests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CreateCustomerRequest<'a> {
    /// The key for the new customer.
    pub key: &'a str,
    /// A human-readable name for the customer.
    pub display_name: &'a str,
    /// A contact email for the customer.
    pub email: &'a str,
    /// The customer's identifier in an external billing system. Unique when
    /// present.
    pub external_billing_id: Option<&'a str>,
    /// Caller-defined metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// The subset of [`Customer`] used in update requests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateCustomerRequest<'a> {
    /// A new display name.
    pub display_name: Option<&'a str>,
    /// A new contact email.
    pub email: Option<&'a str>,
    /// A patch for the external billing identifier.
    pub external_billing_id: FieldUpdate<&'a str>,
    /// Replacement metadata. Must be a JSON object.
    pub metadata: Option<&'a serde_json::Value>,
}

/// Parameters for a customer list operation.
#[derive(Debug, Clone)]
pub struct CustomerListParams {
    inner: ListParams,
    status: Option<CustomerStatus>,
}

impl Default for CustomerListParams {
    fn default() -> CustomerListParams {
        CustomerListParams::DEFAULT
    }
}

impl CustomerListParams {
    /// The default customer list parameters.
    pub const DEFAULT: CustomerListParams = CustomerListParams {
        inner: ListParams::DEFAULT,
        status: None,
    };

    /// Sets the page size for the list operation.
    pub const fn page_size(mut self, page_size: u64) -> Self {
        self.inner = self.inner.page_size(page_size);
        self
    }

    /// Filters the listing to the specified status.
    pub const fn status(mut self, status: CustomerStatus) -> Self {
        self.status = Some(status);
        self
    }
}

impl Engine {
    /// Creates a new customer.
    pub async fn create_customer(
        &self,
        customer: &CreateCustomerRequest<'_>,
    ) -> Result<Customer, Error> {
        self.guarded(async {
            let mut issues = Vec::new();
            values::check_key("key", customer.key, &mut issues);
            values::check_email("email", customer.email, &mut issues);
            if let Some(metadata) = customer.metadata {
                values::check_metadata("metadata", metadata, &mut issues);
            }
            if !issues.is_empty() {
                return Err(Error::validation(issues));
            }
            if self.storage.customer_by_key(customer.key).await?.is_some() {
                return Err(Error::conflict(format!(
                    "customer key already exists: {}",
                    customer.key
                )));
            }
            if let Some(external_id) = customer.external_billing_id {
                if self
                    .storage
                    .customer_by_external_billing_id(external_id)
                    .await?
                    .is_some()
                {
                    return Err(Error::conflict(format!(
                        "external billing id already in use: {external_id}"
                    )));
                }
            }
            let now = self.now();
            self.storage
                .insert_customer(NewCustomer {
                    key: customer.key.to_owned(),
                    display_name: customer.display_name.to_owned(),
                    email: customer.email.to_owned(),
                    external_billing_id: customer.external_billing_id.map(str::to_owned),
                    status: CustomerStatus::Active,
                    metadata: customer
                        .metadata
                        .cloned()
                        .unwrap_or_else(values::empty_metadata),
                    created_at: now,
                })
                .await
        })
        .await
    }

    /// Gets a customer by key.
    pub async fn get_customer(&self, key: &str) -> Result<Option<Customer>, Error> {
        self.guarded(self.storage.customer_by_key(key)).await
    }

    /// Gets a customer by external billing identifier.
    pub async fn get_customer_by_external_billing_id(
        &self,
        external_billing_id: &str,
    ) -> Result<Option<Customer>, Error> {
        self.guarded(self.storage.customer_by_external_billing_id(external_billing_id))
            .await
    }

    /// Updates a customer.
    pub async fn update_customer(
        &self,
        key: &str,
        update: &UpdateCustomerRequest<'_>,
    ) -> Result<Customer, Error> {
        self.guarded(async {
            let mut customer = self
                .storage
                .customer_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Customer, key))?;
            let mut issues = Vec::new();
            if let Some(email) = update.email {
                values::check_email("email", email, &mut issues);
            }
            if let Some(metadata) = update.metadata {
                values::check_metadata("metadata", metadata, &mut issues);
            }
            if !issues.is_empty() {
                return Err(Error::validation(issues));
            }
            if let FieldUpdate::Set(external_id) = update.external_billing_id {
                match self.storage.customer_by_external_billing_id(external_id).await? {
                    Some(existing) if existing.id != customer.id => {
                        return Err(Error::conflict(format!(
                            "external billing id already in use: {external_id}"
                        )));
                    }
                    _ => {}
                }
            }
            if let Some(display_name) = update.display_name {
                customer.display_name = display_name.to_owned();
            }
            if let Some(email) = update.email {
                customer.email = email.to_owned();
            }
            customer.external_billing_id = update
                .external_billing_id
                .map_owned()
                .apply(customer.external_billing_id.take());
            if let Some(metadata) = update.metadata {
                customer.metadata = metadata.clone();
            }
            customer.updated_at = self.now();
            self.storage.update_customer(&customer).await?;
            Ok(customer)
        })
        .await
    }

    /// Archives a customer.
    pub async fn archive_customer(&self, key: &str) -> Result<Customer, Error> {
        self.set_customer_status(key, CustomerStatus::Archived).await
    }

    /// Returns an archived customer to the active status.
    pub async fn unarchive_customer(&self, key: &str) -> Result<Customer, Error> {
        self.set_customer_status(key, CustomerStatus::Active).await
    }

    async fn set_customer_status(
        &self,
        key: &str,
        status: CustomerStatus,
    ) -> Result<Customer, Error> {
        self.guarded(async {
            let mut customer = self
                .storage
                .customer_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Customer, key))?;
            customer.status = status;
            customer.updated_at = self.now();
            self.storage.update_customer(&customer).await?;
            Ok(customer)
        })
        .await
    }

    /// Deletes a customer, removing the subscriptions that depend on it.
    ///
    /// Only archived customers may be deleted.
    pub async fn delete_customer(&self, key: &str) -> Result<(), Error> {
        self.guarded(async {
            let customer = self
                .storage
                .customer_by_key(key)
                .await?
                .ok_or_else(|| Error::not_found(EntityKind::Customer, key))?;
            if customer.status != CustomerStatus::Archived {
                return Err(Error::domain(format!(
                    "customer {key} must be archived before deletion"
                )));
            }
            self.storage.delete_customer(customer.id).await
        })
        .await
    }

    /// Lists customers as configured by `params`.
    ///
    /// The underlying store reads are paginated. The returned stream will
    /// fetch additional pages as it is consumed.
    pub fn list_customers(
        &self,
        params: &CustomerListParams,
    ) -> impl Stream<Item = Result<Customer, Error>> + '_ {
        let page_size = params.inner.page_size;
        let status = params.status;
        try_stream! {
            let mut offset = 0u64;
            loop {
                let page = self.storage.list_customers(status, page_size, offset).await?;
                let fetched = page.len() as u64;
                for customer in page {
                    yield customer;
                }
                if fetched < page_size {
                    break;
                }
                offset += fetched;
            }
        }
    }
}
