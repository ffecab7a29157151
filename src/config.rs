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

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

use crate::clock::{Clock, SystemClock};
use crate::engine::Engine;
use crate::error::Error;
use crate::storage::postgres::PostgresStorage;
use crate::storage::Storage;

/// The default maximum number of concurrent store connections.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Configures the required parameters of an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The connection string for the relational store. Opaque to the engine;
    /// consumed by the storage driver.
    pub connection_string: String,
    /// The maximum number of concurrent store connections.
    ///
    /// If `None`, defaults to [`DEFAULT_POOL_SIZE`].
    pub pool_size: Option<u32>,
    /// Whether to require transport encryption to the store.
    pub tls: bool,
}

/// A builder for an [`Engine`] that allows for customization of optional
/// parameters.
#[derive(Debug)]
pub struct EngineBuilder {
    clock: Arc<dyn Clock>,
    operation_timeout: Option<Duration>,
}

impl Default for EngineBuilder {
    fn default() -> EngineBuilder {
        EngineBuilder {
            clock: Arc::new(SystemClock),
            operation_timeout: None,
        }
    }
}

impl EngineBuilder {
    /// Sets the clock the engine derives "now" from.
    ///
    /// Defaults to [`SystemClock`]. Tests inject a
    /// [`FixedClock`](crate::FixedClock) to make status derivation
    /// deterministic.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets a deadline applied to every engine operation.
    ///
    /// An operation that exceeds the deadline aborts its current store call
    /// and returns [`Error::Cancelled`]. Paginated list streams are not
    /// deadline-wrapped; each page fetch is a separate store call.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Creates an [`Engine`] backed by a PostgreSQL store configured by
    /// `config`.
    pub async fn connect(self, config: EngineConfig) -> Result<Engine, Error> {
        let mut options = PgConnectOptions::from_str(&config.connection_string)?;
        if config.tls {
            options = options.ssl_mode(PgSslMode::Require);
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size.unwrap_or(DEFAULT_POOL_SIZE))
            .connect_with(options)
            .await?;
        Ok(self.build_with_storage(Arc::new(PostgresStorage::new(pool))))
    }

    /// Creates an [`Engine`] on top of an existing storage implementation.
    ///
    /// This is how tests and embedders wire in
    /// [`MemoryStorage`](crate::MemoryStorage).
    pub fn build_with_storage(self, storage: Arc<dyn Storage>) -> Engine {
        Engine {
            storage,
            clock: self.clock,
            operation_timeout: self.operation_timeout,
        }
    }
}

/// Parameters for a list operation.
#[derive(Debug, Clone)]
pub struct ListParams {
    pub(crate) page_size: u64,
}

impl Default for ListParams {
    fn default() -> ListParams {
        ListParams::DEFAULT
    }
}

impl ListParams {
    /// The default list parameters.
    ///
    /// Exposed as a constant for use in constant evaluation contexts.
    pub const DEFAULT: ListParams = ListParams { page_size: 50 };

    /// Sets the page size for the list operation.
    ///
    /// The page size only affects how many rows are fetched from the store
    /// per round trip. It does not change the observable output of the
    /// returned stream.
    ///
    /// The default page size is 50. The maximum page size is 500.
    pub const fn page_size(mut self, page_size: u64) -> Self {
        self.page_size = if page_size > 500 { 500 } else { page_size };
        self
    }
}

/// A three-state patch for a nullable field in an update request.
///
/// Update DTOs distinguish "leave the field alone" from "clear it" from
/// "set it": clearing a subscription's trial end date, for example, is a
/// meaningful update that represents trial conversion.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FieldUpdate<T> {
    /// Keep the current value.
    #[default]
    Keep,
    /// Clear the value.
    Clear,
    /// Replace the value.
    Set(T),
}

impl<T> FieldUpdate<T> {
    /// Applies the patch to the current value.
    pub fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            FieldUpdate::Keep => current,
            FieldUpdate::Clear => None,
            FieldUpdate::Set(value) => Some(value),
        }
    }

    /// Whether this patch leaves the field alone.
    pub fn is_keep(&self) -> bool {
        matches!(self, FieldUpdate::Keep)
    }

    /// The set value, if any.
    pub fn set_value(&self) -> Option<&T> {
        match self {
            FieldUpdate::Set(value) => Some(value),
            _ => None,
        }
    }
}

impl<'a> FieldUpdate<&'a str> {
    /// Converts a borrowed string patch into an owned one.
    pub(crate) fn map_owned(self) -> FieldUpdate<String> {
        match self {
            FieldUpdate::Keep => FieldUpdate::Keep,
            FieldUpdate::Clear => FieldUpdate::Clear,
            FieldUpdate::Set(value) => FieldUpdate::Set(value.to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_update_applies() {
        assert_eq!(FieldUpdate::Keep.apply(Some(1)), Some(1));
        assert_eq!(FieldUpdate::<i32>::Clear.apply(Some(1)), None);
        assert_eq!(FieldUpdate::Set(2).apply(Some(1)), Some(2));
        assert_eq!(FieldUpdate::Set(2).apply(None), Some(2));
    }

    #[test]
    fn page_size_is_capped() {
        assert_eq!(ListParams::DEFAULT.page_size(1000).page_size, 500);
        assert_eq!(ListParams::DEFAULT.page_size(10).page_size, 10);
    }
}
