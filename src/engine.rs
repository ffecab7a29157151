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

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::clock::Clock;
use crate::config::{EngineBuilder, EngineConfig};
use crate::error::Error;
use crate::storage::Storage;

pub mod catalog;
pub mod customers;
pub mod features;
pub mod subscriptions;
pub mod transition;

/// The subscription and feature-entitlement engine.
///
/// The engine is designed to be wrapped in an [`Arc`] and used from multiple
/// tasks simultaneously. It is logically single-threaded per operation; all
/// shared state lives in the backing store, and unique-key constraints make
/// double-create races surface as [`Error::Conflict`].
///
/// [`Arc`]: std::sync::Arc
#[derive(Debug)]
pub struct Engine {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) operation_timeout: Option<Duration>,
}

impl Engine {
    /// Creates a new `Engine` from its required configuration parameters,
    /// connecting to the PostgreSQL store it describes.
    pub async fn connect(config: EngineConfig) -> Result<Engine, Error> {
        EngineBuilder::default().connect(config).await
    }

    /// Creates a builder for an `Engine` that allows for customization of
    /// optional parameters.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// The storage implementation backing this engine.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub(crate) fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Runs `op` under the configured operation deadline, if any.
    pub(crate) async fn guarded<T, F>(&self, op: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        match self.operation_timeout {
            None => op.await,
            Some(limit) => match tokio::time::timeout(limit, op).await {
                Ok(result) => result,
                Err(_) => Err(Error::Cancelled),
            },
        }
    }
}
