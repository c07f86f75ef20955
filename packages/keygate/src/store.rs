//! In-memory document store.
//!
//! Holds the three collections the service persists: registered APIs, issued
//! API keys, and the call log. Every collection is a concurrent map, so the
//! store is cheap to clone and share between handlers.
//!
//! # Serialization/Deserialization
//!
//! Types in this module do not implement `Serialize` or `Deserialize`; they
//! are internal. Handlers define their own response types and convert.

use std::sync::Arc;

use color_eyre::Result;
use dashmap::{DashMap, mapref::entry::Entry};
use derive_more::Debug;
use futures::future::{self, BoxFuture, FutureExt};
use time::OffsetDateTime;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::{
    auth::UserId,
    crypto::generate_api_key,
    keys::{ApiKeyRecord, KeyStore},
};

/// An external API registered by a user.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ApiRecord {
    pub id: Uuid,
    pub owner: UserId,
    pub name: String,
    pub base_url: Url,
    pub method: http::Method,
    pub description: Option<String>,
    pub created_at: OffsetDateTime,
}

/// The fields a user supplies when registering an API.
#[derive(Clone, Debug)]
pub struct NewApi {
    pub name: String,
    pub base_url: Url,
    pub method: http::Method,
    pub description: Option<String>,
}

/// One proxied call made through the execute path.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CallLog {
    pub id: Uuid,
    pub api_id: Uuid,
    pub owner: UserId,
    pub method: http::Method,
    pub url: String,
    /// Upstream status; absent when the call never got a response.
    pub status: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub timestamp: OffsetDateTime,
}

#[derive(Clone, Default, Debug)]
#[debug(
    "Store(apis = {}, api_keys = {}, logs = {})",
    self.apis.len(),
    self.api_keys.len(),
    self.logs.len()
)]
pub struct Store {
    apis: Arc<DashMap<Uuid, ApiRecord>>,
    api_keys: Arc<DashMap<String, ApiKeyRecord>>,
    logs: Arc<DashMap<Uuid, CallLog>>,
}

impl Store {
    #[tracing::instrument(name = "Store::create_api", skip(self))]
    pub fn create_api(&self, owner: &UserId, api: NewApi) -> ApiRecord {
        let record = ApiRecord {
            id: Uuid::new_v4(),
            owner: owner.clone(),
            name: api.name,
            base_url: api.base_url,
            method: api.method,
            description: api.description,
            created_at: OffsetDateTime::now_utc(),
        };
        self.apis.insert(record.id, record.clone());
        record
    }

    /// The owner's APIs, oldest first.
    #[tracing::instrument(name = "Store::list_apis", skip(self))]
    pub fn list_apis(&self, owner: &UserId) -> Vec<ApiRecord> {
        let mut apis = self
            .apis
            .iter()
            .filter(|api| api.owner == *owner)
            .map(|api| api.value().clone())
            .collect::<Vec<_>>();
        apis.sort_by_key(|api| (api.created_at, api.id));
        apis
    }

    /// Fetch an API, but only if `owner` registered it.
    #[tracing::instrument(name = "Store::get_api", skip(self))]
    pub fn get_api(&self, owner: &UserId, id: Uuid) -> Option<ApiRecord> {
        self.apis
            .get(&id)
            .filter(|api| api.owner == *owner)
            .map(|api| api.value().clone())
    }

    /// Delete an API owned by `owner`. Returns whether anything was removed.
    #[tracing::instrument(name = "Store::delete_api", skip(self))]
    pub fn delete_api(&self, owner: &UserId, id: Uuid) -> bool {
        self.apis
            .remove_if(&id, |_, api| api.owner == *owner)
            .is_some()
    }

    /// Issue a new active key for `owner`.
    #[tracing::instrument(name = "Store::create_api_key", skip(self))]
    pub fn create_api_key(&self, owner: &UserId, name: &str) -> ApiKeyRecord {
        loop {
            match self.api_keys.entry(generate_api_key()) {
                Entry::Occupied(_) => debug!("api key collision; regenerating"),
                Entry::Vacant(entry) => {
                    let record = ApiKeyRecord {
                        key: entry.key().clone(),
                        owner: owner.clone(),
                        name: name.to_string(),
                        is_active: true,
                        created_at: OffsetDateTime::now_utc(),
                    };
                    entry.insert(record.clone());
                    return record;
                }
            }
        }
    }

    /// The owner's keys, active and inactive, oldest first.
    #[tracing::instrument(name = "Store::list_api_keys", skip(self))]
    pub fn list_api_keys(&self, owner: &UserId) -> Vec<ApiKeyRecord> {
        let mut keys = self
            .api_keys
            .iter()
            .filter(|record| record.owner == *owner)
            .map(|record| record.value().clone())
            .collect::<Vec<_>>();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        keys
    }

    /// Deactivate a key owned by `owner`.
    ///
    /// Returns `false` if the key doesn't exist or belongs to someone else.
    /// Deactivating an inactive key succeeds.
    #[tracing::instrument(name = "Store::deactivate_api_key", skip(self, key))]
    pub fn deactivate_api_key(&self, owner: &UserId, key: &str) -> bool {
        match self.api_keys.get_mut(key) {
            Some(mut record) if record.owner == *owner => {
                record.is_active = false;
                true
            }
            _ => false,
        }
    }

    #[tracing::instrument(name = "Store::record_call", skip(self))]
    pub fn record_call(&self, log: CallLog) {
        self.logs.insert(log.id, log);
    }

    /// The owner's call log, newest first, optionally limited to one API.
    #[tracing::instrument(name = "Store::list_logs", skip(self))]
    pub fn list_logs(&self, owner: &UserId, api_id: Option<Uuid>) -> Vec<CallLog> {
        let mut logs = self
            .logs
            .iter()
            .filter(|log| log.owner == *owner)
            .filter(|log| api_id.is_none_or(|id| log.api_id == id))
            .map(|log| log.value().clone())
            .collect::<Vec<_>>();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        logs
    }
}

impl KeyStore for Store {
    fn find_active_key<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<ApiKeyRecord>>> {
        let record = self.api_keys.get(key).map(|record| record.value().clone());
        future::ready(Ok(record)).boxed()
    }
}
