//! API key records and the lookup the gate performs on them.

use color_eyre::Result;
use futures::future::BoxFuture;
use time::OffsetDateTime;

use crate::auth::UserId;

/// Header carrying the API key on the execute path.
pub const API_KEY_HEADER: &str = "x-api-key";

/// An issued API key.
///
/// A key string identifies at most one owner. Keys are never deleted, only
/// deactivated, so a deactivated key can't be reissued to someone else.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ApiKeyRecord {
    pub key: String,
    pub owner: UserId,
    pub name: String,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

/// Point lookups of API keys by key string.
pub trait KeyStore: Send + Sync + 'static {
    /// Find the record for `key`, active or not.
    ///
    /// The caller decides what an inactive record means; the gate treats it
    /// the same as a missing one.
    fn find_active_key<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<ApiKeyRecord>>>;
}
