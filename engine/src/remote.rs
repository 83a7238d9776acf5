//! Interfaces to the remote content service and the canonical item list.
//!
//! The engine does not ship a transport. Applications implement these traits
//! over whatever API they use; timeouts belong to the implementation.

use crate::{ContentHash, ContentItem, ItemPatch, RemoteError};
use async_trait::async_trait;

/// The remote authoritative content service.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Fetch the current server version of an item.
    async fn fetch_item(&self, id: &str) -> Result<ContentItem, RemoteError>;

    /// Create an item. The returned item is the server's version; it may
    /// carry a different id than the one submitted.
    async fn create_item(&self, item: &ContentItem) -> Result<ContentItem, RemoteError>;

    /// Update an item.
    ///
    /// `base_hash` is the fingerprint of the version the client edited. When
    /// the server's current version no longer matches it, the implementation
    /// must fail with [`RemoteError::Conflict`].
    async fn update_item(
        &self,
        id: &str,
        patch: &ItemPatch,
        base_hash: Option<&ContentHash>,
    ) -> Result<ContentItem, RemoteError>;

    /// Delete an item.
    async fn delete_item(&self, id: &str) -> Result<(), RemoteError>;
}

/// The application's canonical item list, refreshed after every sync cycle
/// so the UI reflects server-confirmed truth.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Reload every item from the server and return the new list.
    async fn refresh_all(&self) -> Result<Vec<ContentItem>, RemoteError>;
}
