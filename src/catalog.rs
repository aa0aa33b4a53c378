//! # Catalog seam.
//!
//! The manager periodically advertises itself to a catalog service and asks
//! it which factories are feeding the pool. Both directions go through
//! [`CatalogClient`] so the discovery mechanism stays outside the crate.

use async_trait::async_trait;
use serde_json::Value;

use crate::factory::FactoryUpdate;

/// Talks to one or more catalog servers.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Sends a manager description. Returning `false` means the record was
    /// rejected for size; the manager retries once with a lean record.
    async fn send_update(&self, record: &Value) -> bool;

    /// Queries the catalog for the named factories.
    async fn fetch_factories(&self, names: &[String]) -> Vec<FactoryUpdate>;
}
