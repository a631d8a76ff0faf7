use crate::core::types::CatalogCard;
use anyhow::Result;
use async_trait::async_trait;

/// External card-catalog lookup. One call, bounded page size; pagination is
/// the implementation's concern.
#[async_trait]
pub trait CatalogClient: Send + Sync + 'static {
    async fn search_by_name(&self, name: &str) -> Result<Vec<CatalogCard>>;
}
