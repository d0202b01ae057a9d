//! Collaborator traits for talking to a record store.
//!
//! - [`RecordStore`]: executes queries one page at a time
//! - [`MetadataDescriber`]: lists the queryable fields of an object type
//!
//! Planning, backup and reconciliation depend only on these contracts. A store
//! instance is bound to one organization; callers hold one for the source and
//! one for the target.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

use super::record::Record;

/// One page of query results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPage {
    /// Records on this page.
    pub records: Vec<Record>,
    /// Total matching records reported by the store.
    pub total_size: u64,
    /// Continuation cursor, `None` when this is the last page.
    pub next_cursor: Option<String>,
}

/// Execute queries against one organization.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch a page: the first page when `cursor` is `None`, otherwise the
    /// page the cursor points at.
    async fn query_page(&self, query: &str, cursor: Option<&str>) -> Result<QueryPage>;

    /// Organization alias used in logs.
    fn store_name(&self) -> &str;

    /// Fetch every page of a query.
    async fn query_all(&self, query: &str) -> Result<Vec<Record>> {
        let mut page = self.query_page(query, None).await?;
        let mut records = std::mem::take(&mut page.records);
        let mut pages = 1;
        while let Some(cursor) = page.next_cursor.take() {
            page = self.query_page(query, Some(&cursor)).await?;
            records.append(&mut page.records);
            pages += 1;
        }
        debug!(
            "{}: fetched {} records in {} page(s)",
            self.store_name(),
            records.len(),
            pages
        );
        Ok(records)
    }

    /// Count matching records without paging through them.
    async fn count(&self, query: &str) -> Result<u64> {
        let page = self.query_page(query, None).await?;
        Ok(page.total_size)
    }
}

/// Describe object metadata.
#[async_trait]
pub trait MetadataDescriber: Send + Sync {
    /// Every queryable field name of `object_type`.
    async fn describe_fields(&self, object_type: &str) -> Result<Vec<String>>;
}
