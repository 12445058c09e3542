//! Small-to-big expansion.
//!
//! Chunks are matched at fine granularity but handed downstream with the
//! larger parent window recorded for them at ingestion time. Ranking is not
//! touched: each result keeps its score and tier. Results without a parent,
//! or whose parent lookup fails, keep their own text.

use std::sync::Arc;

use futures::future::join_all;

use crate::models::{RetrievalResult, TenantId};
use crate::store::ChunkStore;

pub struct SmallToBigExpander {
    store: Arc<dyn ChunkStore>,
}

/// Counts reported by [`SmallToBigExpander::expand`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpansionReport {
    pub expanded: usize,
    pub failed: usize,
}

impl SmallToBigExpander {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self { store }
    }

    /// Attach parent windows to `results` in place. Lookups run concurrently.
    pub async fn expand(&self, tenant: &TenantId, results: &mut [RetrievalResult]) -> ExpansionReport {
        let lookups = results.iter().map(|r| {
            let store = self.store.clone();
            let has_parent = r.parent.is_some();
            let chunk_id = r.chunk_id.clone();
            async move {
                if !has_parent {
                    return Ok(None);
                }
                store.parent_window(tenant, &chunk_id).await
            }
        });
        let windows = join_all(lookups).await;

        let mut report = ExpansionReport::default();
        for (result, window) in results.iter_mut().zip(windows) {
            match window {
                Ok(Some(text)) => {
                    result.context = Some(text);
                    report.expanded += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        tenant = %tenant,
                        chunk_id = %result.chunk_id,
                        error = %e,
                        "parent window lookup failed, keeping chunk text"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}
