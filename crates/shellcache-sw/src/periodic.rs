//! Periodic background refresh.

use tracing::{debug, info, warn};

use crate::install::Precacher;
use crate::store::PopulateReport;

/// Re-populates the current generation when the periodic sync tag fires.
#[derive(Clone)]
pub struct PeriodicRefresh {
    tag: String,
    precacher: Precacher,
}

impl PeriodicRefresh {
    pub fn new(tag: impl Into<String>, precacher: Precacher) -> Self {
        Self {
            tag: tag.into(),
            precacher,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns `None` for foreign tags and for failed refreshes.
    pub async fn handle(&self, tag: &str) -> Option<PopulateReport> {
        if tag != self.tag {
            debug!(tag = %tag, "Ignoring periodic sync for another tag");
            return None;
        }

        match self.precacher.run().await {
            Ok(report) => {
                info!(
                    cache = %self.precacher.cache_name(),
                    cached = report.cached.len(),
                    skipped = report.skipped.len(),
                    "Periodic refresh complete"
                );
                Some(report)
            }
            Err(e) => {
                warn!(cache = %self.precacher.cache_name(), error = %e, "Periodic refresh failed");
                None
            }
        }
    }
}
