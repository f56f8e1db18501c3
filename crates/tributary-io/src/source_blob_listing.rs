//! Blob listing source
//!
//! Lists a prefix on every poll and emits one JSON descriptor per blob that
//! appeared since the previous listing. A backfill starts from an empty
//! high-water mark, so the first listing emits everything already present.

use crate::storage::{BlobDescriptor, BlobStorage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use tributary_core::spec::BlobListingSourceSpec;
use tributary_core::{PollingSource, PollingState, Pull, SourceTags, StreamResult};

pub struct BlobListingSource {
    name: String,
    tags: SourceTags,
    storage: Arc<dyn BlobStorage>,
    prefix: String,
    polling: PollingState,
    high_water_mark: Option<DateTime<Utc>>,
    // names already emitted with a timestamp equal to the mark
    seen_at_mark: HashSet<String>,
}

impl BlobListingSource {
    pub fn new(
        name: impl Into<String>,
        spec: &BlobListingSourceSpec,
        storage: Arc<dyn BlobStorage>,
        polling: PollingState,
    ) -> Self {
        let high_water_mark = (!polling.is_backfilling()).then(Utc::now);
        Self {
            name: name.into(),
            tags: SourceTags::new(spec.prefix.clone(), "blob-storage"),
            storage,
            prefix: spec.prefix.clone(),
            polling,
            high_water_mark,
            seen_at_mark: HashSet::new(),
        }
    }

    pub fn high_water_mark(&self) -> Option<DateTime<Utc>> {
        self.high_water_mark
    }

    fn is_new(&self, blob: &BlobDescriptor) -> bool {
        match self.high_water_mark {
            None => true,
            Some(mark) if blob.last_modified > mark => true,
            Some(mark) => blob.last_modified == mark && !self.seen_at_mark.contains(&blob.name),
        }
    }

    fn advance(&mut self, blobs: &[BlobDescriptor]) {
        let Some(latest) = blobs.iter().map(|b| b.last_modified).max() else {
            return;
        };
        if self.high_water_mark != Some(latest) {
            self.seen_at_mark.clear();
        }
        self.high_water_mark = Some(latest);
        self.seen_at_mark.extend(
            blobs
                .iter()
                .filter(|b| b.last_modified == latest)
                .map(|b| b.name.clone()),
        );
    }
}

#[async_trait]
impl PollingSource for BlobListingSource {
    type Item = Value;

    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &SourceTags {
        &self.tags
    }

    async fn on_pull(&mut self) -> StreamResult<Pull<Value>> {
        let listed = self.storage.list_blobs(&self.prefix).await?;
        let mut fresh: Vec<BlobDescriptor> = listed.into_iter().filter(|b| self.is_new(b)).collect();
        if fresh.is_empty() {
            return Ok(self.polling.on_empty());
        }
        fresh.sort_by(|a, b| a.last_modified.cmp(&b.last_modified).then(a.name.cmp(&b.name)));
        self.advance(&fresh);
        debug!(count = fresh.len(), prefix = %self.prefix, "new blobs listed");

        let documents = fresh
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Pull::Emit(documents))
    }
}
