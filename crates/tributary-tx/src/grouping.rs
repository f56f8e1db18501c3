//! Element grouping between a source and a sink
//!
//! Sources emit one element per demand signal; sinks write one group per
//! row group or part. `GroupedWithin` closes a group when it holds
//! `rows_per_group` elements or when `interval` has passed since its first
//! element, whichever comes first. The partial group is flushed on end of
//! stream.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tributary_core::spec::PipelineSpec;
use tributary_core::{BatchRx, BatchTx, Message, Operator, StreamError, StreamResult, Transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupingSettings {
    pub rows_per_group: usize,
    pub interval: Duration,
}

impl GroupingSettings {
    pub fn new(rows_per_group: usize, interval: Duration) -> Self {
        Self {
            rows_per_group: rows_per_group.max(1),
            interval,
        }
    }

    pub fn from_spec(spec: &PipelineSpec) -> Self {
        Self::new(
            spec.rows_per_group,
            Duration::from_millis(spec.grouping_interval_ms),
        )
    }
}

pub struct GroupedWithin<T> {
    id: String,
    settings: GroupingSettings,
    _marker: PhantomData<fn() -> T>,
}

impl<T> GroupedWithin<T> {
    pub fn new(id: impl Into<String>, settings: GroupingSettings) -> Self {
        Self {
            id: id.into(),
            settings,
            _marker: PhantomData,
        }
    }
}

impl<T: Send> Operator for GroupedWithin<T> {
    fn name(&self) -> &str {
        &self.id
    }
}

async fn emit<T>(tx: &BatchTx<Vec<T>>, group: &mut Vec<T>) -> StreamResult<()> {
    if group.is_empty() {
        return Ok(());
    }
    let batch = std::mem::take(group);
    debug!(size = batch.len(), "group closed");
    tx.send(Message::Batch(batch))
        .await
        .map_err(|_| StreamError::ChannelClosed("grouping output"))
}

#[async_trait]
impl<T: Send + 'static> Transform<T, Vec<T>> for GroupedWithin<T> {
    async fn run(
        &mut self,
        mut rx: BatchRx<T>,
        tx: BatchTx<Vec<T>>,
        _cancel: CancellationToken,
    ) -> StreamResult<()> {
        info!(
            name = %self.id,
            rows_per_group = self.settings.rows_per_group,
            interval_ms = self.settings.interval.as_millis() as u64,
            "grouping started"
        );
        let mut group: Vec<T> = Vec::with_capacity(self.settings.rows_per_group);
        let mut deadline: Option<Instant> = None;

        loop {
            let wake_at = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                message = rx.recv() => match message {
                    Some(Message::Batch(item)) => {
                        if group.is_empty() {
                            deadline = Some(Instant::now() + self.settings.interval);
                        }
                        group.push(item);
                        if group.len() >= self.settings.rows_per_group {
                            emit(&tx, &mut group).await?;
                            deadline = None;
                        }
                    }
                    Some(Message::Eos) => {
                        emit(&tx, &mut group).await?;
                        let _ = tx.send(Message::Eos).await;
                        info!(name = %self.id, "grouping finished");
                        return Ok(());
                    }
                    None => return Err(StreamError::ChannelClosed("grouping input closed without end of stream")),
                },
                _ = sleep_until(wake_at), if deadline.is_some() => {
                    emit(&tx, &mut group).await?;
                    deadline = None;
                }
            }
        }
    }
}
