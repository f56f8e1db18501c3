//! Demand-driven polling sources
//!
//! A concrete source is a state machine implementing [`PollingSource`]. It never
//! runs on its own: the [`PollingDriver`] waits for downstream demand (a free slot
//! in the bounded output channel), asks the source for more data, and owns the
//! single timer used for idle polling and retry backoff.
//!
//! ```text
//! Idle --pull--> Fetching --+--> Emitting ----------------> Idle
//!                           +--> WaitingForMoreData --timer--> Fetching
//!                           +--> Completed
//!                           +--> Failed (decider: Stop) / retry (decider: Restart)
//! ```

use crate::error::{classify, Directive, StreamError, StreamResult, DEFAULT_RESTART_DELAY};
use crate::metadata::SourceTags;
use crate::{BatchTx, Message, Operator, Source};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Outcome of one pull or timer tick
#[derive(Debug)]
pub enum Pull<T> {
    /// Elements ready for downstream; an empty list asks for an immediate re-pull
    Emit(Vec<T>),
    /// Nothing available, fire the timer after the given delay
    Wait(Duration),
    /// The source is exhausted and the stage completes
    Complete,
}

/// Protocol implemented by every concrete source
///
/// Each call performs at most one asynchronous I/O operation. Errors are
/// classified by [`PollingSource::decide`].
#[async_trait]
pub trait PollingSource: Send {
    type Item: Send + 'static;

    fn name(&self) -> &str;

    fn tags(&self) -> &SourceTags;

    /// One-time initialization, e.g. schema discovery
    async fn pre_start(&mut self) -> StreamResult<()> {
        Ok(())
    }

    /// Downstream requested more data
    async fn on_pull(&mut self) -> StreamResult<Pull<Self::Item>>;

    /// A scheduled wait or retry delay elapsed
    async fn on_timer(&mut self) -> StreamResult<Pull<Self::Item>> {
        self.on_pull().await
    }

    /// Map a failure to the next action
    fn decide(&self, error: &StreamError) -> Directive {
        classify(error.kind())
    }

    /// Release connections and clients; called once on completion or failure
    async fn post_stop(&mut self) {}
}

/// Backfill / incremental lifecycle flag owned by a running source
#[derive(Debug, Clone)]
pub struct BackfillState {
    backfilling: bool,
    stop_after_backfill: bool,
}

/// What happens when the full load runs dry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// Backfill finished and the stage must stop
    Complete,
    /// Backfill finished, the source now polls for changes
    Transitioned,
    /// Already incremental, keep polling
    Incremental,
}

impl BackfillState {
    /// `stop_after_backfill` without `backfill` is rejected
    pub fn new(backfill: bool, stop_after_backfill: bool) -> StreamResult<Self> {
        if stop_after_backfill && !backfill {
            return Err(StreamError::config(
                "stop_after_backfill requires backfill to be enabled",
            ));
        }
        Ok(Self {
            backfilling: backfill,
            stop_after_backfill,
        })
    }

    pub fn is_backfilling(&self) -> bool {
        self.backfilling
    }

    pub fn stop_after_backfill(&self) -> bool {
        self.stop_after_backfill
    }

    /// Called when a fetch returns no data
    pub fn on_exhausted(&mut self) -> BackfillOutcome {
        if !self.backfilling {
            return BackfillOutcome::Incremental;
        }
        if self.stop_after_backfill {
            info!("backfill completed, stopping the stream");
            return BackfillOutcome::Complete;
        }
        self.backfilling = false;
        info!("backfill completed, switching to incremental mode");
        BackfillOutcome::Transitioned
    }
}

/// Polling cadence composed into every source
#[derive(Debug, Clone)]
pub struct PollingState {
    pub backfill: BackfillState,
    pub change_capture_interval: Duration,
}

impl PollingState {
    pub fn new(backfill: BackfillState, change_capture_interval: Duration) -> Self {
        Self {
            backfill,
            change_capture_interval,
        }
    }

    pub fn is_backfilling(&self) -> bool {
        self.backfill.is_backfilling()
    }

    /// Pull result for an empty fetch
    pub fn on_empty<T>(&mut self) -> Pull<T> {
        match self.backfill.on_exhausted() {
            BackfillOutcome::Complete => Pull::Complete,
            BackfillOutcome::Transitioned | BackfillOutcome::Incremental => {
                Pull::Wait(self.change_capture_interval)
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Step {
    Pull,
    Timer,
}

/// Runs a [`PollingSource`] against a bounded output channel
pub struct PollingDriver<S> {
    source: S,
    restart_delay: Duration,
}

impl<S: PollingSource> PollingDriver<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    async fn drive(&mut self, tx: BatchTx<S::Item>, cancel: CancellationToken) -> StreamResult<()> {
        if let Err(e) = self.source.pre_start().await {
            error!(error = %e, "source failed to start");
            self.source.post_stop().await;
            return Err(e);
        }

        let mut pending: VecDeque<S::Item> = VecDeque::new();
        let mut step = Step::Pull;

        loop {
            // a free channel slot is downstream demand
            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cancellation requested, draining source");
                    break;
                }
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.source.post_stop().await;
                        return Err(StreamError::ChannelClosed("downstream"));
                    }
                },
            };

            if let Some(item) = pending.pop_front() {
                permit.send(Message::Batch(item));
                continue;
            }

            // in-flight fetches are not interrupted by cancellation
            let result = match step {
                Step::Pull => self.source.on_pull().await,
                Step::Timer => self.source.on_timer().await,
            };
            step = Step::Pull;

            match result {
                Ok(Pull::Emit(items)) => {
                    let mut items = items.into_iter();
                    match items.next() {
                        Some(first) => permit.send(Message::Batch(first)),
                        None => drop(permit),
                    }
                    pending.extend(items);
                }
                Ok(Pull::Wait(delay)) => {
                    drop(permit);
                    debug!(delay_ms = delay.as_millis() as u64, "no data available, waiting");
                    if !sleep_or_cancel(delay, &cancel).await {
                        info!("cancellation requested while waiting");
                        break;
                    }
                    step = Step::Timer;
                }
                Ok(Pull::Complete) => {
                    drop(permit);
                    info!("source completed");
                    break;
                }
                Err(e) => match self.source.decide(&e) {
                    Directive::Restart => {
                        drop(permit);
                        warn!(error = %e, "fetch failed, scheduling retry");
                        if !sleep_or_cancel(self.restart_delay, &cancel).await {
                            break;
                        }
                        step = Step::Timer;
                    }
                    Directive::Stop => {
                        error!(error = %e, "source failed");
                        self.source.post_stop().await;
                        return Err(e);
                    }
                },
            }
        }

        for item in pending {
            if tx.send(Message::Batch(item)).await.is_err() {
                self.source.post_stop().await;
                return Err(StreamError::ChannelClosed("downstream"));
            }
        }
        self.source.post_stop().await;
        let _ = tx.send(Message::Eos).await; // best-effort
        Ok(())
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

impl<S: PollingSource> Operator for PollingDriver<S> {
    fn name(&self) -> &str {
        self.source.name()
    }
}

#[async_trait]
impl<S: PollingSource> Source<S::Item> for PollingDriver<S> {
    async fn run(&mut self, tx: BatchTx<S::Item>, cancel: CancellationToken) -> StreamResult<()> {
        let tags = self.source.tags();
        let span = info_span!(
            "source",
            name = %self.source.name(),
            entity = %tags.source_entity,
            location = %tags.source_location
        );
        self.drive(tx, cancel).instrument(span).await
    }
}
