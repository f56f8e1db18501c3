//! Stage wiring
//!
//! Every stage runs in its own task, connected by bounded channels. When a
//! stage fails the remaining stages are cancelled, which makes the sink treat
//! the run as interrupted.

use crate::grouping::{GroupedWithin, GroupingSettings};
use crate::validation::SchemaValidation;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tributary_core::{
    Row, Schema, SchemaValidator, Sink, Source, StreamError, StreamResult, Transform,
};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

type Stage = (&'static str, JoinHandle<StreamResult<()>>);

fn spawn_stage<F>(name: &'static str, stop: CancellationToken, run: F) -> Stage
where
    F: std::future::Future<Output = StreamResult<()>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let result = run.await;
        if let Err(e) = &result {
            error!(stage = name, error = %e, "stage failed, stopping pipeline");
            stop.cancel();
        }
        result
    });
    (name, handle)
}

/// Wait for all stages and report the root failure
///
/// A closed channel is usually the echo of a failure in a neighbouring stage,
/// so any other error wins over it.
async fn settle(stages: Vec<Stage>) -> StreamResult<()> {
    let mut failures = Vec::new();
    for (name, handle) in stages {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(e),
            Err(join) => failures.push(StreamError::Other(anyhow::anyhow!(
                "{name} stage panicked: {join}"
            ))),
        }
    }
    if failures.is_empty() {
        return Ok(());
    }
    let root = failures
        .iter()
        .position(|e| !matches!(e, StreamError::ChannelClosed(_)))
        .unwrap_or(0);
    Err(failures.swap_remove(root))
}

/// Source → grouping → sink, without schema checks
pub struct Pipeline<T, S, K> {
    source: S,
    sink: K,
    grouping: GroupingSettings,
    channel_capacity: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S, K> Pipeline<T, S, K>
where
    T: Send + 'static,
    S: Source<T> + 'static,
    K: Sink<Vec<T>> + 'static,
{
    pub fn new(source: S, sink: K, grouping: GroupingSettings) -> Self {
        Self {
            source,
            sink,
            grouping,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            _marker: PhantomData,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub async fn run(self, cancel: CancellationToken) -> StreamResult<()> {
        let Self {
            mut source,
            mut sink,
            grouping,
            channel_capacity,
            ..
        } = self;
        info!(source = %source.name(), sink = %sink.name(), "pipeline starting");
        let (src_tx, src_rx) = mpsc::channel(channel_capacity);
        let (grp_tx, grp_rx) = mpsc::channel(channel_capacity);
        let mut grouper = GroupedWithin::new("grouping", grouping);

        let c1 = cancel.child_token();
        let c2 = cancel.child_token();
        let c3 = cancel.child_token();
        let stages = vec![
            spawn_stage("source", cancel.clone(), async move { source.run(src_tx, c1).await }),
            spawn_stage("grouping", cancel.clone(), async move {
                grouper.run(src_rx, grp_tx, c2).await
            }),
            spawn_stage("sink", cancel.clone(), async move { sink.run(grp_rx, c3).await }),
        ];
        settle(stages).await
    }
}

/// A source together with the validator describing what it emits
pub struct SchemaBoundSource<S, V> {
    source: S,
    validator: Arc<V>,
}

impl<S: Source<Row>, V: SchemaValidator> SchemaBoundSource<S, V> {
    pub fn new(source: S, validator: Arc<V>) -> Self {
        Self { source, validator }
    }

    pub fn schema(&self) -> &Schema {
        self.validator.schema()
    }
}

/// A sink together with the validator describing what it accepts
pub struct SchemaBoundSink<K, V> {
    sink: K,
    validator: Arc<V>,
}

impl<K: Sink<Vec<Row>>, V: SchemaValidator> SchemaBoundSink<K, V> {
    pub fn new(sink: K, validator: Arc<V>) -> Self {
        Self { sink, validator }
    }

    pub fn schema(&self) -> &Schema {
        self.validator.schema()
    }
}

/// Connect a schema-bound pair; both sides must carry the same validator type
///
/// Fails when the two schemas disagree on the number of fields.
pub fn connect<S, K, V>(
    source: SchemaBoundSource<S, V>,
    sink: SchemaBoundSink<K, V>,
    grouping: GroupingSettings,
) -> StreamResult<BoundPipeline<S, K, V>>
where
    S: Source<Row> + 'static,
    K: Sink<Vec<Row>> + 'static,
    V: SchemaValidator,
{
    if !source.schema().is_compatible_with(sink.schema()) {
        return Err(StreamError::SchemaInconsistent {
            expected: sink.schema().len(),
            actual: source.schema().len(),
        });
    }
    Ok(BoundPipeline {
        source: source.source,
        sink: sink.sink,
        validator: sink.validator,
        grouping,
        channel_capacity: DEFAULT_CHANNEL_CAPACITY,
    })
}

/// Source → grouping → validation → sink
pub struct BoundPipeline<S, K, V> {
    source: S,
    sink: K,
    validator: Arc<V>,
    grouping: GroupingSettings,
    channel_capacity: usize,
}

impl<S, K, V> BoundPipeline<S, K, V>
where
    S: Source<Row> + 'static,
    K: Sink<Vec<Row>> + 'static,
    V: SchemaValidator,
{
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn schema(&self) -> &Schema {
        self.validator.schema()
    }

    pub async fn run(self, cancel: CancellationToken) -> StreamResult<()> {
        let Self {
            mut source,
            mut sink,
            validator,
            grouping,
            channel_capacity,
        } = self;
        info!(
            source = %source.name(),
            sink = %sink.name(),
            fields = validator.schema().len(),
            "schema-bound pipeline starting"
        );
        let (src_tx, src_rx) = mpsc::channel(channel_capacity);
        let (grp_tx, grp_rx) = mpsc::channel(channel_capacity);
        let (val_tx, val_rx) = mpsc::channel(channel_capacity);
        let mut grouper = GroupedWithin::new("grouping", grouping);
        let mut validation = SchemaValidation::new("validation", validator);

        let c1 = cancel.child_token();
        let c2 = cancel.child_token();
        let c3 = cancel.child_token();
        let c4 = cancel.child_token();
        let stages = vec![
            spawn_stage("source", cancel.clone(), async move { source.run(src_tx, c1).await }),
            spawn_stage("grouping", cancel.clone(), async move {
                grouper.run(src_rx, grp_tx, c2).await
            }),
            spawn_stage("validation", cancel.clone(), async move {
                validation.run(grp_rx, val_tx, c3).await
            }),
            spawn_stage("sink", cancel.clone(), async move { sink.run(val_rx, c4).await }),
        ];
        settle(stages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tributary_core::{
        BatchRx, BatchTx, CellValue, DataCell, FieldCountValidator, FieldType, Message, Operator,
        SchemaField,
    };

    struct VecSource {
        rows: Vec<Row>,
    }

    impl Operator for VecSource {
        fn name(&self) -> &str {
            "vec-source"
        }
    }

    #[async_trait]
    impl Source<Row> for VecSource {
        async fn run(&mut self, tx: BatchTx<Row>, _cancel: CancellationToken) -> StreamResult<()> {
            for row in self.rows.drain(..) {
                tx.send(Message::Batch(row))
                    .await
                    .map_err(|_| StreamError::ChannelClosed("downstream"))?;
            }
            let _ = tx.send(Message::Eos).await;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct CollectSink {
        groups: Arc<Mutex<Vec<usize>>>,
        completed: Arc<Mutex<bool>>,
    }

    impl Operator for CollectSink {
        fn name(&self) -> &str {
            "collect-sink"
        }
    }

    #[async_trait]
    impl Sink<Vec<Row>> for CollectSink {
        async fn run(&mut self, mut rx: BatchRx<Vec<Row>>, _cancel: CancellationToken) -> StreamResult<()> {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Batch(group) => self.groups.lock().unwrap().push(group.len()),
                    Message::Eos => {
                        *self.completed.lock().unwrap() = true;
                        return Ok(());
                    }
                }
            }
            Err(StreamError::ChannelClosed("sink input"))
        }
    }

    fn schema(fields: usize) -> Schema {
        Schema::new(
            (0..fields)
                .map(|i| SchemaField::new(format!("f{i}"), FieldType::Int64, true))
                .collect(),
        )
    }

    fn row(cells: usize) -> Row {
        (0..cells)
            .map(|i| DataCell::new(format!("f{i}"), FieldType::Int64, CellValue::Int64(1)))
            .collect()
    }

    fn grouping() -> GroupingSettings {
        GroupingSettings::new(2, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_bound_pipeline_runs_to_completion() {
        let validator = Arc::new(FieldCountValidator::new(schema(2)));
        let sink = CollectSink::default();
        let source = SchemaBoundSource::new(VecSource { rows: vec![row(2); 5] }, validator.clone());
        let bound_sink = SchemaBoundSink::new(sink.clone(), validator);
        connect(source, bound_sink, grouping())
            .unwrap()
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*sink.groups.lock().unwrap(), vec![2, 2, 1]);
        assert!(*sink.completed.lock().unwrap());
    }

    #[test]
    fn test_connect_rejects_schema_disparity() {
        let source = SchemaBoundSource::new(
            VecSource { rows: vec![] },
            Arc::new(FieldCountValidator::new(schema(3))),
        );
        let sink = SchemaBoundSink::new(
            CollectSink::default(),
            Arc::new(FieldCountValidator::new(schema(2))),
        );
        assert!(matches!(
            connect(source, sink, grouping()),
            Err(StreamError::SchemaInconsistent { expected: 2, actual: 3 })
        ));
    }

    #[tokio::test]
    async fn test_invalid_rows_fail_the_pipeline_without_completion() {
        let validator = Arc::new(FieldCountValidator::new(schema(2)));
        let sink = CollectSink::default();
        let source = SchemaBoundSource::new(
            VecSource { rows: vec![row(2), row(1)] },
            validator.clone(),
        );
        let result = connect(source, SchemaBoundSink::new(sink.clone(), validator), grouping())
            .unwrap()
            .run(CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StreamError::SchemaInconsistent { .. })));
        assert!(!*sink.completed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_unbound_pipeline_groups_elements() {
        struct Numbers;
        impl Operator for Numbers {
            fn name(&self) -> &str {
                "numbers"
            }
        }
        #[async_trait]
        impl Source<u32> for Numbers {
            async fn run(&mut self, tx: BatchTx<u32>, _cancel: CancellationToken) -> StreamResult<()> {
                for i in 0..3 {
                    let _ = tx.send(Message::Batch(i)).await;
                }
                let _ = tx.send(Message::Eos).await;
                Ok(())
            }
        }
        struct Count(Arc<Mutex<usize>>);
        impl Operator for Count {
            fn name(&self) -> &str {
                "count"
            }
        }
        #[async_trait]
        impl Sink<Vec<u32>> for Count {
            async fn run(&mut self, mut rx: BatchRx<Vec<u32>>, _cancel: CancellationToken) -> StreamResult<()> {
                while let Some(Message::Batch(group)) = rx.recv().await {
                    *self.0.lock().unwrap() += group.len();
                }
                Ok(())
            }
        }

        let total = Arc::new(Mutex::new(0));
        Pipeline::new(Numbers, Count(total.clone()), grouping())
            .with_channel_capacity(1)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*total.lock().unwrap(), 3);
    }
}
