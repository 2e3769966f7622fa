//! Pipeline runtime
//!
//! A pipeline is built from configuration text into plugin instances, then
//! started as a set of tokio tasks:
//!
//! ```text
//! input task ─┐                       ┌─ worker ─┐
//! input task ─┼─► queue (bounded) ────┼─ worker ─┼─► output stage ─► outputs
//! input task ─┘                       └─ worker ─┘
//! ```
//!
//! Inputs push into a bounded queue, `pipeline.workers` workers pull batches of
//! up to `pipeline.batch.size` events and run them through the filters, and a
//! single output stage writes each batch to every output in order.
//!
//! Stopping is a drain: inputs are told to return, the queue closes once the
//! last input has returned, workers finish what is queued, and the output
//! stage flushes and closes the outputs.

pub mod config;
pub mod event;

use crate::config::Settings;
use crate::error::BuildError;
use crate::metrics::{MetricsCollector, PipelineMetrics};
use crate::plugins::{Filter, Input, InputContext, Output, PluginRegistry};
use chrono::{DateTime, Utc};
use config::PipelineDefinition;
use event::Event;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Lifecycle state of a pipeline instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Plugins instantiated, no tasks spawned yet
    Building,
    /// Workers live and inputs accepting events
    Running,
    /// Stop requested, in-flight events finishing
    Draining,
    /// Terminal
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Building => "building",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct Components {
    inputs: Vec<(String, Box<dyn Input>)>,
    filters: Vec<Box<dyn Filter>>,
    outputs: Vec<(String, Box<dyn Output>)>,
}

struct Inner {
    state: PipelineState,
    components: Option<Components>,
    tasks: Vec<JoinHandle<()>>,
}

/// A built pipeline instance
pub struct Pipeline {
    id: String,
    instance_id: Uuid,
    definition: PipelineDefinition,
    workers: usize,
    batch_size: usize,
    created_at: DateTime<Utc>,
    metrics: PipelineMetrics,
    inner: Mutex<Inner>,
    shutdown_tx: watch::Sender<bool>,
    stop_lock: tokio::sync::Mutex<()>,
}

impl Pipeline {
    /// Instantiate every plugin of `definition`
    ///
    /// No task is spawned until [`Pipeline::start`], so a pipeline that is
    /// dropped without being started releases everything with it.
    pub fn build(
        id: &str,
        definition: PipelineDefinition,
        settings: &Settings,
        plugins: &PluginRegistry,
        metrics: PipelineMetrics,
    ) -> Result<Self, BuildError> {
        settings.validate()?;

        let mut inputs = Vec::with_capacity(definition.inputs.len());
        for decl in &definition.inputs {
            inputs.push((decl.name.clone(), plugins.build_input(&decl.name, &decl.args)?));
        }

        let mut filters = Vec::with_capacity(definition.filters.len());
        for decl in &definition.filters {
            filters.push(plugins.build_filter(&decl.name, &decl.args)?);
        }

        let mut outputs = Vec::with_capacity(definition.outputs.len());
        for decl in &definition.outputs {
            outputs.push((decl.name.clone(), plugins.build_output(&decl.name, &decl.args)?));
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            id: id.to_string(),
            instance_id: Uuid::new_v4(),
            definition,
            workers: settings.pipeline_workers,
            batch_size: settings.pipeline_batch_size,
            created_at: Utc::now(),
            metrics,
            inner: Mutex::new(Inner {
                state: PipelineState::Building,
                components: Some(Components {
                    inputs,
                    filters,
                    outputs,
                }),
                tasks: Vec::new(),
            }),
            shutdown_tx,
            stop_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Spawn the input, worker and output tasks
    ///
    /// Must be called from within a tokio runtime. Returns false if the
    /// pipeline was already started or stopped.
    pub fn start(&self) -> bool {
        let mut inner = self.lock_inner();
        if inner.state != PipelineState::Building {
            return false;
        }
        let Some(components) = inner.components.take() else {
            return false;
        };

        let capacity = self.batch_size.saturating_mul(self.workers).max(1);
        let (queue_tx, queue_rx) = mpsc::channel::<Event>(capacity);
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Event>>(self.workers.max(1));
        let mut tasks = Vec::with_capacity(components.inputs.len() + self.workers + 1);

        for (name, mut input) in components.inputs {
            let ctx = InputContext::new(self.id.clone(), queue_tx.clone(), self.shutdown_tx.subscribe());
            let pipeline = self.id.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = input.run(ctx).await {
                    error!(pipeline = %pipeline, input = %name, "Input failed: {:#}", e);
                }
            }));
        }
        // Workers see the queue close once every input task has returned
        drop(queue_tx);

        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let filters: Arc<Vec<Box<dyn Filter>>> = Arc::new(components.filters);
        for worker in 0..self.workers {
            tasks.push(tokio::spawn(run_worker(
                self.id.clone(),
                worker,
                Arc::clone(&queue_rx),
                Arc::clone(&filters),
                batch_tx.clone(),
                self.batch_size,
                self.metrics.clone(),
            )));
        }
        drop(batch_tx);

        tasks.push(tokio::spawn(run_output_stage(
            self.id.clone(),
            batch_rx,
            components.outputs,
            self.metrics.clone(),
        )));

        inner.tasks = tasks;
        inner.state = PipelineState::Running;
        info!(
            pipeline = %self.id,
            instance = %self.instance_id,
            workers = self.workers,
            batch_size = self.batch_size,
            "Pipeline started"
        );
        true
    }

    /// Drain and stop the pipeline, waiting for every task to finish
    ///
    /// Idempotent. A pipeline that was never started goes straight to
    /// [`PipelineState::Stopped`].
    #[instrument(skip(self), fields(pipeline = %self.id, instance = %self.instance_id))]
    pub async fn stop(&self) {
        let _stopping = self.stop_lock.lock().await;

        let tasks = {
            let mut inner = self.lock_inner();
            match inner.state {
                PipelineState::Stopped => return,
                PipelineState::Building => {
                    inner.components = None;
                    inner.state = PipelineState::Stopped;
                    debug!("Pipeline stopped before it was started");
                    return;
                }
                PipelineState::Running | PipelineState::Draining => {
                    inner.state = PipelineState::Draining;
                    std::mem::take(&mut inner.tasks)
                }
            }
        };

        info!("Draining pipeline");
        self.shutdown_tx.send_replace(true);

        for task in tasks {
            if let Err(e) = task.await {
                error!("Pipeline task panicked: {}", e);
            }
        }

        self.lock_inner().state = PipelineState::Stopped;
        info!("Pipeline stopped");
    }

    pub fn state(&self) -> PipelineState {
        self.lock_inner().state
    }

    /// True while the pipeline has live tasks
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            PipelineState::Running | PipelineState::Draining
        )
    }

    /// True once the workers are live and inputs accept events
    pub fn is_ready(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// True once a started pipeline has run out of input and written everything
    pub fn is_finished(&self) -> bool {
        let inner = self.lock_inner();
        inner.state == PipelineState::Running && inner.tasks.iter().all(JoinHandle::is_finished)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unique id of this instance; changes on every reload
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("state", &self.state())
            .field("workers", &self.workers)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

async fn run_worker(
    pipeline: String,
    worker: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
    filters: Arc<Vec<Box<dyn Filter>>>,
    batches: mpsc::Sender<Vec<Event>>,
    batch_size: usize,
    metrics: PipelineMetrics,
) {
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        let received = queue.lock().await.recv_many(&mut batch, batch_size).await;
        if received == 0 {
            break;
        }
        metrics.record_in(received as u64);

        let mut kept = Vec::with_capacity(batch.len());
        'events: for mut event in batch.drain(..) {
            for filter in filters.iter() {
                match filter.filter(&mut event) {
                    Ok(true) => {}
                    Ok(false) => continue 'events,
                    Err(e) => {
                        warn!(pipeline = %pipeline, worker, "Filter failed, dropping event: {:#}", e);
                        continue 'events;
                    }
                }
            }
            kept.push(event);
        }

        if kept.is_empty() {
            continue;
        }
        metrics.record_filtered(kept.len() as u64);
        if batches.send(kept).await.is_err() {
            error!(pipeline = %pipeline, worker, "Output stage is gone, stopping worker");
            break;
        }
    }

    debug!(pipeline = %pipeline, worker, "Worker finished");
}

async fn run_output_stage(
    pipeline: String,
    mut batches: mpsc::Receiver<Vec<Event>>,
    mut outputs: Vec<(String, Box<dyn Output>)>,
    metrics: PipelineMetrics,
) {
    while let Some(batch) = batches.recv().await {
        for (name, output) in outputs.iter_mut() {
            for event in &batch {
                if let Err(e) = output.write(event).await {
                    warn!(pipeline = %pipeline, output = %name, "Output write failed: {:#}", e);
                }
            }
            if let Err(e) = output.flush().await {
                warn!(pipeline = %pipeline, output = %name, "Output flush failed: {:#}", e);
            }
        }
        metrics.record_out(batch.len() as u64);
    }

    for (name, output) in outputs.iter_mut() {
        if let Err(e) = output.close().await {
            warn!(pipeline = %pipeline, output = %name, "Output close failed: {:#}", e);
        }
    }
    debug!(pipeline = %pipeline, "Output stage finished");
}

/// Turns configuration text into a pipeline instance
///
/// The agent builds every pipeline through this trait, so tests and embedders
/// can substitute their own construction.
pub trait PipelineBuilder: Send + Sync {
    fn build(&self, id: &str, config_text: &str, settings: &Settings) -> Result<Pipeline, BuildError>;
}

/// Builds pipelines from the plugin registry, wiring in the metrics collector
pub struct DefaultPipelineBuilder {
    plugins: Arc<PluginRegistry>,
    metrics: Arc<MetricsCollector>,
}

impl DefaultPipelineBuilder {
    pub fn new(plugins: Arc<PluginRegistry>, metrics: Arc<MetricsCollector>) -> Self {
        Self { plugins, metrics }
    }
}

impl PipelineBuilder for DefaultPipelineBuilder {
    fn build(&self, id: &str, config_text: &str, settings: &Settings) -> Result<Pipeline, BuildError> {
        let definition = PipelineDefinition::parse(config_text)?;
        Pipeline::build(
            id,
            definition,
            settings,
            &self.plugins,
            self.metrics.pipeline(id),
        )
    }
}
