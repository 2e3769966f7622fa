//! Agent mode implementation
//!
//! The agent owns every registered pipeline and keeps each one consistent with
//! its configuration source. A reload of one pipeline id runs in this order,
//! under that id's reload lock:
//!
//! 1. fetch the configuration text
//! 2. compare it byte for byte with the text the live pipeline was built from
//! 3. parse the candidate and check that every plugin involved can be reloaded
//! 4. build the candidate, start it, swap it into the registry, stop the old one
//!
//! Any failure before the swap leaves the running pipeline untouched.

use crate::compat::{self, Compatibility, PluginRef};
use crate::config::Settings;
use crate::error::{AgentError, BuildError, FetchError};
use crate::metrics::MetricsCollector;
use crate::pipeline::config::PipelineDefinition;
use crate::pipeline::{DefaultPipelineBuilder, Pipeline, PipelineBuilder, PipelineState};
use crate::plugins::{stop_requested, PluginRegistry, ReloadPolicy};
use crate::registry::{PipelineRegistry, Registration};
use crate::source::{ConfigSource, LocalConfigSource};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Wall-clock time the agent process started
pub static STARTED_AT: Lazy<DateTime<Utc>> = Lazy::new(Utc::now);

static STARTED_INSTANT: Lazy<Instant> = Lazy::new(Instant::now);

/// Result of one reload attempt for a pipeline id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReloadOutcome {
    /// Fetched text is identical to the running text
    Unchanged,
    /// A new instance replaced the old one
    Reloaded { generation: u64 },
    /// Plugins that cannot be reloaded are involved; nothing was built
    Incompatible { blocking: Vec<PluginRef> },
    /// Configuration could not be fetched
    FetchFailed { reason: String },
    /// The candidate did not parse or build
    BuildFailed { reason: String },
    NotRegistered,
    ShuttingDown,
}

impl ReloadOutcome {
    pub fn is_reloaded(&self) -> bool {
        matches!(self, ReloadOutcome::Reloaded { .. })
    }
}

/// Point-in-time view of a registered pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub id: String,
    pub instance_id: Uuid,
    pub state: PipelineState,
    pub generation: u64,
    pub workers: usize,
    pub batch_size: usize,
    /// When this instance was built
    pub created_at: DateTime<Utc>,
    /// When this instance became the registered one
    pub installed_at: DateTime<Utc>,
}

/// Builder for an [`Agent`] with custom collaborators
pub struct AgentBuilder {
    settings: Settings,
    plugins: Option<Arc<PluginRegistry>>,
    metrics: Option<Arc<MetricsCollector>>,
    source: Option<Arc<dyn ConfigSource>>,
    pipeline_builder: Option<Arc<dyn PipelineBuilder>>,
    reload_policy: Option<Arc<dyn ReloadPolicy>>,
}

impl AgentBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            plugins: None,
            metrics: None,
            source: None,
            pipeline_builder: None,
            reload_policy: None,
        }
    }

    /// Plugin types available to pipelines (defaults to the built-ins)
    pub fn plugins(mut self, plugins: Arc<PluginRegistry>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Where configuration text comes from (defaults to [`LocalConfigSource`])
    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// How configuration text becomes a pipeline (defaults to [`DefaultPipelineBuilder`])
    pub fn pipeline_builder(mut self, builder: Arc<dyn PipelineBuilder>) -> Self {
        self.pipeline_builder = Some(builder);
        self
    }

    /// Which plugin types may be hot reloaded (defaults to the plugin registry's flags)
    pub fn reload_policy(mut self, policy: Arc<dyn ReloadPolicy>) -> Self {
        self.reload_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        self.settings.validate()?;
        Lazy::force(&STARTED_AT);
        Lazy::force(&STARTED_INSTANT);

        let plugins = self
            .plugins
            .unwrap_or_else(|| Arc::new(PluginRegistry::with_builtins()));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(MetricsCollector::new()?),
        };
        let source = self
            .source
            .unwrap_or_else(|| Arc::new(LocalConfigSource) as Arc<dyn ConfigSource>);
        let pipeline_builder = self.pipeline_builder.unwrap_or_else(|| {
            Arc::new(DefaultPipelineBuilder::new(
                Arc::clone(&plugins),
                Arc::clone(&metrics),
            )) as Arc<dyn PipelineBuilder>
        });
        let reload_policy = self
            .reload_policy
            .unwrap_or_else(|| Arc::clone(&plugins) as Arc<dyn ReloadPolicy>);

        let node_name = match &self.settings.node_name {
            Some(name) => name.clone(),
            None => default_node_name(),
        };
        let (shutdown_tx, _) = watch::channel(false);

        let agent = Agent {
            id: Uuid::new_v4(),
            node_name,
            settings: Arc::new(self.settings),
            plugins,
            metrics,
            source,
            pipeline_builder,
            reload_policy,
            registry: PipelineRegistry::new(),
            shutdown_tx,
            executing: AtomicBool::new(false),
        };
        info!(agent = %agent.id, node = %agent.node_name, "Agent created");
        Ok(agent)
    }
}

fn default_node_name() -> String {
    match hostname::get().map(|name| name.into_string()) {
        Ok(Ok(name)) if !name.is_empty() => name,
        Ok(_) => {
            warn!("Host name is not valid UTF-8, using 'localhost' as node name");
            "localhost".to_string()
        }
        Err(e) => {
            warn!("Failed to read host name, using 'localhost' as node name: {}", e);
            "localhost".to_string()
        }
    }
}

/// Supervisor of pipelines and their live reloads
pub struct Agent {
    id: Uuid,
    node_name: String,
    settings: Arc<Settings>,
    plugins: Arc<PluginRegistry>,
    metrics: Arc<MetricsCollector>,
    source: Arc<dyn ConfigSource>,
    pipeline_builder: Arc<dyn PipelineBuilder>,
    reload_policy: Arc<dyn ReloadPolicy>,
    registry: PipelineRegistry,
    shutdown_tx: watch::Sender<bool>,
    executing: AtomicBool,
}

impl Agent {
    /// Create an agent with the default collaborators
    pub fn new(settings: Settings) -> Result<Self, AgentError> {
        AgentBuilder::new(settings).build()
    }

    pub fn builder(settings: Settings) -> AgentBuilder {
        AgentBuilder::new(settings)
    }

    /// Fetch, build and register a pipeline under `id`
    ///
    /// Nothing is registered if the id is taken or the fetch or build fails.
    /// The pipeline is started right away when the agent is already executing.
    #[instrument(skip(self, settings))]
    pub async fn register_pipeline(
        &self,
        id: &str,
        settings: Settings,
    ) -> Result<Arc<Registration>, AgentError> {
        if self.registry.contains(id) {
            return Err(AgentError::AlreadyRegistered(id.to_string()));
        }
        settings.validate()?;
        let settings = Arc::new(settings);

        let config_text = self
            .fetch(&settings)
            .await
            .map_err(|source| AgentError::Fetch {
                id: id.to_string(),
                source,
            })?;
        let pipeline = self
            .build(id, &config_text, &settings)
            .await
            .map_err(|source| AgentError::Build {
                id: id.to_string(),
                source,
            })?;
        let pipeline = Arc::new(pipeline);

        let registration = self.registry.insert(Registration::new(
            id,
            config_text,
            settings,
            Arc::clone(&pipeline),
        ))?;

        if self.is_executing() && !self.is_shutting_down() {
            pipeline.start();
        }
        info!(pipeline = %id, instance = %pipeline.instance_id(), "Pipeline registered");
        Ok(registration)
    }

    /// Fetch and build a pipeline without registering or starting it
    pub async fn check_pipeline(
        &self,
        id: &str,
        settings: Settings,
    ) -> Result<PipelineDefinition, AgentError> {
        settings.validate()?;
        let settings = Arc::new(settings);

        let config_text = self
            .fetch(&settings)
            .await
            .map_err(|source| AgentError::Fetch {
                id: id.to_string(),
                source,
            })?;
        let pipeline = self
            .build(id, &config_text, &settings)
            .await
            .map_err(|source| AgentError::Build {
                id: id.to_string(),
                source,
            })?;
        Ok(pipeline.definition().clone())
    }

    /// Run every registered pipeline until [`Agent::shutdown`] is called
    ///
    /// With `config.reload.automatic` set, every pipeline is reloaded each
    /// `config.reload.interval`.
    #[instrument(skip(self), fields(agent = %self.id))]
    pub async fn execute(&self) -> Result<(), AgentError> {
        if self.executing.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyExecuting);
        }

        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            self.executing.store(false, Ordering::SeqCst);
            return Ok(());
        }

        // Starting under the reload lock means an in-flight reload finishes its
        // swap first, and the instance started is the one left registered
        let ids = self.registry.ids();
        for id in &ids {
            let Some(_reload_guard) = self.registry.lock_for_reload(id).await else {
                continue;
            };
            if let Some(registration) = self.registry.get(id) {
                registration.pipeline().start();
            }
        }
        info!(pipelines = ids.len(), "Agent executing");

        if self.settings.reload_automatic {
            let period = self.settings.reload_interval;
            debug!("Automatic reload every {:?}", period);

            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_requested(&mut shutdown) => break,
                    _ = ticker.tick() => {
                        let outcomes = self.reload_state().await;
                        let reloaded = outcomes.values().filter(|o| o.is_reloaded()).count();
                        if reloaded > 0 {
                            info!(reloaded, "Automatic reload cycle replaced pipelines");
                        }
                    }
                }
            }
        } else {
            stop_requested(&mut shutdown).await;
        }

        self.executing.store(false, Ordering::SeqCst);
        info!("Agent control loop stopped");
        Ok(())
    }

    /// Reload every registered pipeline, concurrently across ids
    pub async fn reload_state(&self) -> BTreeMap<String, ReloadOutcome> {
        let ids = self.registry.ids();
        let outcomes = join_all(ids.iter().map(|id| self.reload_pipeline(id))).await;
        ids.into_iter().zip(outcomes).collect()
    }

    /// Reload a single pipeline if its configuration changed
    ///
    /// Concurrent calls for the same id run one after the other.
    #[instrument(skip(self))]
    pub async fn reload_pipeline(&self, id: &str) -> ReloadOutcome {
        let Some(_reload_guard) = self.registry.lock_for_reload(id).await else {
            return ReloadOutcome::NotRegistered;
        };
        if self.is_shutting_down() {
            return ReloadOutcome::ShuttingDown;
        }
        let Some(current) = self.registry.get(id) else {
            return ReloadOutcome::NotRegistered;
        };
        let metrics = self.metrics.pipeline(id);

        let candidate_text = match self.fetch(current.settings()).await {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to fetch configuration: {}", e);
                metrics.record_reload_failure();
                return ReloadOutcome::FetchFailed {
                    reason: e.to_string(),
                };
            }
        };

        if candidate_text == current.config_text() {
            debug!("Configuration unchanged");
            return ReloadOutcome::Unchanged;
        }

        let candidate = match PipelineDefinition::parse(&candidate_text) {
            Ok(definition) => definition,
            Err(e) => {
                error!("New configuration does not parse: {}", e);
                metrics.record_reload_failure();
                return ReloadOutcome::BuildFailed {
                    reason: e.to_string(),
                };
            }
        };

        if let Compatibility::Incompatible { blocking } = compat::check(
            current.pipeline().definition(),
            &candidate,
            self.reload_policy.as_ref(),
        ) {
            let names: Vec<String> = blocking.iter().map(ToString::to_string).collect();
            warn!(
                blocking = %names.join(", "),
                "Refusing to reload: configuration uses plugins that cannot be reloaded"
            );
            return ReloadOutcome::Incompatible { blocking };
        }

        let pipeline = match self
            .build(id, &candidate_text, current.settings())
            .await
        {
            Ok(pipeline) => Arc::new(pipeline),
            Err(e) => {
                error!("Failed to build new pipeline, keeping the running one: {}", e);
                metrics.record_reload_failure();
                return ReloadOutcome::BuildFailed {
                    reason: e.to_string(),
                };
            }
        };

        if self.is_executing() {
            pipeline.start();
        }

        let previous = match self.registry.swap(
            id,
            candidate_text,
            Arc::clone(current.settings()),
            Arc::clone(&pipeline),
        ) {
            Ok(previous) => previous,
            Err(e) => {
                error!("Failed to install new pipeline: {}", e);
                pipeline.stop().await;
                metrics.record_reload_failure();
                return ReloadOutcome::NotRegistered;
            }
        };

        previous.pipeline().stop().await;
        metrics.record_reload_success();

        let generation = previous.generation() + 1;
        info!(
            generation,
            instance = %pipeline.instance_id(),
            "Pipeline reloaded"
        );
        ReloadOutcome::Reloaded { generation }
    }

    /// Stop the control loop and every pipeline
    ///
    /// Waits for in-flight reloads and for every pipeline to drain. Safe to
    /// call more than once and before [`Agent::execute`].
    pub async fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!(agent = %self.id, "Shutting down agent");
        }

        let ids = self.registry.ids();
        join_all(ids.iter().map(|id| async move {
            let _reload_guard = self.registry.lock_for_reload(id).await;
            if let Some(registration) = self.registry.get(id) {
                registration.pipeline().stop().await;
            }
        }))
        .await;
    }

    // Builders may block, so they run on the blocking pool like fetches
    async fn build(
        &self,
        id: &str,
        config_text: &str,
        settings: &Arc<Settings>,
    ) -> Result<Pipeline, BuildError> {
        let builder = Arc::clone(&self.pipeline_builder);
        let (id, config_text) = (id.to_string(), config_text.to_string());
        let settings = Arc::clone(settings);
        tokio::task::spawn_blocking(move || builder.build(&id, &config_text, &settings))
            .await
            .map_err(|e| BuildError::Task(e.to_string()))?
    }

    async fn fetch(&self, settings: &Arc<Settings>) -> Result<String, FetchError> {
        let source = Arc::clone(&self.source);
        let settings = Arc::clone(settings);
        tokio::task::spawn_blocking(move || source.fetch(&settings))
            .await
            .map_err(|e| FetchError::Task(e.to_string()))?
    }

    pub fn registration(&self, id: &str) -> Option<Arc<Registration>> {
        self.registry.get(id)
    }

    pub fn pipeline(&self, id: &str) -> Option<Arc<Pipeline>> {
        self.registry
            .get(id)
            .map(|registration| Arc::clone(registration.pipeline()))
    }

    pub fn pipeline_ids(&self) -> BTreeSet<String> {
        self.registry.ids()
    }

    pub fn is_pipeline_registered(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    pub fn is_pipeline_running(&self, id: &str) -> bool {
        self.pipeline(id).is_some_and(|p| p.is_running())
    }

    pub fn is_pipeline_ready(&self, id: &str) -> bool {
        self.pipeline(id).is_some_and(|p| p.is_ready())
    }

    /// Ids of every pipeline with live tasks
    pub fn running_pipelines(&self) -> Vec<String> {
        self.registry
            .ids()
            .into_iter()
            .filter(|id| self.is_pipeline_running(id))
            .collect()
    }

    pub fn any_pipeline_running(&self) -> bool {
        !self.running_pipelines().is_empty()
    }

    pub fn pipeline_status(&self, id: &str) -> Option<PipelineStatus> {
        let registration = self.registry.get(id)?;
        let pipeline = registration.pipeline();
        Some(PipelineStatus {
            id: id.to_string(),
            instance_id: pipeline.instance_id(),
            state: pipeline.state(),
            generation: registration.generation(),
            workers: pipeline.workers(),
            batch_size: pipeline.batch_size(),
            created_at: pipeline.created_at(),
            installed_at: registration.installed_at(),
        })
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Time since the process started
    pub fn uptime(&self) -> Duration {
        STARTED_INSTANT.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        *STARTED_AT
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }
}
