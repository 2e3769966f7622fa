//! Shared helpers for the integration tests
#![allow(dead_code)]

use sluice::config::Settings;
use sluice::error::{BuildError, FetchError};
use sluice::metrics::MetricsCollector;
use sluice::pipeline::event::Event;
use sluice::pipeline::{DefaultPipelineBuilder, Pipeline, PipelineBuilder};
use sluice::plugins::{Output, PluginArgs, PluginRegistry};
use sluice::source::ConfigSource;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Output that counts the events written to it
pub struct CountingOutput {
    count: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl Output for CountingOutput {
    async fn write(&mut self, _event: &Event) -> anyhow::Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Register a counting output under `name` and return its shared counter
pub fn register_counter(registry: &mut PluginRegistry, name: &str) -> Arc<AtomicU64> {
    let count = Arc::new(AtomicU64::new(0));
    let shared = Arc::clone(&count);
    registry.register_output(name, "Count events", true, move |_args: &PluginArgs| {
        Ok(Box::new(CountingOutput {
            count: Arc::clone(&shared),
        }) as Box<dyn Output>)
    });
    count
}

/// Builder that counts builds and fails any text containing `FAIL_BUILD`
pub struct CountingBuilder {
    inner: DefaultPipelineBuilder,
    builds: AtomicUsize,
    delay: Duration,
}

impl CountingBuilder {
    pub fn new(plugins: Arc<PluginRegistry>, metrics: Arc<MetricsCollector>) -> Self {
        Self::with_delay(plugins, metrics, Duration::ZERO)
    }

    /// Sleep for `delay` inside every build, to widen race windows
    pub fn with_delay(
        plugins: Arc<PluginRegistry>,
        metrics: Arc<MetricsCollector>,
        delay: Duration,
    ) -> Self {
        Self {
            inner: DefaultPipelineBuilder::new(plugins, metrics),
            builds: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl PipelineBuilder for CountingBuilder {
    fn build(&self, id: &str, config_text: &str, settings: &Settings) -> Result<Pipeline, BuildError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if config_text.contains("FAIL_BUILD") {
            return Err(BuildError::Plugin {
                kind: sluice::plugins::PluginKind::Output,
                name: "dummyoutput".to_string(),
                source: anyhow::anyhow!("refusing to build"),
            });
        }
        self.inner.build(id, config_text, settings)
    }
}

/// Configuration source whose text is set by the test
pub struct StaticSource {
    text: Mutex<Result<String, String>>,
}

impl StaticSource {
    pub fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: Mutex::new(Ok(text.to_string())),
        })
    }

    pub fn set(&self, text: &str) {
        *self.text.lock().unwrap() = Ok(text.to_string());
    }

    /// Make every following fetch fail
    pub fn fail(&self, reason: &str) {
        *self.text.lock().unwrap() = Err(reason.to_string());
    }
}

impl ConfigSource for StaticSource {
    fn fetch(&self, _settings: &Settings) -> Result<String, FetchError> {
        match &*self.text.lock().unwrap() {
            Ok(text) => Ok(text.clone()),
            Err(reason) => Err(FetchError::Task(reason.clone())),
        }
    }
}

/// Settings small enough for fast tests
pub fn test_settings() -> Settings {
    Settings::default().with_workers(2).with_batch_size(16)
}

/// Poll `condition` every 10ms until it holds, panicking after `timeout`
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
