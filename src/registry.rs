//! Pipeline registry
//!
//! Maps a pipeline id to its live registration. A registration is immutable;
//! replacing a pipeline swaps the whole `Arc<Registration>` in one write, so a
//! reader sees either the old text and instance or the new ones, never a mix.
//!
//! Each id also owns a reload lock. Whoever holds it is the only party allowed
//! to replace that id's registration or stop its pipeline.

use crate::config::Settings;
use crate::error::AgentError;
use crate::pipeline::Pipeline;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// The live pipeline of an id and what it was built from
#[derive(Debug)]
pub struct Registration {
    id: String,
    config_text: String,
    settings: Arc<Settings>,
    pipeline: Arc<Pipeline>,
    generation: u64,
    installed_at: DateTime<Utc>,
}

impl Registration {
    pub fn new(
        id: impl Into<String>,
        config_text: impl Into<String>,
        settings: Arc<Settings>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            id: id.into(),
            config_text: config_text.into(),
            settings,
            pipeline,
            generation: 1,
            installed_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exact text the live pipeline was built from
    pub fn config_text(&self) -> &str {
        &self.config_text
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// 1 for the initial pipeline, incremented by every successful swap
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn installed_at(&self) -> DateTime<Utc> {
        self.installed_at
    }
}

struct Slot {
    current: RwLock<Arc<Registration>>,
    reload_lock: Arc<Mutex<()>>,
}

#[derive(Default)]
pub struct PipelineRegistry {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration under its id
    ///
    /// Fails with [`AgentError::AlreadyRegistered`] and leaves the existing
    /// registration untouched if the id is taken.
    pub fn insert(&self, registration: Registration) -> Result<Arc<Registration>, AgentError> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(registration.id()) {
            return Err(AgentError::AlreadyRegistered(registration.id().to_string()));
        }

        let registration = Arc::new(registration);
        slots.insert(
            registration.id().to_string(),
            Arc::new(Slot {
                current: RwLock::new(Arc::clone(&registration)),
                reload_lock: Arc::new(Mutex::new(())),
            }),
        );
        Ok(registration)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Registration>> {
        let slot = self.slot(id)?;
        let current = slot.current.read().unwrap_or_else(PoisonError::into_inner);
        Some(Arc::clone(&current))
    }

    /// Replace the text, settings and pipeline of `id` in one step
    ///
    /// Returns the previous registration, whose pipeline the caller stops.
    /// The caller must hold the id's reload lock.
    pub fn swap(
        &self,
        id: &str,
        config_text: impl Into<String>,
        settings: Arc<Settings>,
        pipeline: Arc<Pipeline>,
    ) -> Result<Arc<Registration>, AgentError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| AgentError::UnknownPipeline(id.to_string()))?;

        let mut current = slot.current.write().unwrap_or_else(PoisonError::into_inner);
        let replacement = Arc::new(Registration {
            id: id.to_string(),
            config_text: config_text.into(),
            settings,
            pipeline,
            generation: current.generation + 1,
            installed_at: Utc::now(),
        });
        Ok(std::mem::replace(&mut *current, replacement))
    }

    /// Every registered id, sorted
    pub fn ids(&self) -> BTreeSet<String> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slot(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the reload lock of `id`; `None` if the id is not registered
    pub async fn lock_for_reload(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = Arc::clone(&self.slot(id)?.reload_lock);
        Some(lock.lock_owned().await)
    }

    fn slot(&self, id: &str) -> Option<Arc<Slot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}
