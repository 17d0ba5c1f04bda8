//! Advisory per-model-name locks.
//!
//! Download, extraction, training and merge runs for one model name are
//! mutually exclusive. A second run does not wait; it fails with
//! [`PipelineError::Busy`]. The lock is held by a [`ModelLockGuard`] and
//! released when the guard drops, whether the run succeeded or not.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Default)]
pub struct ModelLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl ModelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, model_name: &str) -> Result<ModelLockGuard> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(model_name.to_string()) {
            return Err(PipelineError::Busy(model_name.to_string()));
        }
        Ok(ModelLockGuard {
            locks: self.held.clone(),
            model_name: model_name.to_string(),
        })
    }

    pub fn is_locked(&self, model_name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(model_name)
    }
}

#[derive(Debug)]
pub struct ModelLockGuard {
    locks: Arc<Mutex<HashSet<String>>>,
    model_name: String,
}

impl ModelLockGuard {
    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

impl Drop for ModelLockGuard {
    fn drop(&mut self) {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.model_name);
    }
}
