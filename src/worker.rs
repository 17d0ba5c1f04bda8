//! External compute worker.
//!
//! Model execution and the LoRA training loop run in a separate process
//! (typically a Python script with an ML framework). The pipeline drives it
//! over a line-oriented JSON protocol on stdin/stdout: one request object
//! per line, one response object per line.
//!
//! ```text
//! → {"op":"load","model_dir":"/data/merged/m/2024..."}
//! ← {"ok":true}
//! → {"op":"generate","input_ids":[..],"max_new_tokens":200,"temperature":0.8,"top_p":0.9,"eos_token_id":2}
//! ← {"ok":true,"output_ids":[..]}
//! → {"op":"train_start","spec":{..}}
//! → {"op":"forward_backward","batch":{"input_ids":[[..]],"attention_mask":[[..]],"labels":[[..]]}}
//! ← {"ok":true,"loss":1.93}
//! → {"op":"optimizer_step","learning_rate":0.0002}
//! → {"op":"save_adapter","dir":"/data/adapters/m/.staging-..."}
//! ← {"ok":false,"error":"CUDA out of memory"}
//! ```
//!
//! The worker's stderr is inherited so its logs reach the operator.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

use crate::config::WorkerConfig;
use crate::models::SamplingParams;
use crate::tokenize::Batch;
use crate::traits::{LanguageModel, ModelLoader, TrainingBackend, TrainingSession, TrainingSpec};

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WorkerRequest<'a> {
    Load {
        model_dir: &'a Path,
    },
    Generate {
        input_ids: &'a [u32],
        max_new_tokens: usize,
        temperature: f64,
        top_p: f64,
        eos_token_id: Option<u32>,
    },
    TrainStart {
        spec: &'a TrainingSpec,
    },
    ForwardBackward {
        batch: &'a Batch,
    },
    OptimizerStep {
        learning_rate: f64,
    },
    SaveAdapter {
        dir: &'a Path,
    },
}

#[derive(Deserialize)]
struct WorkerResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    output_ids: Option<Vec<u32>>,
    #[serde(default)]
    loss: Option<f32>,
}

/// A running worker process.
pub struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    pub fn spawn(config: &WorkerConfig) -> Result<Self> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to start worker: {}", config.program.display()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdout unavailable"))?;
        tracing::debug!(program = %config.program.display(), pid = child.id(), "worker started");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn call(&mut self, request: &WorkerRequest<'_>) -> Result<WorkerResponse> {
        let line = serde_json::to_string(request)?;
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.write_all(b"\n"))
            .and_then(|_| self.stdin.flush())
            .context("worker stdin closed")?;

        let mut reply = String::new();
        let n = self.stdout.read_line(&mut reply)?;
        if n == 0 {
            bail!("worker exited without a response");
        }
        let response: WorkerResponse = serde_json::from_str(reply.trim())
            .with_context(|| format!("malformed worker response: {}", reply.trim()))?;
        if !response.ok {
            bail!(
                "worker error: {}",
                response.error.as_deref().unwrap_or("unspecified")
            );
        }
        Ok(response)
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ============ Language model ============

/// Loads models into a fresh worker process per model.
pub struct WorkerModelLoader {
    config: WorkerConfig,
}

impl WorkerModelLoader {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

impl ModelLoader for WorkerModelLoader {
    fn load(&self, model_dir: &Path) -> Result<Arc<dyn LanguageModel>> {
        let mut process = WorkerProcess::spawn(&self.config)?;
        process
            .call(&WorkerRequest::Load { model_dir })
            .with_context(|| format!("loading {}", model_dir.display()))?;
        Ok(Arc::new(WorkerModel {
            process: Mutex::new(process),
        }))
    }
}

struct WorkerModel {
    process: Mutex<WorkerProcess>,
}

impl LanguageModel for WorkerModel {
    fn generate(
        &self,
        input_ids: &[u32],
        params: &SamplingParams,
        eos_token_id: Option<u32>,
    ) -> Result<Vec<u32>> {
        let mut process = self
            .process
            .lock()
            .map_err(|_| anyhow::anyhow!("worker lock poisoned"))?;
        let response = process.call(&WorkerRequest::Generate {
            input_ids,
            max_new_tokens: params.max_new_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            eos_token_id,
        })?;
        response
            .output_ids
            .ok_or_else(|| anyhow::anyhow!("worker response missing output_ids"))
    }
}

// ============ Training ============

pub struct WorkerTrainer {
    config: WorkerConfig,
}

impl WorkerTrainer {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

impl TrainingBackend for WorkerTrainer {
    fn start(&self, spec: &TrainingSpec) -> Result<Box<dyn TrainingSession>> {
        let mut process = WorkerProcess::spawn(&self.config)?;
        process.call(&WorkerRequest::TrainStart { spec })?;
        Ok(Box::new(WorkerSession { process }))
    }
}

struct WorkerSession {
    process: WorkerProcess,
}

impl TrainingSession for WorkerSession {
    fn forward_backward(&mut self, batch: &Batch) -> Result<f32> {
        let response = self.process.call(&WorkerRequest::ForwardBackward { batch })?;
        response
            .loss
            .ok_or_else(|| anyhow::anyhow!("worker response missing loss"))
    }

    fn optimizer_step(&mut self, learning_rate: f64) -> Result<()> {
        self.process
            .call(&WorkerRequest::OptimizerStep { learning_rate })?;
        Ok(())
    }

    fn save_adapter(&mut self, dir: &Path) -> Result<()> {
        self.process.call(&WorkerRequest::SaveAdapter { dir })?;
        Ok(())
    }
}
