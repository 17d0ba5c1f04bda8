//! # doctune CLI
//!
//! The `doctune` binary drives every pipeline stage locally and starts the
//! HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! doctune --config ./config/doctune.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `doctune init` | Create the artifact store directories |
//! | `doctune download <repo>` | Download a base model from the hub |
//! | `doctune process <file> --model <m>` | Extract a training set from a document |
//! | `doctune train <m>` | Train a LoRA adapter on the model's training set |
//! | `doctune merge <m>` | Fold the latest adapter into the base model |
//! | `doctune prompt <m> "<message>"` | Generate from the latest merged model |
//! | `doctune models` | List models with a merged version |
//! | `doctune serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! doctune download TinyLlama/TinyLlama-1.1B-Chat-v1.0
//! doctune process ./handbook.pdf --model TinyLlama/TinyLlama-1.1B-Chat-v1.0
//! doctune train TinyLlama/TinyLlama-1.1B-Chat-v1.0 --epochs 3
//! doctune merge TinyLlama/TinyLlama-1.1B-Chat-v1.0
//! doctune prompt TinyLlama/TinyLlama-1.1B-Chat-v1.0 "What is the refund policy?"
//! ```

use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};

use doctune::config;
use doctune::pipeline::{Collaborators, Pipeline};
use doctune::progress::ProgressMode;
use doctune::server;

/// doctune: turn a document into a fine-tuned, merged language model.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/doctune.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "doctune",
    about = "doctune: ingest a document, extract QA pairs, LoRA fine-tune, merge, and prompt",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/doctune.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the artifact store directories.
    ///
    /// Idempotent; existing artifacts are left untouched.
    Init,

    /// Download a base model from the hub into the store.
    ///
    /// Skipped when the model is already present. Set `HF_TOKEN` for gated
    /// repositories.
    Download {
        /// Hub repository id, e.g. `org/model`.
        repo_id: String,
    },

    /// Ingest a document and write the model's training set.
    Process {
        /// Document to ingest (.pdf, .docx, .pptx, .xlsx, .txt, .md).
        file: PathBuf,

        /// Model name the training set belongs to.
        #[arg(long)]
        model: String,

        /// Progress output on stderr: `off`, `human`, or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Train a LoRA adapter on the model's training set.
    ///
    /// Flags override the `[training.defaults]` values from the config.
    Train {
        model: String,
        #[arg(long)]
        epochs: Option<u32>,
        #[arg(long)]
        learning_rate: Option<f64>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        gradient_accumulation: Option<usize>,
        #[arg(long)]
        max_length: Option<usize>,
        #[arg(long)]
        lora_r: Option<usize>,
        #[arg(long)]
        lora_alpha: Option<usize>,
        #[arg(long)]
        lora_dropout: Option<f64>,
    },

    /// Merge the latest adapter into the base model weights.
    Merge { model: String },

    /// Generate a completion from the latest merged model.
    Prompt {
        model: String,
        message: String,
        #[arg(long)]
        max_new_tokens: Option<usize>,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        top_p: Option<f64>,
    },

    /// List models that have a merged version.
    Models,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("doctune=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Serve = cli.command {
        return server::run_server(&cfg).await;
    }

    let collaborators = Collaborators::from_config(&cfg)?;
    let pipeline = Pipeline::new(cfg, collaborators);

    match cli.command {
        Commands::Init => {
            pipeline.store().init()?;
            println!(
                "Store initialized at {}",
                pipeline.store().root().display()
            );
        }
        Commands::Download { repo_id } => {
            pipeline.store().init()?;
            let model = pipeline.download_model(&repo_id).await?;
            println!("Model {} ready at {}", model.repo_id, model.path.display());
        }
        Commands::Process {
            file,
            model,
            progress,
        } => {
            let mode = match progress {
                Some(s) => ProgressMode::parse(&s).ok_or_else(|| {
                    anyhow::anyhow!("invalid --progress '{}': expected off, human or json", s)
                })?,
                None => ProgressMode::default_for_tty(),
            };
            pipeline.store().init()?;
            let filename = file_name(&file)?;
            let chunks = FileChunks::open(&file, pipeline.config().ingest.chunk_size)?;
            let reporter = mode.reporter();
            let summary = pipeline
                .process_document(&model, &filename, tokio_stream::iter(chunks), reporter.as_ref())
                .await?;
            println!(
                "Wrote {} training records to {}",
                summary.records,
                summary.training_file.display()
            );
        }
        Commands::Train {
            model,
            epochs,
            learning_rate,
            batch_size,
            gradient_accumulation,
            max_length,
            lora_r,
            lora_alpha,
            lora_dropout,
        } => {
            let mut overrides = serde_json::Map::new();
            let mut set = |key: &str, value: Option<serde_json::Value>| {
                if let Some(v) = value {
                    overrides.insert(key.to_string(), v);
                }
            };
            set("epochs", epochs.map(Into::into));
            set("learning_rate", learning_rate.map(Into::into));
            set("batch_size", batch_size.map(Into::into));
            set("gradient_accumulation", gradient_accumulation.map(Into::into));
            set("max_length", max_length.map(Into::into));
            set("lora_r", lora_r.map(Into::into));
            set("lora_alpha", lora_alpha.map(Into::into));
            set("lora_dropout", lora_dropout.map(Into::into));

            let params = pipeline.training_params(&overrides)?;
            let outcome = pipeline.train(&model, params).await?;
            println!(
                "Adapter {} saved to {} ({} optimizer steps, final loss {})",
                outcome.adapter.version,
                outcome.adapter.path.display(),
                outcome.info.optimizer_steps,
                outcome
                    .info
                    .final_loss
                    .map(|l| format!("{:.4}", l))
                    .unwrap_or_else(|| "n/a".to_string())
            );
        }
        Commands::Merge { model } => {
            let outcome = pipeline.merge(&model).await?;
            println!(
                "Merged model {} saved to {} ({} layers merged, {} parameters)",
                outcome.merged.version,
                outcome.merged.path.display(),
                outcome.info.layers_merged,
                outcome.info.parameters
            );
        }
        Commands::Prompt {
            model,
            message,
            max_new_tokens,
            temperature,
            top_p,
        } => {
            let params = pipeline.sampling_params(max_new_tokens, temperature, top_p);
            let response = pipeline.prompt(&model, &message, params).await?;
            println!("{}", response);
        }
        Commands::Models => {
            let models = pipeline.list_merged_models()?;
            if models.is_empty() {
                println!("No merged models.");
            }
            for name in models {
                println!("{}", name);
            }
        }
        Commands::Serve => {}
    }

    Ok(())
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))
}

/// Reads a local file as a sequence of fixed-size chunks.
struct FileChunks {
    file: std::fs::File,
    chunk_size: usize,
    done: bool,
}

impl FileChunks {
    fn open(path: &Path, chunk_size: usize) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("cannot open {}: {}", path.display(), e))?;
        Ok(Self {
            file,
            chunk_size: chunk_size.max(1),
            done: false,
        })
    }
}

impl Iterator for FileChunks {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = Vec::with_capacity(self.chunk_size);
        match (&mut self.file)
            .take(self.chunk_size as u64)
            .read_to_end(&mut buf)
        {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => Some(Ok(buf)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
