//! # doctune
//!
//! A document-to-adapter pipeline: upload a document, extract
//! question/answer training pairs from it, fine-tune a LoRA adapter on a
//! base language model, fold the adapter into the base weights, and serve
//! completions from the merged model.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌──────────┐   ┌───────┐   ┌───────────┐
//! │ Ingestion │──▶│ Extraction │──▶│ Training │──▶│ Merge │──▶│ Inference │
//! └───────────┘   └────────────┘   └──────────┘   └───────┘   └───────────┘
//!       │               │                │             │             │
//!       ▼               ▼                ▼             ▼             ▼
//!   uploads/      training/{m}.jsonl  adapters/{m}  merged/{m}   ModelCache
//!                                     (versioned)   (versioned)
//! ```
//!
//! Stages hand off through the filesystem [`store`]. Model execution
//! (generation, the training step) lives behind the [`traits`] seams; the
//! built-in implementations drive an external worker process
//! ([`worker`]). Adapter merging is pure safetensors arithmetic in Rust
//! ([`merge`]).
//!
//! ## Quick Start
//!
//! ```bash
//! doctune init
//! doctune download org/model
//! doctune process ./handbook.pdf --model org/model
//! doctune train org/model
//! doctune merge org/model
//! doctune prompt org/model "What does the handbook say about leave?"
//! doctune serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Stage error taxonomy |
//! | [`models`] | Core data types |
//! | [`store`] | Filesystem artifact store |
//! | [`locks`] | Per-model run locks |
//! | [`progress`] | Progress events and reporters |
//! | [`extract`] | PDF/OOXML/text page extraction |
//! | [`chunk`] | Sentence splitting |
//! | [`ingest`] | Upload intake and page extraction |
//! | [`qa`] | Question/answer pair sources |
//! | [`extraction`] | Training set extraction |
//! | [`tokenize`] | Tokenization and batching |
//! | [`train`] | LoRA training stage |
//! | [`merge`] | Adapter merge stage |
//! | [`infer`] | Inference stage and model cache |
//! | [`hub`] | Base model download |
//! | [`worker`] | External compute worker |
//! | [`jobs`] | Background job registry |
//! | [`pipeline`] | Stage orchestration |
//! | [`server`] | HTTP server |
//! | [`traits`] | Collaborator traits |

pub mod chunk;
pub mod config;
pub mod error;
pub mod extract;
pub mod extraction;
pub mod hub;
pub mod infer;
pub mod ingest;
pub mod jobs;
pub mod locks;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod qa;
pub mod server;
pub mod store;
pub mod tokenize;
pub mod train;
pub mod traits;
pub mod worker;
