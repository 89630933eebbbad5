//! Subtitle Worker Library
//!
//! Orchestrates finished downloads through a folder-staged subtitle pipeline:
//! classify, stage, transcribe, translate, file away.
//!
//! ## Module Overview
//!
//! - `job`: Job models and state machine
//! - `queue`: Sequential retrying queue for heavy jobs
//! - `dispatcher`: Admission, light-job runner and retry interface
//! - `classifier`: Light/heavy decision from a file name
//! - `pipeline`: Step sequencer for one job attempt
//! - `stage`: Stage folders and file moves
//! - `harness`: External tool execution with output capture
//! - `tools`: Transcription and translation front-ends
//! - `rate_limit`: Token bucket for the translation API
//! - `notify`: Operator notifications
//! - `config`: Environment configuration
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use subtitle_worker::{
//!     config::Config,
//!     dispatcher::Dispatcher,
//!     harness::Harness,
//!     notify::LogNotifier,
//!     pipeline::SubtitlePipeline,
//!     queue::JobQueue,
//!     tools::{Transcriber, Translator},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env();
//!     let folders = config.folders();
//!     folders.ensure_all().await?;
//!
//!     let harness = Harness::new(&config.harness);
//!     let interpreter = config.harness.interpreter.clone();
//!     let pipeline = Arc::new(SubtitlePipeline::new(
//!         folders,
//!         Arc::new(Transcriber::new(
//!             harness.clone(),
//!             interpreter.clone(),
//!             config.whisper.clone(),
//!             config.translate.clone(),
//!         )),
//!         Arc::new(Translator::new(harness, interpreter, config.translate.clone())),
//!         Arc::new(LogNotifier),
//!     ));
//!
//!     let queue = JobQueue::new(pipeline.clone(), config.queue.clone());
//!     queue.start();
//!
//!     let dispatcher = Dispatcher::new(queue.clone(), pipeline);
//!     dispatcher
//!         .submit("/downloads/SONE-269.mp4".as_ref(), "", "")
//!         .await?;
//!
//!     queue.stop().await;
//!     Ok(())
//! }
//! ```

pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod harness;
pub mod job;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod rate_limit;
pub mod stage;
pub mod telemetry;
pub mod tools;
