//!
//! # Depot Job System
//!
//! A job execution engine for the depot, a transactional item store that may
//! only be driven from one worker at a time. Many independent caller tasks
//! submit operations; the engine serializes them through a single worker
//! holding the sole depot connection, while supporting both blocking
//! request/reply calls and long-running, pollable background jobs with
//! termination, rescheduling and deletion.
//!
//! Bring your own [`Depot`] implementation behind a [`Connect`] factory and
//! the engine handles priority scheduling, session-scoped exclusive locking,
//! lifecycle notifications, and automatic resurrection of a crashed worker
//! without losing the in-flight job.
//!
//! ## Basic example
//!
//! ```
//! use depot_job_system::{
//!     Connect, Depot, DepotSnapshot, Engine, EngineConfig, Fault, InstallParams, OpOutcome,
//!     QueryParams, RemoveParams, VerifyParams,
//! };
//! use async_trait::async_trait;
//! use std::{path::PathBuf, sync::Arc};
//!
//! struct MemoryDepot;
//!
//! #[async_trait]
//! impl Depot for MemoryDepot {
//!     async fn lock(&mut self) -> Result<(), Fault> {
//!         Ok(())
//!     }
//!
//!     async fn unlock(&mut self) -> Result<(), Fault> {
//!         Ok(())
//!     }
//!
//!     fn config_paths(&self) -> Vec<PathBuf> {
//!         Vec::new()
//!     }
//!
//!     async fn snapshot(&mut self) -> Result<DepotSnapshot, Fault> {
//!         Ok(DepotSnapshot {
//!             taken_at: chrono::Utc::now(),
//!             catalog: serde_json::Value::Null,
//!         })
//!     }
//!
//!     async fn install(&mut self, params: &InstallParams) -> Result<OpOutcome, Fault> {
//!         Ok(OpOutcome::Completed(
//!             serde_json::json!({ "installed": params.item }),
//!         ))
//!     }
//!
//!     async fn remove(&mut self, _: &RemoveParams) -> Result<OpOutcome, Fault> {
//!         Ok(OpOutcome::Completed(serde_json::Value::Null))
//!     }
//!
//!     async fn query(
//!         &mut self,
//!         _: &QueryParams,
//!         snapshot: &DepotSnapshot,
//!     ) -> Result<OpOutcome, Fault> {
//!         Ok(OpOutcome::Completed(snapshot.catalog.clone()))
//!     }
//!
//!     async fn verify(&mut self, _: &VerifyParams) -> Result<OpOutcome, Fault> {
//!         Ok(OpOutcome::Completed(serde_json::Value::Bool(true)))
//!     }
//! }
//!
//! struct MemoryConnector;
//!
//! #[async_trait]
//! impl Connect for MemoryConnector {
//!     async fn connect(&self) -> Result<Box<dyn Depot>, Fault> {
//!         Ok(Box::new(MemoryDepot))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::new(EngineConfig::default(), Arc::new(MemoryConnector));
//!
//!     let value = engine
//!         .install(InstallParams {
//!             item: "acme-tools".into(),
//!             force: false,
//!         })
//!         .await
//!         .expect("install failed");
//!     assert_eq!(value["installed"], "acme-tools");
//!
//!     engine.shutdown().await;
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod calendar;
mod config;
mod depot;
mod engine;
mod error;
mod event;
mod job;
mod manager;
mod message;
mod queue;
mod registry;
mod session;
mod worker;

pub use config::EngineConfig;
pub use depot::{
	Connect, Depot, DepotRequest, DepotSnapshot, InstallParams, OpOutcome, QueryParams,
	RemoveParams, VerifyParams,
};
pub use engine::{Engine, Session};
pub use error::{Fault, FaultKind, JobError};
pub use event::{EventBus, JobEvent};
pub use job::{
	BackgroundOptions, JobId, JobMetadata, JobOutcome, JobSnapshot, JobState, MetadataPatch,
	Priority,
};
pub use message::{ReplyOutcome, WorkerOp, WorkerReply, WorkerRequest};
