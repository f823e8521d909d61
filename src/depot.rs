//! The boundary to the transactional item store.
//!
//! The engine never drives the depot directly; everything below goes through
//! the single worker. Operations are opaque, validated parameter bundles as
//! far as the scheduler is concerned.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Fault, JobError};

/// An operation to run against the depot, one variant per capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DepotRequest {
	Install(InstallParams),
	Remove(RemoveParams),
	Query(QueryParams),
	Verify(VerifyParams),
}

impl DepotRequest {
	/// Reject malformed parameter bundles before a job is ever constructed.
	pub fn validate(&self) -> Result<(), JobError> {
		let item = match self {
			Self::Install(InstallParams { item, .. })
			| Self::Remove(RemoveParams { item })
			| Self::Verify(VerifyParams { item }) => item,
			Self::Query(QueryParams { pattern, .. }) => pattern,
		};

		if item.trim().is_empty() {
			return Err(JobError::InvalidParameters(format!(
				"{} requires a non-empty item specification",
				self.name(),
			)));
		}

		Ok(())
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::Install(_) => "install",
			Self::Remove(_) => "remove",
			Self::Query(_) => "query",
			Self::Verify(_) => "verify",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallParams {
	/// Item specification, e.g. a name with an optional version suffix.
	pub item: String,
	/// Reinstall even if the depot already carries the item.
	#[serde(default)]
	pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveParams {
	pub item: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
	pub pattern: String,
	#[serde(default)]
	pub installed_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyParams {
	pub item: String,
}

/// How a single depot operation ended, short of a [`Fault`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
	Completed(serde_json::Value),
	/// The depot terminated the transaction mid-operation.
	Terminated,
}

/// Costly-to-gather depot metadata, cached by the worker between jobs.
///
/// The cache is only trusted while the depot's on-disk configuration is
/// unchanged; the worker samples [`Depot::config_paths`] modification times
/// before every use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepotSnapshot {
	pub taken_at: DateTime<Utc>,
	/// Catalog summary used to answer queries without a full depot walk.
	pub catalog: serde_json::Value,
}

/// A live connection to the depot. Exactly one exists per worker, and the
/// worker drives it strictly sequentially.
#[async_trait]
pub trait Depot: Send {
	/// Take the depot-wide exclusive transaction lock.
	async fn lock(&mut self) -> Result<(), Fault>;

	/// Release the transaction lock.
	async fn unlock(&mut self) -> Result<(), Fault>;

	/// Configuration files whose modification times invalidate a cached
	/// [`DepotSnapshot`].
	fn config_paths(&self) -> Vec<PathBuf>;

	/// Gather a fresh metadata snapshot.
	async fn snapshot(&mut self) -> Result<DepotSnapshot, Fault>;

	async fn install(&mut self, params: &InstallParams) -> Result<OpOutcome, Fault>;

	async fn remove(&mut self, params: &RemoveParams) -> Result<OpOutcome, Fault>;

	async fn query(
		&mut self,
		params: &QueryParams,
		snapshot: &DepotSnapshot,
	) -> Result<OpOutcome, Fault>;

	async fn verify(&mut self, params: &VerifyParams) -> Result<OpOutcome, Fault>;
}

/// Factory for depot connections.
///
/// The session manager holds one of these so every freshly spawned worker,
/// including a resurrected one, can open its own connection lazily on first
/// use.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
	async fn connect(&self) -> Result<Box<dyn Depot>, Fault>;
}
