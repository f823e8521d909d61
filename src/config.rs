//! Engine configuration.

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{Fault, FaultKind};

/// Tunables for the engine, persistable as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
	/// Config schema version.
	pub version: u32,

	/// How long the session manager waits on the downlink before checking
	/// whether the worker is still alive. A slow worker is waited on again;
	/// only a dead one triggers resurrection.
	pub reply_timeout: Duration,

	/// How many times a dead worker is resurrected for a single in-flight
	/// job before the job fails with a worker-lost fault.
	pub max_resurrections: u32,

	/// Default registry retention for finished background jobs that asked
	/// for deletion on completion.
	pub removal_delay: Duration,

	/// Capacity of the lifecycle event bus.
	pub event_capacity: usize,

	/// Capacity of the scheduler mailbox and the worker up/downlink.
	pub channel_capacity: usize,
}

impl EngineConfig {
	const VERSION: u32 = 1;

	/// Load a config file, falling back to defaults when it is absent.
	pub fn load_from(path: &Path) -> Result<Self, Fault> {
		if !path.exists() {
			warn!(?path, "No engine config found, using defaults");
			return Ok(Self::default());
		}

		info!(?path, "Loading engine config");
		let json = fs::read_to_string(path)
			.map_err(|e| Fault::new(FaultKind::Io, format!("reading {path:?}: {e}")))?;

		serde_json::from_str(&json)
			.map_err(|e| Fault::new(FaultKind::InvalidRequest, format!("parsing {path:?}: {e}")))
	}

	pub fn save(&self, path: &Path) -> Result<(), Fault> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.map_err(|e| Fault::new(FaultKind::Io, format!("creating {parent:?}: {e}")))?;
		}

		let json = serde_json::to_string_pretty(self)
			.map_err(|e| Fault::new(FaultKind::Internal, e.to_string()))?;

		fs::write(path, json)
			.map_err(|e| Fault::new(FaultKind::Io, format!("writing {path:?}: {e}")))?;
		info!(?path, "Saved engine config");

		Ok(())
	}
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			version: Self::VERSION,
			reply_timeout: Duration::from_secs(10),
			max_resurrections: 1,
			removal_delay: Duration::from_secs(300),
			event_capacity: 1024,
			channel_capacity: 8,
		}
	}
}
