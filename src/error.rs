use serde::{Deserialize, Serialize};

use thiserror::Error;

use super::job::{JobId, JobState};

/// Classified kind of a [`Fault`].
///
/// The first group mirrors what the depot itself reports; `WorkerLost` is
/// assigned by the engine when the worker died and the resurrection budget
/// ran out.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
	NotFound,
	AlreadyExists,
	AccessDenied,
	InvalidRequest,
	TransactionFailure,
	Io,
	Internal,
	WorkerLost,
}

/// A structured error value that crosses the worker boundary as plain data.
///
/// The receiving side never tries to reconstruct the original error object;
/// it builds a local error of the corresponding [`FaultKind`] from the
/// carried message and optional trace text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct Fault {
	pub kind: FaultKind,
	pub message: String,
	pub trace: Option<String>,
}

impl Fault {
	pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			trace: None,
		}
	}

	pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
		self.trace = Some(trace.into());
		self
	}

	pub(crate) fn worker_lost(resurrections: u32) -> Self {
		Self::new(
			FaultKind::WorkerLost,
			format!("worker died and was not recovered after {resurrections} resurrection(s)"),
		)
	}
}

/// The error surfaced to callers of the engine facade.
#[derive(Debug, Error)]
pub enum JobError {
	/// Malformed or missing job parameters, rejected before the job ever
	/// reaches the queue.
	#[error("invalid job parameters: {0}")]
	InvalidParameters(String),

	#[error("job not found <id='{0}'>")]
	NotFound(JobId),

	/// An operation was requested against a job in an incompatible state.
	#[error("can not {operation} job <id='{id}'> in state {state}")]
	InvalidState {
		id: JobId,
		state: JobState,
		operation: &'static str,
	},

	/// The depot reported a classified failure, or the worker was lost.
	#[error(transparent)]
	Fault(#[from] Fault),

	/// The depot terminated the transaction for this job.
	#[error("depot terminated the transaction for job <id='{0}'>")]
	Terminated(JobId),

	#[error("engine is shutting down")]
	Terminating,
}

impl JobError {
	pub(crate) fn invalid_state(id: JobId, state: JobState, operation: &'static str) -> Self {
		Self::InvalidState {
			id,
			state,
			operation,
		}
	}
}
