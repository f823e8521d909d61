use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::{
	depot::DepotRequest,
	error::{Fault, JobError},
	job::{Job, JobId, JobReturn},
};

/// One message on the uplink channel. Self-contained: it carries the job
/// payload and the originating job id so the reply can be correlated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
	pub job_id: JobId,
	pub op: WorkerOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum WorkerOp {
	Execute(DepotRequest),
	/// Take the depot lock on behalf of a session (0→1 boundary).
	Lock,
	/// Release the depot lock (1→0 boundary).
	Unlock,
	/// Ack, then exit the worker loop.
	Shutdown,
}

/// One message on the downlink channel; exactly one is sent per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
	pub job_id: JobId,
	pub outcome: ReplyOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ReplyOutcome {
	Done(serde_json::Value),
	/// Backend-reported termination marker.
	Terminated,
	Fault(Fault),
}

/// What a foreground submitter's oneshot waiter eventually receives.
pub(crate) type Waiter = oneshot::Sender<Result<JobReturn, JobError>>;

/// The scheduler loop's mailbox.
#[derive(Debug)]
pub(crate) enum SchedulerMessage {
	Submit {
		job: Job,
		waiter: Option<Waiter>,
	},
	/// The session manager finished (or gave up on) the in-flight job.
	SessionDone {
		job_id: JobId,
		outcome: Result<ReplyOutcome, Fault>,
	},
	Shutdown(oneshot::Sender<()>),
}
