use std::{
	fmt,
	sync::atomic::{AtomicU64, Ordering},
	time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
	depot::DepotRequest,
	error::{Fault, JobError},
};

/// Jobs are numbered from a single process-wide counter so an id is never
/// reused, even across engine instances living in the same process.
static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for a job, strictly increasing in construction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct JobId(u64);

impl JobId {
	pub(crate) fn next() -> Self {
		Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for JobId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Scheduling priority; a lower value is scheduled earlier, ties are broken
/// by job id, which follows creation order.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub i32);

impl Priority {
	pub const HIGH: Self = Self(-1);
	pub const NORMAL: Self = Self(0);
	pub const LOW: Self = Self(1);
}

impl Default for Priority {
	fn default() -> Self {
		Self::NORMAL
	}
}

/// Lifecycle state of a job.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
	New,
	Running,
	Completed,
	Terminated,
	Exception,
}

impl JobState {
	pub fn is_finished(self) -> bool {
		matches!(self, Self::Completed | Self::Terminated | Self::Exception)
	}

	fn can_become(self, next: Self) -> bool {
		matches!(
			(self, next),
			(Self::New, Self::Running | Self::Terminated)
				| (
					Self::Running,
					Self::Completed | Self::Terminated | Self::Exception
				)
		)
	}
}

/// Final outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "payload", rename_all = "snake_case")]
pub enum JobOutcome {
	/// The depot operation (or control handler) produced a value.
	Success(serde_json::Value),
	/// The depot reported that the transaction was terminated.
	Terminated,
	/// Classified failure, either depot-reported or infrastructure.
	Failed(Fault),
}

/// Free-form-looking but strictly-typed descriptive fields attached to a
/// background job, used to regenerate user-visible descriptions and output
/// without re-querying the depot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
	/// Metadata schema version.
	#[serde(default = "JobMetadata::version")]
	pub version: u32,
	/// Display name; also the lookup key for get-by-name.
	pub name: Option<String>,
	/// Identifier of the originating facade method.
	pub method: Option<String>,
	/// Serialized input parameters of the originating call.
	pub inputs: Option<serde_json::Value>,
}

impl JobMetadata {
	const fn version() -> u32 {
		1
	}
}

impl Default for JobMetadata {
	fn default() -> Self {
		Self {
			version: Self::version(),
			name: None,
			method: None,
			inputs: None,
		}
	}
}

/// A partial update for [`JobMetadata`]. Unknown keys are rejected at the
/// boundary instead of being silently stored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataPatch {
	pub name: Option<String>,
	pub method: Option<String>,
	pub inputs: Option<serde_json::Value>,
}

impl MetadataPatch {
	pub fn apply_to(&self, metadata: &mut JobMetadata) {
		if let Some(name) = &self.name {
			metadata.name = Some(name.clone());
		}
		if let Some(method) = &self.method {
			metadata.method = Some(method.clone());
		}
		if let Some(inputs) = &self.inputs {
			metadata.inputs = Some(inputs.clone());
		}
	}
}

/// Parameters of a job that must run against the depot via the worker.
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
	pub request: DepotRequest,
	/// Background jobs return their id immediately and are polled through
	/// the control surface; foreground jobs block the submitter.
	pub background: bool,
	pub delete_on_completion: bool,
	/// How long a finished background job stays in the registry before the
	/// calendar reaps it (when `delete_on_completion` is set).
	pub time_before_removal: Duration,
	pub metadata: JobMetadata,
}

/// Retention and description options for a background submission.
#[derive(Debug, Clone, Default)]
pub struct BackgroundOptions {
	pub priority: Priority,
	pub delete_on_completion: bool,
	/// Defaults to [`EngineConfig::removal_delay`](crate::EngineConfig)
	/// when `None`.
	pub time_before_removal: Option<Duration>,
	pub metadata: JobMetadata,
}

/// Operations executed inline by the scheduler, never sent to the worker.
#[derive(Debug, Clone)]
pub enum ControlRequest {
	List,
	Get(JobId),
	GetByName(String),
	SetPriority(JobId, Priority),
	RescheduleRemoval {
		id: JobId,
		delete_on_completion: bool,
		time_before_removal: Duration,
	},
	UpdateMetadata(JobId, MetadataPatch),
	Delete(JobId),
	Terminate(JobId),
}

/// Typed result of a [`ControlRequest`].
#[derive(Debug, Clone)]
pub enum ControlReply {
	Job(Box<JobSnapshot>),
	Jobs(Vec<JobSnapshot>),
	Done,
}

/// What a foreground submitter receives when its job finalizes successfully.
#[derive(Debug)]
pub enum JobReturn {
	Value(serde_json::Value),
	Control(ControlReply),
}

/// The unit of work owned by the scheduler.
///
/// Construction assigns the id and creation timestamp; all later mutation
/// happens on the scheduler loop, which is the only owner of job state.
#[derive(Debug, Clone)]
pub struct Job {
	id: JobId,
	priority: Priority,
	created_at: DateTime<Utc>,
	started_at: Option<DateTime<Utc>>,
	finished_at: Option<DateTime<Utc>>,
	state: JobState,
	outcome: Option<JobOutcome>,
	kind: JobKind,
}

/// The two families of jobs, each with its own strongly-typed parameters.
#[derive(Debug, Clone)]
pub enum JobKind {
	Control(ControlRequest),
	Execution(ExecutionSpec),
}

impl Job {
	pub(crate) fn control(request: ControlRequest) -> Self {
		Self::new(Priority::HIGH, JobKind::Control(request))
	}

	pub(crate) fn execution(priority: Priority, spec: ExecutionSpec) -> Self {
		Self::new(priority, JobKind::Execution(spec))
	}

	fn new(priority: Priority, kind: JobKind) -> Self {
		Self {
			id: JobId::next(),
			priority,
			created_at: Utc::now(),
			started_at: None,
			finished_at: None,
			state: JobState::New,
			outcome: None,
			kind,
		}
	}

	pub fn id(&self) -> JobId {
		self.id
	}

	pub fn priority(&self) -> Priority {
		self.priority
	}

	pub fn state(&self) -> JobState {
		self.state
	}

	pub fn kind(&self) -> &JobKind {
		&self.kind
	}

	pub fn is_control(&self) -> bool {
		matches!(self.kind, JobKind::Control(_))
	}

	pub fn is_background(&self) -> bool {
		matches!(&self.kind, JobKind::Execution(spec) if spec.background)
	}

	pub fn name(&self) -> Option<&str> {
		match &self.kind {
			JobKind::Execution(spec) => spec.metadata.name.as_deref(),
			JobKind::Control(_) => None,
		}
	}

	pub(crate) fn execution_spec(&self) -> Option<&ExecutionSpec> {
		match &self.kind {
			JobKind::Execution(spec) => Some(spec),
			JobKind::Control(_) => None,
		}
	}

	pub(crate) fn execution_spec_mut(&mut self) -> Option<&mut ExecutionSpec> {
		match &mut self.kind {
			JobKind::Execution(spec) => Some(spec),
			JobKind::Control(_) => None,
		}
	}

	pub(crate) fn set_priority(&mut self, priority: Priority) {
		self.priority = priority;
	}

	/// Move the job to a new lifecycle state.
	///
	/// The transition relation is monotone; violating it is a programming
	/// error in the scheduler, not a recoverable failure.
	fn advance(&mut self, next: JobState) {
		assert!(
			self.state.can_become(next),
			"illegal job state transition {} -> {next} <id='{}'>",
			self.state,
			self.id,
		);
		self.state = next;
	}

	pub(crate) fn start(&mut self) {
		self.advance(JobState::Running);
		self.started_at = Some(Utc::now());
	}

	pub(crate) fn finish(&mut self, outcome: JobOutcome) {
		self.advance(match &outcome {
			JobOutcome::Success(_) => JobState::Completed,
			JobOutcome::Terminated => JobState::Terminated,
			JobOutcome::Failed(_) => JobState::Exception,
		});
		self.finished_at = Some(Utc::now());
		self.outcome = Some(outcome);
	}

	/// Cancel a job that was never started; the worker is never contacted.
	pub(crate) fn terminate_before_start(&mut self) {
		self.advance(JobState::Terminated);
		self.finished_at = Some(Utc::now());
		self.outcome = Some(JobOutcome::Terminated);
	}

	pub fn outcome(&self) -> Option<&JobOutcome> {
		self.outcome.as_ref()
	}

	/// A copy of the job's public fields, as carried by events and returned
	/// by the control surface.
	pub fn snapshot(&self) -> JobSnapshot {
		let (background, delete_on_completion, time_before_removal, metadata) = match &self.kind {
			JobKind::Execution(spec) => (
				spec.background,
				spec.delete_on_completion,
				Some(spec.time_before_removal),
				spec.metadata.clone(),
			),
			JobKind::Control(_) => (false, false, None, JobMetadata::default()),
		};

		JobSnapshot {
			id: self.id,
			name: metadata.name.clone(),
			state: self.state,
			priority: self.priority,
			created_at: self.created_at,
			started_at: self.started_at,
			finished_at: self.finished_at,
			background,
			delete_on_completion,
			time_before_removal,
			metadata,
			outcome: self.outcome.clone(),
		}
	}

	/// Unwrap a finished job into what a blocked foreground submitter gets.
	pub(crate) fn into_return(self) -> Result<JobReturn, JobError> {
		match self.outcome {
			Some(JobOutcome::Success(value)) => Ok(JobReturn::Value(value)),
			Some(JobOutcome::Terminated) => Err(JobError::Terminated(self.id)),
			Some(JobOutcome::Failed(fault)) => Err(fault.into()),
			None => unreachable!("job finalized without an outcome <id='{}'>", self.id),
		}
	}
}

/// Serializable view of a job at one moment in time.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
	pub id: JobId,
	pub name: Option<String>,
	pub state: JobState,
	pub priority: Priority,
	pub created_at: DateTime<Utc>,
	pub started_at: Option<DateTime<Utc>>,
	pub finished_at: Option<DateTime<Utc>>,
	pub background: bool,
	pub delete_on_completion: bool,
	pub time_before_removal: Option<Duration>,
	pub metadata: JobMetadata,
	pub outcome: Option<JobOutcome>,
}
