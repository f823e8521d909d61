use std::{cell::RefCell, sync::Arc};

use async_channel as chan;
use tokio::{
	spawn,
	sync::{broadcast, oneshot},
	task::JoinHandle,
};
use tracing::{error, warn, Instrument};

use super::{
	config::EngineConfig,
	depot::{Connect, DepotRequest, InstallParams, QueryParams, RemoveParams, VerifyParams},
	error::JobError,
	event::{EventBus, JobEvent},
	job::{
		BackgroundOptions, ControlReply, ControlRequest, ExecutionSpec, Job, JobId, JobMetadata,
		JobReturn, JobSnapshot, MetadataPatch, Priority,
	},
	manager::Scheduler,
	message::SchedulerMessage,
	session::SessionManager,
};

/// The entry point used by arbitrary caller tasks.
///
/// An engine is constructed explicitly by the composition root and passed
/// around by reference; there is no process-wide singleton. Dropping it does
/// not stop the scheduler, call [`Engine::shutdown`].
pub struct Engine {
	msgs_tx: chan::Sender<SchedulerMessage>,
	sessions: Arc<SessionManager>,
	events: Arc<EventBus>,
	config: EngineConfig,
	handle: RefCell<Option<JoinHandle<()>>>,
}

impl Engine {
	/// Start the scheduler. The worker itself is only started by the session
	/// manager when the first execution job (or session) needs it.
	pub fn new(config: EngineConfig, connector: Arc<dyn Connect>) -> Self {
		let events = Arc::new(EventBus::new(config.event_capacity));
		let sessions = Arc::new(SessionManager::new(connector, config.clone()));

		let (msgs_tx, handle) =
			Scheduler::spawn(Arc::clone(&sessions), Arc::clone(&events), &config);

		Self {
			msgs_tx,
			sessions,
			events,
			config,
			handle: RefCell::new(Some(handle)),
		}
	}

	/// Subscribe to job lifecycle events; delivery beyond the broadcast bus
	/// belongs to the notification layer.
	pub fn events(&self) -> broadcast::Receiver<JobEvent> {
		self.events.subscribe()
	}

	// Foreground operations: block the calling task until the job finalizes,
	// then return the value or raise the classified error.

	pub async fn install(&self, params: InstallParams) -> Result<serde_json::Value, JobError> {
		self.run_foreground(DepotRequest::Install(params)).await
	}

	pub async fn remove(&self, params: RemoveParams) -> Result<serde_json::Value, JobError> {
		self.run_foreground(DepotRequest::Remove(params)).await
	}

	pub async fn query(&self, params: QueryParams) -> Result<serde_json::Value, JobError> {
		self.run_foreground(DepotRequest::Query(params)).await
	}

	pub async fn verify(&self, params: VerifyParams) -> Result<serde_json::Value, JobError> {
		self.run_foreground(DepotRequest::Verify(params)).await
	}

	// Background operations: return the job id immediately; observe and
	// manage the job through the control surface below.

	pub async fn install_background(
		&self,
		params: InstallParams,
		options: BackgroundOptions,
	) -> Result<JobId, JobError> {
		self.run_background(DepotRequest::Install(params), options)
			.await
	}

	pub async fn remove_background(
		&self,
		params: RemoveParams,
		options: BackgroundOptions,
	) -> Result<JobId, JobError> {
		self.run_background(DepotRequest::Remove(params), options)
			.await
	}

	pub async fn query_background(
		&self,
		params: QueryParams,
		options: BackgroundOptions,
	) -> Result<JobId, JobError> {
		self.run_background(DepotRequest::Query(params), options)
			.await
	}

	pub async fn verify_background(
		&self,
		params: VerifyParams,
		options: BackgroundOptions,
	) -> Result<JobId, JobError> {
		self.run_background(DepotRequest::Verify(params), options)
			.await
	}

	// Control surface over background jobs.

	pub async fn job(&self, id: JobId) -> Result<JobSnapshot, JobError> {
		self.run_control(ControlRequest::Get(id)).await
	}

	pub async fn job_by_name(&self, name: impl Into<String>) -> Result<JobSnapshot, JobError> {
		self.run_control(ControlRequest::GetByName(name.into()))
			.await
	}

	pub async fn jobs(&self) -> Result<Vec<JobSnapshot>, JobError> {
		match self.submit_control(ControlRequest::List).await? {
			ControlReply::Jobs(snapshots) => Ok(snapshots),
			other => unreachable!("list returned {other:?}"),
		}
	}

	pub async fn set_job_priority(
		&self,
		id: JobId,
		priority: Priority,
	) -> Result<JobSnapshot, JobError> {
		self.run_control(ControlRequest::SetPriority(id, priority))
			.await
	}

	pub async fn reschedule_job_removal(
		&self,
		id: JobId,
		delete_on_completion: bool,
		time_before_removal: std::time::Duration,
	) -> Result<JobSnapshot, JobError> {
		self.run_control(ControlRequest::RescheduleRemoval {
			id,
			delete_on_completion,
			time_before_removal,
		})
		.await
	}

	pub async fn update_job_metadata(
		&self,
		id: JobId,
		patch: MetadataPatch,
	) -> Result<JobSnapshot, JobError> {
		self.run_control(ControlRequest::UpdateMetadata(id, patch))
			.await
	}

	pub async fn delete_job(&self, id: JobId) -> Result<(), JobError> {
		self.submit_control(ControlRequest::Delete(id)).await?;
		Ok(())
	}

	/// Cancel a job that has not started yet; a running job cannot be
	/// terminated since the worker offers no mid-operation abort.
	pub async fn terminate_job(&self, id: JobId) -> Result<JobSnapshot, JobError> {
		self.run_control(ControlRequest::Terminate(id)).await
	}

	// Sessions: a reentrant scoped hold on the depot. Nested use locks and
	// unlocks the depot only at the outermost boundary.

	pub async fn begin_session(&self) -> Result<(), JobError> {
		self.sessions.begin_session().await.map_err(Into::into)
	}

	pub async fn end_session(&self) -> Result<(), JobError> {
		self.sessions.end_session().await.map_err(Into::into)
	}

	/// Begin a session and get a guard for it. Prefer ending it explicitly
	/// with [`Session::end`]; a dropped guard ends the session in the
	/// background, best effort.
	pub async fn session(&self) -> Result<Session, JobError> {
		self.begin_session().await?;

		Ok(Session {
			sessions: Arc::clone(&self.sessions),
			ended: false,
		})
	}

	/// Stop the scheduler and terminate the worker. Pending foreground
	/// submitters are woken with a terminating error.
	pub async fn shutdown(&self) {
		if let Some(handle) = self
			.handle
			.try_borrow_mut()
			.ok()
			.and_then(|mut maybe_handle| maybe_handle.take())
		{
			let (tx, rx) = oneshot::channel();

			if self.msgs_tx.send(SchedulerMessage::Shutdown(tx)).await.is_ok() && rx.await.is_err()
			{
				warn!("Scheduler went away before acking shutdown");
			}

			if let Err(e) = handle.await {
				error!(?e, "Scheduler failed to shut down cleanly");
			}
		} else {
			warn!("Trying to shutdown an engine that was already shutdown");
		}
	}

	async fn run_foreground(&self, request: DepotRequest) -> Result<serde_json::Value, JobError> {
		request.validate()?;

		let job = Job::execution(
			Priority::NORMAL,
			ExecutionSpec {
				request,
				background: false,
				delete_on_completion: false,
				time_before_removal: self.config.removal_delay,
				metadata: JobMetadata::default(),
			},
		);

		match self.submit(job).await? {
			JobReturn::Value(value) => Ok(value),
			JobReturn::Control(reply) => unreachable!("execution job returned {reply:?}"),
		}
	}

	async fn run_background(
		&self,
		request: DepotRequest,
		options: BackgroundOptions,
	) -> Result<JobId, JobError> {
		request.validate()?;

		let mut metadata = options.metadata;
		if metadata.method.is_none() {
			metadata.method = Some(request.name().to_string());
		}
		if metadata.inputs.is_none() {
			metadata.inputs = serde_json::to_value(&request).ok();
		}

		let job = Job::execution(
			options.priority,
			ExecutionSpec {
				request,
				background: true,
				delete_on_completion: options.delete_on_completion,
				time_before_removal: options
					.time_before_removal
					.unwrap_or(self.config.removal_delay),
				metadata,
			},
		);
		let id = job.id();

		self.msgs_tx
			.send(SchedulerMessage::Submit { job, waiter: None })
			.await
			.map_err(|_| JobError::Terminating)?;

		Ok(id)
	}

	async fn run_control(&self, request: ControlRequest) -> Result<JobSnapshot, JobError> {
		match self.submit_control(request).await? {
			ControlReply::Job(snapshot) => Ok(*snapshot),
			other => unreachable!("control operation returned {other:?}"),
		}
	}

	async fn submit_control(&self, request: ControlRequest) -> Result<ControlReply, JobError> {
		match self.submit(Job::control(request)).await? {
			JobReturn::Control(reply) => Ok(reply),
			JobReturn::Value(value) => unreachable!("control job returned value {value}"),
		}
	}

	/// Submit a job and suspend until the scheduler finalizes it.
	async fn submit(&self, job: Job) -> Result<JobReturn, JobError> {
		let (waiter_tx, waiter_rx) = oneshot::channel();

		self.msgs_tx
			.send(SchedulerMessage::Submit {
				job,
				waiter: Some(waiter_tx),
			})
			.await
			.map_err(|_| JobError::Terminating)?;

		waiter_rx.await.map_err(|_| JobError::Terminating)?
	}
}

/// SAFETY: Due to usage of refcell we lost `Sync` impl, but we only use it to
/// have a shutdown method receiving `&self` which is called once, and we also
/// use `try_borrow_mut` so we never panic
unsafe impl Sync for Engine {}

/// A scoped hold on the depot, spanning any number of engine calls.
#[must_use = "a Session unlocks the depot when ended or dropped"]
pub struct Session {
	sessions: Arc<SessionManager>,
	ended: bool,
}

impl Session {
	/// End the session, releasing the depot lock at the outermost boundary.
	pub async fn end(mut self) -> Result<(), JobError> {
		self.ended = true;
		self.sessions.end_session().await.map_err(Into::into)
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		// FIXME: We should use async drop when it becomes stable
		if !self.ended {
			let sessions = Arc::clone(&self.sessions);

			spawn(
				async move {
					if let Err(e) = sessions.end_session().await {
						warn!(?e, "Failed to end session on drop");
					}
				}
				.in_current_span(),
			);
		}
	}
}
