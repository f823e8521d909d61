use std::{collections::HashMap, pin::pin, sync::Arc};

use async_channel as chan;
use futures::StreamExt;
use tokio::{
	spawn,
	task::JoinHandle,
	time::{timeout_at, Instant},
};
use tracing::{debug, info, trace, warn, Instrument};

use super::{
	calendar::{Calendar, CalendarAction},
	config::EngineConfig,
	error::{Fault, FaultKind, JobError},
	event::{EventBus, JobEvent},
	job::{ControlReply, ControlRequest, Job, JobId, JobKind, JobOutcome, JobReturn, JobState},
	message::{ReplyOutcome, SchedulerMessage, Waiter, WorkerOp, WorkerRequest},
	queue::{JobQueue, Lane, QueueEntry},
	registry::Registry,
	session::SessionManager,
};

/// The single authoritative scheduler and background-job registry.
///
/// One spawned task owns all job state. It drains due calendar entries,
/// finalizes the execution job the session manager replied to, runs control
/// jobs inline, and keeps at most one execution job in flight to the worker.
/// Control jobs bypass the in-flight limit because they never reach the
/// worker.
pub(crate) struct Scheduler {
	registry: Registry,
	queue: JobQueue,
	calendar: Calendar,
	waiters: HashMap<JobId, Waiter>,
	in_flight: Option<JobId>,
	session: Arc<SessionManager>,
	events: Arc<EventBus>,
	msgs_tx: chan::Sender<SchedulerMessage>,
}

impl Scheduler {
	pub fn spawn(
		session: Arc<SessionManager>,
		events: Arc<EventBus>,
		config: &EngineConfig,
	) -> (chan::Sender<SchedulerMessage>, JoinHandle<()>) {
		let (msgs_tx, msgs_rx) = chan::bounded(config.channel_capacity);

		let scheduler = Self {
			registry: Registry::default(),
			queue: JobQueue::default(),
			calendar: Calendar::default(),
			waiters: HashMap::new(),
			in_flight: None,
			session,
			events,
			msgs_tx: msgs_tx.clone(),
		};

		let handle = spawn(scheduler.run(msgs_rx).in_current_span());

		(msgs_tx, handle)
	}

	async fn run(mut self, msgs_rx: chan::Receiver<SchedulerMessage>) {
		let mut msg_stream = pin!(msgs_rx);

		loop {
			self.run_calendar();

			// Wait for work, bounded by the next calendar deadline.
			let maybe_msg = match self.calendar.next_deadline() {
				Some(deadline) => match timeout_at(deadline, msg_stream.next()).await {
					Ok(maybe_msg) => maybe_msg,
					Err(_elapsed) => continue,
				},
				None => msg_stream.next().await,
			};

			let Some(msg) = maybe_msg else {
				debug!("Scheduler mailbox closed, loop exiting");
				break;
			};

			match msg {
				SchedulerMessage::Submit { job, waiter } => {
					self.handle_submit(job, waiter);
					self.dispatch();
				}

				SchedulerMessage::SessionDone { job_id, outcome } => {
					self.finalize_execution(job_id, outcome);
					self.dispatch();
				}

				SchedulerMessage::Shutdown(ack) => {
					self.shutdown().await;
					if ack.send(()).is_err() {
						warn!("Shutdown requester went away before the ack");
					}
					break;
				}
			}
		}
	}

	fn run_calendar(&mut self) {
		for (id, action) in self.calendar.take_due(Instant::now()) {
			match action {
				CalendarAction::RemoveJob => {
					if self.registry.remove(id).is_some() {
						debug!(job_id = %id, "Reaped expired background job");
					}
				}
			}
		}
	}

	fn handle_submit(&mut self, job: Job, waiter: Option<Waiter>) {
		let id = job.id();
		trace!(job_id = %id, "Job submitted");

		if let Some(waiter) = waiter {
			self.waiters.insert(id, waiter);
		}

		if job.is_control() {
			self.queue.push_control(job);
			return;
		}

		if job.is_background() {
			self.events.emit(JobEvent::Created(job.snapshot()));
		}

		self.queue.push_execution(&job);
		self.registry.insert(job);
	}

	/// Pop jobs while any are runnable: control jobs always, execution jobs
	/// only while nothing is in flight.
	fn dispatch(&mut self) {
		loop {
			match self.queue.peek_lane() {
				Some(Lane::Control) => {
					let Some(QueueEntry::Control(job)) = self.queue.pop() else {
						unreachable!("control lane was just peeked");
					};
					self.run_control_job(job);
				}

				Some(Lane::Execution) if self.in_flight.is_none() => {
					let Some(QueueEntry::Execution(id)) = self.queue.pop() else {
						unreachable!("execution lane was just peeked");
					};
					self.dispatch_execution(id);
				}

				_ => break,
			}
		}
	}

	fn dispatch_execution(&mut self, id: JobId) {
		let Some(job) = self.registry.get_mut(id) else {
			// Deleted while queued; nothing to run.
			return;
		};

		if job.state() != JobState::New {
			// Terminated before start; the queue entry went stale.
			return;
		}

		let request = WorkerRequest {
			job_id: id,
			op: WorkerOp::Execute(
				job.execution_spec()
					.expect("execution lane only carries execution jobs")
					.request
					.clone(),
			),
		};

		job.start();
		self.events.emit(JobEvent::Changed(job.snapshot()));

		self.in_flight = Some(id);
		debug!(job_id = %id, "Execution job handed to the session manager");

		// The loop itself never blocks on the worker; the outcome comes
		// back through the mailbox.
		spawn({
			let session = Arc::clone(&self.session);
			let msgs_tx = self.msgs_tx.clone();

			async move {
				let outcome = session.process(request).await;

				if msgs_tx
					.send(SchedulerMessage::SessionDone {
						job_id: id,
						outcome,
					})
					.await
					.is_err()
				{
					warn!(job_id = %id, "Scheduler gone before the session outcome arrived");
				}
			}
			.in_current_span()
		});
	}

	fn finalize_execution(&mut self, job_id: JobId, outcome: Result<ReplyOutcome, Fault>) {
		if self.in_flight != Some(job_id) {
			warn!(job_id = %job_id, "Outcome for a job that is not in flight");
		}
		self.in_flight = None;

		let Some(job) = self.registry.get_mut(job_id) else {
			warn!(job_id = %job_id, "Finished job vanished from the registry");
			return;
		};

		job.finish(match outcome {
			Ok(ReplyOutcome::Done(value)) => JobOutcome::Success(value),
			Ok(ReplyOutcome::Terminated) => JobOutcome::Terminated,
			Ok(ReplyOutcome::Fault(fault)) | Err(fault) => JobOutcome::Failed(fault),
		});

		let snapshot = job.snapshot();
		debug!(job_id = %job_id, state = %snapshot.state, "Execution job finalized");

		self.events.emit(JobEvent::Changed(snapshot.clone()));
		self.events.emit(match snapshot.state {
			JobState::Completed => JobEvent::Succeeded(snapshot),
			_ => JobEvent::Failed(snapshot),
		});

		if job.is_background() {
			let spec = job
				.execution_spec()
				.expect("background jobs are execution jobs");

			if spec.delete_on_completion {
				self.calendar.schedule(
					Instant::now() + spec.time_before_removal,
					job_id,
					CalendarAction::RemoveJob,
				);
			}
		} else {
			let job = self
				.registry
				.remove(job_id)
				.expect("foreground job was just finalized");
			self.wake_waiter(job_id, job.into_return());
		}
	}

	fn run_control_job(&mut self, mut job: Job) {
		let request = match job.kind() {
			JobKind::Control(request) => request.clone(),
			JobKind::Execution(_) => unreachable!("control lane only carries control jobs"),
		};
		let id = job.id();

		job.start();

		let result = self.handle_control(&request);

		// Handler failures become the control job's own exception result;
		// they never propagate into the loop.
		job.finish(match &result {
			Ok(_) => JobOutcome::Success(serde_json::Value::Null),
			Err(e) => JobOutcome::Failed(fault_of(e)),
		});

		self.wake_waiter(id, result.map(JobReturn::Control));
	}

	fn handle_control(&mut self, request: &ControlRequest) -> Result<ControlReply, JobError> {
		match request {
			ControlRequest::List => Ok(ControlReply::Jobs(self.registry.background_snapshots())),

			ControlRequest::Get(id) => self
				.registry
				.background(*id)
				.map(|job| ControlReply::Job(Box::new(job.snapshot())))
				.ok_or(JobError::NotFound(*id)),

			ControlRequest::GetByName(name) => self
				.registry
				.background_by_name(name)
				.map(|job| ControlReply::Job(Box::new(job.snapshot())))
				.ok_or_else(|| JobError::InvalidParameters(format!("no job named '{name}'"))),

			ControlRequest::SetPriority(id, priority) => {
				let job = self
					.registry
					.background_mut(*id)
					.ok_or(JobError::NotFound(*id))?;

				job.set_priority(*priority);

				if job.state() == JobState::New {
					self.queue.reprioritize(*id, *priority);
				}

				let snapshot = job.snapshot();
				self.events.emit(JobEvent::Changed(snapshot.clone()));

				Ok(ControlReply::Job(Box::new(snapshot)))
			}

			ControlRequest::RescheduleRemoval {
				id,
				delete_on_completion,
				time_before_removal,
			} => {
				let job = self
					.registry
					.background_mut(*id)
					.ok_or(JobError::NotFound(*id))?;

				{
					let spec = job
						.execution_spec_mut()
						.expect("background jobs are execution jobs");
					spec.delete_on_completion = *delete_on_completion;
					spec.time_before_removal = *time_before_removal;
				}

				self.calendar.cancel(*id, CalendarAction::RemoveJob);

				if job.state().is_finished() && *delete_on_completion {
					self.calendar.schedule(
						Instant::now() + *time_before_removal,
						*id,
						CalendarAction::RemoveJob,
					);
				}

				let snapshot = job.snapshot();
				self.events.emit(JobEvent::Changed(snapshot.clone()));

				Ok(ControlReply::Job(Box::new(snapshot)))
			}

			ControlRequest::UpdateMetadata(id, patch) => {
				let job = self
					.registry
					.background_mut(*id)
					.ok_or(JobError::NotFound(*id))?;

				patch.apply_to(
					&mut job
						.execution_spec_mut()
						.expect("background jobs are execution jobs")
						.metadata,
				);

				let snapshot = job.snapshot();
				self.events.emit(JobEvent::Changed(snapshot.clone()));

				Ok(ControlReply::Job(Box::new(snapshot)))
			}

			ControlRequest::Delete(id) => {
				let job = self.registry.background(*id).ok_or(JobError::NotFound(*id))?;

				if !job.state().is_finished() {
					return Err(JobError::invalid_state(*id, job.state(), "delete"));
				}

				self.registry.remove(*id);
				self.calendar.cancel_job(*id);
				debug!(job_id = %id, "Background job deleted");

				Ok(ControlReply::Done)
			}

			ControlRequest::Terminate(id) => {
				let job = self
					.registry
					.background_mut(*id)
					.ok_or(JobError::NotFound(*id))?;

				if job.state() != JobState::New {
					return Err(JobError::invalid_state(*id, job.state(), "terminate"));
				}

				// Never started, so the worker is never contacted.
				job.terminate_before_start();
				self.queue.remove(*id);

				let snapshot = job.snapshot();
				self.events.emit(JobEvent::Changed(snapshot.clone()));
				self.events.emit(JobEvent::Failed(snapshot.clone()));

				Ok(ControlReply::Job(Box::new(snapshot)))
			}
		}
	}

	fn wake_waiter(&mut self, id: JobId, result: Result<JobReturn, JobError>) {
		if let Some(waiter) = self.waiters.remove(&id) {
			if waiter.send(result).is_err() {
				trace!(job_id = %id, "Submitter stopped waiting for its job");
			}
		}
	}

	async fn shutdown(&mut self) {
		info!("Scheduler shutting down");

		for (_, waiter) in self.waiters.drain() {
			let _ = waiter.send(Err(JobError::Terminating));
		}

		self.session.shutdown().await;

		debug!(
			remaining_jobs = self.registry.len(),
			pending = self.queue.len(),
			"Scheduler stopped"
		);
	}
}

/// Classify a control-handler error for storage in the job's result.
fn fault_of(error: &JobError) -> Fault {
	match error {
		JobError::InvalidParameters(msg) => Fault::new(FaultKind::InvalidRequest, msg.clone()),
		JobError::NotFound(id) => Fault::new(FaultKind::NotFound, format!("job {id} not found")),
		JobError::InvalidState { .. } => Fault::new(FaultKind::InvalidRequest, error.to_string()),
		JobError::Fault(fault) => fault.clone(),
		JobError::Terminated(id) => Fault::new(
			FaultKind::TransactionFailure,
			format!("transaction for job {id} terminated"),
		),
		JobError::Terminating => Fault::new(FaultKind::Internal, "engine is shutting down"),
	}
}
