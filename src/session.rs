use std::sync::Arc;

use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, instrument, trace, warn};

use super::{
	config::EngineConfig,
	depot::Connect,
	error::{Fault, FaultKind},
	job::JobId,
	message::{ReplyOutcome, WorkerOp, WorkerRequest},
	worker::Worker,
};

/// The worker died before delivering a reply.
struct WorkerDied;

#[derive(Debug)]
struct SessionState {
	worker: Option<Worker>,
	/// Session nesting counter; the depot lock is held iff it is positive.
	nesting: u32,
	/// Set once by [`SessionManager::shutdown`]; all later calls fail fast.
	terminating: bool,
}

/// Owns the worker's lifecycle and the request/reply transport.
///
/// The worker is started lazily on first use. A reply that does not arrive
/// within the configured timeout only means the worker is slow as long as
/// its task is still alive; a dead worker is resurrected, the depot lock is
/// re-established when a session is active, and the in-flight request is
/// replayed. Jobs submitted during the outage stay queued and are sent once
/// the fresh worker is ready.
pub(crate) struct SessionManager {
	connector: Arc<dyn Connect>,
	config: EngineConfig,
	state: Mutex<SessionState>,
}

impl SessionManager {
	pub fn new(connector: Arc<dyn Connect>, config: EngineConfig) -> Self {
		Self {
			connector,
			config,
			state: Mutex::new(SessionState {
				worker: None,
				nesting: 0,
				terminating: false,
			}),
		}
	}

	/// Run one request against the worker and wait for its reply.
	#[instrument(skip(self, request), fields(job_id = %request.job_id))]
	pub async fn process(&self, request: WorkerRequest) -> Result<ReplyOutcome, Fault> {
		let mut state = self.state.lock().await;

		if state.terminating {
			return Err(Fault::new(
				FaultKind::Internal,
				"session manager already terminated",
			));
		}

		self.roundtrip(&mut state, request).await
	}

	/// Enter a session. Only the 0→1 transition locks the depot; nested
	/// begins are idempotent with respect to the underlying lock.
	pub async fn begin_session(&self) -> Result<(), Fault> {
		let mut state = self.state.lock().await;

		if state.terminating {
			return Err(Fault::new(
				FaultKind::Internal,
				"session manager already terminated",
			));
		}

		if state.nesting == 0 {
			let request = WorkerRequest {
				job_id: JobId::next(),
				op: WorkerOp::Lock,
			};

			match self.roundtrip(&mut state, request).await? {
				ReplyOutcome::Done(_) => {}
				ReplyOutcome::Terminated => {
					return Err(Fault::new(
						FaultKind::TransactionFailure,
						"depot terminated the lock transaction",
					));
				}
				ReplyOutcome::Fault(fault) => return Err(fault),
			}
		}

		state.nesting += 1;
		debug!(nesting = state.nesting, "Session begun");

		Ok(())
	}

	/// Leave a session. An unmatched end clamps at zero and never unlocks an
	/// already-unlocked depot.
	pub async fn end_session(&self) -> Result<(), Fault> {
		let mut state = self.state.lock().await;

		if state.nesting == 0 {
			warn!("end_session without a matching begin_session");
			return Ok(());
		}

		state.nesting -= 1;
		debug!(nesting = state.nesting, "Session ended");

		if state.nesting == 0 && !state.terminating {
			let request = WorkerRequest {
				job_id: JobId::next(),
				op: WorkerOp::Unlock,
			};

			match self.roundtrip(&mut state, request).await {
				Ok(ReplyOutcome::Fault(fault)) => return Err(fault),
				Ok(_) => {}
				Err(fault) if fault.kind == FaultKind::WorkerLost => {
					// A dead worker holds no lock; nothing left to release.
					warn!("Worker lost while unlocking, treating depot as unlocked");
				}
				Err(fault) => return Err(fault),
			}
		}

		Ok(())
	}

	/// Terminate the worker and refuse all subsequent calls.
	pub async fn shutdown(&self) {
		let mut state = self.state.lock().await;

		if state.terminating {
			warn!("Session manager shut down twice");
			return;
		}
		state.terminating = true;

		if let Some(worker) = state.worker.take() {
			let request = WorkerRequest {
				job_id: JobId::next(),
				op: WorkerOp::Shutdown,
			};

			if worker.send(request).await.is_ok() {
				if timeout(self.config.reply_timeout, worker.recv())
					.await
					.is_err()
				{
					warn!("Worker did not ack shutdown in time");
				}
			}

			worker.join().await;
		}

		info!("Session manager terminated");
	}

	/// Send a request and wait for its reply, resurrecting a dead worker up
	/// to the configured budget.
	async fn roundtrip(
		&self,
		state: &mut SessionState,
		request: WorkerRequest,
	) -> Result<ReplyOutcome, Fault> {
		let mut resurrections = 0u32;

		loop {
			if state.worker.is_none() {
				debug!("Starting worker");
				state.worker = Some(Worker::spawn(
					Arc::clone(&self.connector),
					self.config.channel_capacity,
				));
			}

			let worker = state
				.worker
				.as_ref()
				.expect("worker was just spawned above");

			match self.send_and_wait(worker, &request).await {
				Ok(outcome) => return Ok(outcome),

				Err(WorkerDied) => {
					state.worker = None;

					if resurrections >= self.config.max_resurrections {
						warn!(
							resurrections,
							"Worker died and the resurrection budget is exhausted"
						);
						return Err(Fault::worker_lost(resurrections));
					}

					resurrections += 1;
					warn!(resurrections, "Worker died, resurrecting");

					state.worker = Some(Worker::spawn(
						Arc::clone(&self.connector),
						self.config.channel_capacity,
					));

					// Restore the exclusive hold before replaying the
					// in-flight request.
					if state.nesting > 0 && !matches!(request.op, WorkerOp::Lock) {
						let lock = WorkerRequest {
							job_id: JobId::next(),
							op: WorkerOp::Lock,
						};

						let worker = state
							.worker
							.as_ref()
							.expect("worker was just resurrected above");

						match self.send_and_wait(worker, &lock).await {
							Ok(ReplyOutcome::Fault(fault)) => return Err(fault),
							Ok(_) => debug!("Depot lock re-established"),
							Err(WorkerDied) => {
								state.worker = None;
								continue;
							}
						}
					}
				}
			}
		}
	}

	/// Wait on the downlink, bounded by the reply timeout. A timeout with a
	/// live worker means "busy", never failure.
	async fn send_and_wait(
		&self,
		worker: &Worker,
		request: &WorkerRequest,
	) -> Result<ReplyOutcome, WorkerDied> {
		if worker.send(request.clone()).await.is_err() {
			return Err(WorkerDied);
		}

		loop {
			match timeout(self.config.reply_timeout, worker.recv()).await {
				Ok(Ok(reply)) => {
					if reply.job_id != request.job_id {
						warn!(
							got = %reply.job_id,
							expected = %request.job_id,
							"Discarding stale reply"
						);
						continue;
					}

					return Ok(reply.outcome);
				}

				// Downlink closed: the worker dropped its sender and is gone.
				Ok(Err(())) => return Err(WorkerDied),

				Err(_elapsed) => {
					if worker.is_alive() {
						trace!(job_id = %request.job_id, "Worker is slow, waiting again");
						continue;
					}

					return Err(WorkerDied);
				}
			}
		}
	}
}
