use std::sync::Arc;

use async_channel as chan;
use tokio::{spawn, task::JoinHandle};
use tracing::{error, instrument, trace, Instrument};

use super::{
	depot::Connect,
	message::{WorkerReply, WorkerRequest},
};

mod run;

use run::run;

/// Handle to the single worker task holding the live depot connection.
///
/// The worker is the only code path that drives the depot. It consumes
/// requests from the uplink in FIFO order, strictly sequentially, and sends
/// exactly one reply per request on the downlink. The handle stays on the
/// session manager's side of the boundary.
#[derive(Debug)]
pub(crate) struct Worker {
	uplink_tx: chan::Sender<WorkerRequest>,
	downlink_rx: chan::Receiver<WorkerReply>,
	handle: JoinHandle<()>,
}

impl Worker {
	#[instrument(name = "worker_spawn", skip_all)]
	pub fn spawn(connector: Arc<dyn Connect>, channel_capacity: usize) -> Self {
		let (uplink_tx, uplink_rx) = chan::bounded(channel_capacity);
		let (downlink_tx, downlink_rx) = chan::bounded(channel_capacity);

		trace!("Spawning depot worker");

		let handle = spawn(run(connector, uplink_rx, downlink_tx).in_current_span());

		Self {
			uplink_tx,
			downlink_rx,
			handle,
		}
	}

	/// Queue a request on the uplink. Failure means the worker already died
	/// and closed its end.
	pub async fn send(&self, request: WorkerRequest) -> Result<(), ()> {
		self.uplink_tx.send(request).await.map_err(|_| ())
	}

	/// Receive the next reply from the downlink. Failure means the worker
	/// died and dropped its sender.
	pub async fn recv(&self) -> Result<WorkerReply, ()> {
		self.downlink_rx.recv().await.map_err(|_| ())
	}

	/// Process-liveness check used to tell a slow worker from a dead one.
	pub fn is_alive(&self) -> bool {
		!self.handle.is_finished()
	}

	pub async fn join(self) {
		if let Err(e) = self.handle.await {
			if e.is_panic() {
				error!(?e, "Worker died by panic");
			}
		}
	}
}
