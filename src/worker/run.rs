use std::{
	fs,
	path::PathBuf,
	pin::pin,
	sync::Arc,
	time::SystemTime,
};

use async_channel as chan;
use futures::StreamExt;
use tracing::{debug, info, trace, warn};

use super::super::{
	depot::{Connect, Depot, DepotRequest, DepotSnapshot, OpOutcome},
	error::Fault,
	message::{ReplyOutcome, WorkerOp, WorkerReply, WorkerRequest},
};

pub(super) async fn run(
	connector: Arc<dyn Connect>,
	uplink_rx: chan::Receiver<WorkerRequest>,
	downlink_tx: chan::Sender<WorkerReply>,
) {
	let mut depot: Option<Box<dyn Depot>> = None;
	let mut snapshot_cache: Option<SnapshotCache> = None;
	let mut lock_depth = 0u32;

	let mut request_stream = pin!(uplink_rx);

	while let Some(WorkerRequest { job_id, op }) = request_stream.next().await {
		trace!(%job_id, "Worker received request");

		let (outcome, shutdown) = match op {
			WorkerOp::Execute(request) => (
				execute(&connector, &mut depot, &mut snapshot_cache, &request).await,
				false,
			),

			WorkerOp::Lock => (lock(&connector, &mut depot, &mut lock_depth).await, false),

			WorkerOp::Unlock => (unlock(&mut depot, &mut lock_depth).await, false),

			WorkerOp::Shutdown => (ReplyOutcome::Done(serde_json::Value::Null), true),
		};

		// One reply per request, no batching, no skipping; pairing on the
		// other side depends on it.
		if downlink_tx
			.send(WorkerReply { job_id, outcome })
			.await
			.is_err()
		{
			warn!(%job_id, "Downlink closed before reply could be sent, worker exiting");
			break;
		}

		if shutdown {
			info!("Worker received shutdown request and will exit");
			break;
		}
	}

	trace!("Worker loop ended");
}

/// Open the depot connection on first use; a fresh worker starts without one.
async fn connected<'d>(
	connector: &Arc<dyn Connect>,
	depot: &'d mut Option<Box<dyn Depot>>,
) -> Result<&'d mut Box<dyn Depot>, Fault> {
	if depot.is_none() {
		debug!("Connecting to the depot");
		*depot = Some(connector.connect().await?);
	}

	Ok(depot
		.as_mut()
		.expect("depot connection was just established"))
}

async fn execute(
	connector: &Arc<dyn Connect>,
	depot: &mut Option<Box<dyn Depot>>,
	snapshot_cache: &mut Option<SnapshotCache>,
	request: &DepotRequest,
) -> ReplyOutcome {
	let result = async {
		let depot = connected(connector, depot).await?;

		match request {
			DepotRequest::Install(params) => depot.install(params).await,
			DepotRequest::Remove(params) => depot.remove(params).await,
			DepotRequest::Verify(params) => depot.verify(params).await,
			DepotRequest::Query(params) => {
				let snapshot = current_snapshot(snapshot_cache, depot.as_mut()).await?;
				depot.query(params, &snapshot).await
			}
		}
	}
	.await;

	match result {
		Ok(OpOutcome::Completed(value)) => ReplyOutcome::Done(value),
		Ok(OpOutcome::Terminated) => ReplyOutcome::Terminated,
		Err(fault) => ReplyOutcome::Fault(fault),
	}
}

async fn lock(
	connector: &Arc<dyn Connect>,
	depot: &mut Option<Box<dyn Depot>>,
	lock_depth: &mut u32,
) -> ReplyOutcome {
	if *lock_depth == 0 {
		match connected(connector, depot).await {
			Ok(depot) => {
				if let Err(fault) = depot.lock().await {
					return ReplyOutcome::Fault(fault);
				}
			}
			Err(fault) => return ReplyOutcome::Fault(fault),
		}
	}

	*lock_depth += 1;
	trace!(lock_depth = *lock_depth, "Depot lock taken");

	ReplyOutcome::Done(serde_json::Value::Null)
}

async fn unlock(depot: &mut Option<Box<dyn Depot>>, lock_depth: &mut u32) -> ReplyOutcome {
	match *lock_depth {
		0 => {
			// Unmatched unlock; the depot is not held, nothing to release.
			warn!("Unlock requested with no lock held");
		}

		1 => {
			if let Some(depot) = depot.as_mut() {
				if let Err(fault) = depot.unlock().await {
					return ReplyOutcome::Fault(fault);
				}
			}
			*lock_depth = 0;
			trace!("Depot lock released");
		}

		_ => *lock_depth -= 1,
	}

	ReplyOutcome::Done(serde_json::Value::Null)
}

/// Cached depot metadata plus the configuration mtimes it was taken under.
struct SnapshotCache {
	snapshot: DepotSnapshot,
	stamps: Vec<(PathBuf, Option<SystemTime>)>,
}

impl SnapshotCache {
	fn sample(paths: &[PathBuf]) -> Vec<(PathBuf, Option<SystemTime>)> {
		paths
			.iter()
			.map(|path| {
				(
					path.clone(),
					fs::metadata(path).and_then(|meta| meta.modified()).ok(),
				)
			})
			.collect()
	}
}

/// Return the cached snapshot, refreshing it first whenever any of the
/// depot's configuration files changed on disk since it was taken.
async fn current_snapshot(
	cache: &mut Option<SnapshotCache>,
	depot: &mut dyn Depot,
) -> Result<DepotSnapshot, Fault> {
	let stamps = SnapshotCache::sample(&depot.config_paths());

	let stale = cache
		.as_ref()
		.map_or(true, |cached| cached.stamps != stamps);

	if stale {
		debug!("Depot configuration changed, refreshing metadata snapshot");
		let snapshot = depot.snapshot().await?;
		*cache = Some(SnapshotCache { snapshot, stamps });
	}

	Ok(cache
		.as_ref()
		.expect("snapshot cache was just refreshed")
		.snapshot
		.clone())
}
