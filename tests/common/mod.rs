#![allow(dead_code)]

use std::{
	collections::HashMap,
	path::PathBuf,
	sync::{
		atomic::{AtomicBool, AtomicU32, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use depot_job_system::{
	Connect, Depot, DepotSnapshot, Engine, EngineConfig, Fault, InstallParams, JobId, JobSnapshot,
	OpOutcome, QueryParams, RemoveParams, VerifyParams,
};
use serde_json::json;

/// Shared, inspectable state behind every depot connection the test
/// connector opens. Doubles as a spy on what actually reached the worker.
#[derive(Debug, Default)]
pub struct DepotProbe {
	operations: Mutex<Vec<String>>,
	delays: Mutex<HashMap<String, Duration>>,
	next_fault: Mutex<Option<Fault>>,
	config_dir: Mutex<Option<PathBuf>>,
	locks: AtomicU32,
	unlocks: AtomicU32,
	connections: AtomicU32,
	snapshots: AtomicU32,
	panics_left: AtomicU32,
	terminate_once: AtomicBool,
	active: AtomicU32,
	max_active: AtomicU32,
}

impl DepotProbe {
	/// Make the next `n` operations panic, killing the worker task.
	pub fn inject_panics(&self, n: u32) {
		self.panics_left.store(n, Ordering::SeqCst);
	}

	pub fn fail_next(&self, fault: Fault) {
		*self.next_fault.lock().unwrap() = Some(fault);
	}

	pub fn terminate_next(&self) {
		self.terminate_once.store(true, Ordering::SeqCst);
	}

	/// Stall operations on `item` for `delay`, simulating a busy depot.
	pub fn delay_item(&self, item: &str, delay: Duration) {
		self.delays.lock().unwrap().insert(item.to_string(), delay);
	}

	pub fn set_config_dir(&self, dir: PathBuf) {
		*self.config_dir.lock().unwrap() = Some(dir);
	}

	/// Operations the worker actually ran, in execution order.
	pub fn operations(&self) -> Vec<String> {
		self.operations.lock().unwrap().clone()
	}

	pub fn locks(&self) -> u32 {
		self.locks.load(Ordering::SeqCst)
	}

	pub fn unlocks(&self) -> u32 {
		self.unlocks.load(Ordering::SeqCst)
	}

	pub fn connections(&self) -> u32 {
		self.connections.load(Ordering::SeqCst)
	}

	pub fn snapshots(&self) -> u32 {
		self.snapshots.load(Ordering::SeqCst)
	}

	/// The most operations ever observed running at the same time.
	pub fn max_active(&self) -> u32 {
		self.max_active.load(Ordering::SeqCst)
	}

	async fn operate(&self, op: &str, item: &str) -> Result<OpOutcome, Fault> {
		let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_active.fetch_max(running, Ordering::SeqCst);

		let delay = self.delays.lock().unwrap().get(item).copied();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}

		if self.panics_left.load(Ordering::SeqCst) > 0 {
			self.panics_left.fetch_sub(1, Ordering::SeqCst);
			panic!("injected depot crash during {op} {item}");
		}

		self.operations.lock().unwrap().push(format!("{op} {item}"));
		self.active.fetch_sub(1, Ordering::SeqCst);

		if self.terminate_once.swap(false, Ordering::SeqCst) {
			return Ok(OpOutcome::Terminated);
		}

		if let Some(fault) = self.next_fault.lock().unwrap().take() {
			return Err(fault);
		}

		Ok(OpOutcome::Completed(json!({ "op": op, "item": item })))
	}
}

pub struct MockDepot {
	probe: Arc<DepotProbe>,
}

#[async_trait]
impl Depot for MockDepot {
	async fn lock(&mut self) -> Result<(), Fault> {
		self.probe.locks.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn unlock(&mut self) -> Result<(), Fault> {
		self.probe.unlocks.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	fn config_paths(&self) -> Vec<PathBuf> {
		self.probe
			.config_dir
			.lock()
			.unwrap()
			.as_ref()
			.map(|dir| vec![dir.join("depot.conf")])
			.unwrap_or_default()
	}

	async fn snapshot(&mut self) -> Result<DepotSnapshot, Fault> {
		self.probe.snapshots.fetch_add(1, Ordering::SeqCst);

		Ok(DepotSnapshot {
			taken_at: chrono::Utc::now(),
			catalog: json!({ "items": ["acme-tools", "acme-docs"] }),
		})
	}

	async fn install(&mut self, params: &InstallParams) -> Result<OpOutcome, Fault> {
		self.probe.operate("install", &params.item).await
	}

	async fn remove(&mut self, params: &RemoveParams) -> Result<OpOutcome, Fault> {
		self.probe.operate("remove", &params.item).await
	}

	async fn query(
		&mut self,
		params: &QueryParams,
		snapshot: &DepotSnapshot,
	) -> Result<OpOutcome, Fault> {
		match self.probe.operate("query", &params.pattern).await? {
			OpOutcome::Completed(_) => Ok(OpOutcome::Completed(json!({
				"pattern": params.pattern,
				"catalog": snapshot.catalog,
			}))),
			terminated => Ok(terminated),
		}
	}

	async fn verify(&mut self, params: &VerifyParams) -> Result<OpOutcome, Fault> {
		self.probe.operate("verify", &params.item).await
	}
}

pub struct MockConnector {
	pub probe: Arc<DepotProbe>,
}

#[async_trait]
impl Connect for MockConnector {
	async fn connect(&self) -> Result<Box<dyn Depot>, Fault> {
		self.probe.connections.fetch_add(1, Ordering::SeqCst);

		Ok(Box::new(MockDepot {
			probe: Arc::clone(&self.probe),
		}))
	}
}

/// An engine over a fresh probe, with a reply timeout short enough to make
/// liveness checks observable in tests.
pub fn engine_with_probe(config: EngineConfig) -> (Engine, Arc<DepotProbe>) {
	let probe = Arc::new(DepotProbe::default());
	let engine = Engine::new(
		config,
		Arc::new(MockConnector {
			probe: Arc::clone(&probe),
		}),
	);

	(engine, probe)
}

pub fn fast_config() -> EngineConfig {
	EngineConfig {
		reply_timeout: Duration::from_millis(100),
		..Default::default()
	}
}

pub async fn wait_finished(engine: &Engine, id: JobId) -> JobSnapshot {
	for _ in 0..500 {
		if let Ok(snapshot) = engine.job(id).await {
			if snapshot.state.is_finished() {
				return snapshot;
			}
		}

		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	panic!("job {id} never finished");
}

pub fn install_params(item: &str) -> InstallParams {
	InstallParams {
		item: item.into(),
		force: false,
	}
}
