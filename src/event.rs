//! Lifecycle notifications for the (external) eventing layer.

use tokio::sync::broadcast;

use super::job::JobSnapshot;

/// A job lifecycle signal, carrying a snapshot of the job's public fields
/// at the moment of the event.
#[derive(Debug, Clone)]
pub enum JobEvent {
	/// A background job entered the registry.
	Created(JobSnapshot),
	/// State, priority or metadata changed.
	Changed(JobSnapshot),
	Succeeded(JobSnapshot),
	/// The job finished terminated or with a classified failure.
	Failed(JobSnapshot),
}

impl JobEvent {
	pub fn snapshot(&self) -> &JobSnapshot {
		match self {
			Self::Created(snapshot)
			| Self::Changed(snapshot)
			| Self::Succeeded(snapshot)
			| Self::Failed(snapshot) => snapshot,
		}
	}
}

/// Broadcast bus the scheduler publishes on. Delivery beyond this bus is the
/// notification layer's problem.
#[derive(Debug)]
pub struct EventBus {
	sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	pub fn emit(&self, event: JobEvent) {
		// No receivers is fine; nobody has to listen.
		let _ = self.sender.send(event);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
		self.sender.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1024)
	}
}
