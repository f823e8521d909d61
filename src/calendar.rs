use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;

use super::job::JobId;

/// A deferred action the scheduler runs when its time arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum CalendarAction {
	/// Reap a finished background job from the registry.
	RemoveJob,
}

/// The scheduler's calendar of deferred actions.
///
/// Entries are deduplicated per `(job, action)`; competing schedules keep the
/// earliest requested time unless explicitly overridden.
#[derive(Debug, Default)]
pub(crate) struct Calendar {
	entries: BTreeSet<(Instant, JobId, CalendarAction)>,
	index: HashMap<(JobId, CalendarAction), Instant>,
}

impl Calendar {
	pub fn schedule(&mut self, fire_at: Instant, id: JobId, action: CalendarAction) {
		if let Some(&existing) = self.index.get(&(id, action)) {
			if existing <= fire_at {
				return;
			}
			self.entries.remove(&(existing, id, action));
		}

		self.entries.insert((fire_at, id, action));
		self.index.insert((id, action), fire_at);
	}

	/// Cancel-and-insert, for reschedule requests that may move an entry to
	/// a later time.
	pub fn override_schedule(&mut self, fire_at: Instant, id: JobId, action: CalendarAction) {
		self.cancel(id, action);
		self.schedule(fire_at, id, action);
	}

	pub fn cancel(&mut self, id: JobId, action: CalendarAction) {
		if let Some(fire_at) = self.index.remove(&(id, action)) {
			self.entries.remove(&(fire_at, id, action));
		}
	}

	/// Drop every entry referencing a job, e.g. when it is deleted early.
	pub fn cancel_job(&mut self, id: JobId) {
		self.cancel(id, CalendarAction::RemoveJob);
	}

	/// The instant bounding the scheduler's next wait.
	pub fn next_deadline(&self) -> Option<Instant> {
		self.entries.iter().next().map(|&(fire_at, ..)| fire_at)
	}

	/// Remove and return every entry that is due at `now`, earliest first.
	pub fn take_due(&mut self, now: Instant) -> Vec<(JobId, CalendarAction)> {
		let mut due = Vec::new();

		loop {
			let Some(&(fire_at, id, action)) = self.entries.iter().next() else {
				break;
			};
			if fire_at > now {
				break;
			}

			self.entries.remove(&(fire_at, id, action));
			self.index.remove(&(id, action));
			due.push((id, action));
		}

		due
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
