use std::{cmp::Reverse, collections::BinaryHeap};

use super::job::{Job, JobId, Priority};

/// Scheduling lane: control jobs always run ahead of execution jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Lane {
	Control,
	Execution,
}

/// What popping the queue yields. Control jobs are owned by their queue
/// entry; execution jobs live in the registry and are referenced by id.
#[derive(Debug)]
pub(crate) enum QueueEntry {
	Control(Job),
	Execution(JobId),
}

#[derive(Debug)]
struct Pending {
	lane: Lane,
	priority: Priority,
	id: JobId,
	entry: QueueEntry,
}

// Ordering ignores the payload: (lane, priority, id). Ids follow creation
// order, so the id tie-break also resolves equal-priority submissions by
// creation time.
impl PartialEq for Pending {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for Pending {}

impl PartialOrd for Pending {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Pending {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(self.lane, self.priority, self.id).cmp(&(other.lane, other.priority, other.id))
	}
}

/// Priority queue of jobs waiting to be dispatched by the scheduler loop.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
	heap: BinaryHeap<Reverse<Pending>>,
}

impl JobQueue {
	pub fn push_control(&mut self, job: Job) {
		self.heap.push(Reverse(Pending {
			lane: Lane::Control,
			priority: job.priority(),
			id: job.id(),
			entry: QueueEntry::Control(job),
		}));
	}

	pub fn push_execution(&mut self, job: &Job) {
		self.heap.push(Reverse(Pending {
			lane: Lane::Execution,
			priority: job.priority(),
			id: job.id(),
			entry: QueueEntry::Execution(job.id()),
		}));
	}

	pub fn peek_lane(&self) -> Option<Lane> {
		self.heap.peek().map(|Reverse(pending)| pending.lane)
	}

	pub fn pop(&mut self) -> Option<QueueEntry> {
		self.heap.pop().map(|Reverse(pending)| pending.entry)
	}

	/// Drop the pending entry for a job that will never run.
	pub fn remove(&mut self, id: JobId) {
		self.rebuild(|pending| pending.id != id, id, None);
	}

	/// Re-heapify after a priority change on a still-pending job. Returns
	/// whether the job was found in the queue.
	pub fn reprioritize(&mut self, id: JobId, priority: Priority) -> bool {
		self.rebuild(|_| true, id, Some(priority))
	}

	fn rebuild(
		&mut self,
		keep: impl Fn(&Pending) -> bool,
		id: JobId,
		new_priority: Option<Priority>,
	) -> bool {
		let mut found = false;

		self.heap = self
			.heap
			.drain()
			.filter_map(|Reverse(mut pending)| {
				if pending.id == id {
					found = true;
					if !keep(&pending) {
						return None;
					}
					if let Some(priority) = new_priority {
						pending.priority = priority;
					}
				}

				Some(Reverse(pending))
			})
			.collect();

		found
	}

	pub fn len(&self) -> usize {
		self.heap.len()
	}

	pub fn is_empty(&self) -> bool {
		self.heap.is_empty()
	}
}
