use std::collections::HashMap;

use super::job::{Job, JobId, JobSnapshot};

/// The scheduler's store of live execution jobs.
///
/// Foreground jobs are removed as soon as they finalize; background jobs
/// stay until explicitly deleted or reaped by the calendar. The control
/// surface only ever exposes background jobs.
#[derive(Debug, Default)]
pub(crate) struct Registry {
	jobs: HashMap<JobId, Job>,
}

impl Registry {
	pub fn insert(&mut self, job: Job) {
		let id = job.id();
		let previous = self.jobs.insert(id, job);
		assert!(previous.is_none(), "job registered twice <id='{id}'>");
	}

	pub fn get(&self, id: JobId) -> Option<&Job> {
		self.jobs.get(&id)
	}

	pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
		self.jobs.get_mut(&id)
	}

	pub fn remove(&mut self, id: JobId) -> Option<Job> {
		self.jobs.remove(&id)
	}

	pub fn background(&self, id: JobId) -> Option<&Job> {
		self.jobs.get(&id).filter(|job| job.is_background())
	}

	pub fn background_mut(&mut self, id: JobId) -> Option<&mut Job> {
		self.jobs.get_mut(&id).filter(|job| job.is_background())
	}

	pub fn background_by_name(&self, name: &str) -> Option<&Job> {
		self.jobs
			.values()
			.filter(|job| job.is_background())
			.filter(|job| job.name() == Some(name))
			.min_by_key(|job| job.id())
	}

	pub fn background_snapshots(&self) -> Vec<JobSnapshot> {
		let mut snapshots = self
			.jobs
			.values()
			.filter(|job| job.is_background())
			.map(Job::snapshot)
			.collect::<Vec<_>>();

		snapshots.sort_by_key(|snapshot| snapshot.id);

		snapshots
	}

	pub fn len(&self) -> usize {
		self.jobs.len()
	}
}
