mod common;

use std::time::Duration;

use depot_job_system::{
	BackgroundOptions, FaultKind, JobError, JobEvent, JobMetadata, JobOutcome, JobState,
	MetadataPatch, Priority, QueryParams,
};
use pretty_assertions::assert_eq;

use common::{engine_with_probe, fast_config, install_params, wait_finished};

#[tokio::test]
async fn foreground_call_returns_the_depot_value() {
	let (engine, probe) = engine_with_probe(fast_config());

	let value = engine
		.install(install_params("acme-tools"))
		.await
		.expect("install failed");

	assert_eq!(value["item"], "acme-tools");
	assert_eq!(probe.operations(), vec!["install acme-tools"]);

	engine.shutdown().await;
}

#[tokio::test]
async fn validation_errors_never_reach_the_queue() {
	let (engine, probe) = engine_with_probe(fast_config());

	let err = engine
		.install(install_params("   "))
		.await
		.expect_err("blank item must be rejected");
	assert!(matches!(err, JobError::InvalidParameters(_)));

	let err = engine
		.install_background(install_params(""), BackgroundOptions::default())
		.await
		.expect_err("blank item must be rejected");
	assert!(matches!(err, JobError::InvalidParameters(_)));

	assert!(engine.jobs().await.expect("list failed").is_empty());
	assert!(probe.operations().is_empty());

	engine.shutdown().await;
}

#[tokio::test]
async fn background_ids_increase_in_submission_order() {
	let (engine, _probe) = engine_with_probe(fast_config());

	let mut ids = Vec::new();
	for i in 0..8 {
		ids.push(
			engine
				.install_background(
					install_params(&format!("item-{i}")),
					BackgroundOptions::default(),
				)
				.await
				.expect("submission failed"),
		);
	}

	let mut sorted = ids.clone();
	sorted.sort();
	sorted.dedup();
	assert_eq!(ids, sorted);

	for id in ids {
		wait_finished(&engine, id).await;
	}

	engine.shutdown().await;
}

#[tokio::test]
async fn background_job_round_trips_through_the_registry() {
	let (engine, _probe) = engine_with_probe(fast_config());

	let id = engine
		.install_background(install_params("acme-tools"), BackgroundOptions::default())
		.await
		.expect("submission failed");

	let snapshot = wait_finished(&engine, id).await;
	assert_eq!(snapshot.state, JobState::Completed);

	match snapshot.outcome.expect("finished job carries an outcome") {
		JobOutcome::Success(value) => assert_eq!(value["item"], "acme-tools"),
		other => panic!("expected success, got {other:?}"),
	}

	// The metadata regenerates the description without re-querying the depot.
	assert_eq!(snapshot.metadata.method.as_deref(), Some("install"));
	assert!(snapshot.metadata.inputs.is_some());

	engine.shutdown().await;
}

#[tokio::test]
async fn jobs_run_by_priority_then_submission_order() {
	let (engine, probe) = engine_with_probe(fast_config());

	// Keep the worker busy so the next three submissions pile up in the
	// queue instead of dispatching one by one.
	probe.delay_item("blocker", Duration::from_millis(300));
	let blocker = engine
		.install_background(install_params("blocker"), BackgroundOptions::default())
		.await
		.expect("submission failed");

	let background = |priority| BackgroundOptions {
		priority,
		..Default::default()
	};

	let a = engine
		.install_background(install_params("a-item"), background(Priority(5)))
		.await
		.expect("submission failed");
	let b = engine
		.install_background(install_params("b-item"), background(Priority(1)))
		.await
		.expect("submission failed");
	let c = engine
		.install_background(install_params("c-item"), background(Priority(1)))
		.await
		.expect("submission failed");

	for id in [blocker, a, b, c] {
		wait_finished(&engine, id).await;
	}

	assert_eq!(
		probe.operations(),
		vec![
			"install blocker",
			"install b-item",
			"install c-item",
			"install a-item",
		]
	);

	// The queue piled up, yet the worker never saw two jobs at once.
	assert_eq!(probe.max_active(), 1);

	engine.shutdown().await;
}

#[tokio::test]
async fn set_priority_reorders_pending_jobs() {
	let (engine, probe) = engine_with_probe(fast_config());

	probe.delay_item("blocker", Duration::from_millis(300));
	let blocker = engine
		.install_background(install_params("blocker"), BackgroundOptions::default())
		.await
		.expect("submission failed");

	let background = |priority| BackgroundOptions {
		priority,
		..Default::default()
	};

	let x = engine
		.install_background(install_params("x-item"), background(Priority(5)))
		.await
		.expect("submission failed");
	let y = engine
		.install_background(install_params("y-item"), background(Priority(9)))
		.await
		.expect("submission failed");

	let snapshot = engine
		.set_job_priority(y, Priority(-5))
		.await
		.expect("set priority failed");
	assert_eq!(snapshot.priority, Priority(-5));

	for id in [blocker, x, y] {
		wait_finished(&engine, id).await;
	}

	assert_eq!(
		probe.operations(),
		vec!["install blocker", "install y-item", "install x-item"]
	);

	engine.shutdown().await;
}

#[tokio::test]
async fn terminating_a_new_job_never_contacts_the_worker() {
	let (engine, probe) = engine_with_probe(fast_config());

	probe.delay_item("blocker", Duration::from_millis(300));
	let blocker = engine
		.install_background(install_params("blocker"), BackgroundOptions::default())
		.await
		.expect("submission failed");

	let doomed = engine
		.install_background(install_params("doomed"), BackgroundOptions::default())
		.await
		.expect("submission failed");

	let snapshot = engine
		.terminate_job(doomed)
		.await
		.expect("terminating a queued job must succeed");
	assert_eq!(snapshot.state, JobState::Terminated);
	assert_eq!(snapshot.outcome, Some(JobOutcome::Terminated));

	wait_finished(&engine, blocker).await;

	// The spy confirms nothing for the terminated job reached the depot.
	assert_eq!(probe.operations(), vec!["install blocker"]);

	engine.shutdown().await;
}

#[tokio::test]
async fn terminating_a_running_job_is_a_state_error() {
	let (engine, probe) = engine_with_probe(fast_config());

	probe.delay_item("slow", Duration::from_millis(300));

	let id = engine
		.install_background(install_params("slow"), BackgroundOptions::default())
		.await
		.expect("submission failed");

	// Wait until the worker picked it up.
	loop {
		let snapshot = engine.job(id).await.expect("job lookup failed");
		if snapshot.state == JobState::Running {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	let err = engine
		.terminate_job(id)
		.await
		.expect_err("terminating a running job must fail");
	assert!(matches!(
		err,
		JobError::InvalidState {
			state: JobState::Running,
			..
		}
	));

	// The failed termination left the job untouched; it still completes.
	let snapshot = wait_finished(&engine, id).await;
	assert_eq!(snapshot.state, JobState::Completed);

	engine.shutdown().await;
}

#[tokio::test]
async fn delete_requires_a_finished_job() {
	let (engine, probe) = engine_with_probe(fast_config());

	probe.delay_item("slow", Duration::from_millis(200));
	let id = engine
		.install_background(install_params("slow"), BackgroundOptions::default())
		.await
		.expect("submission failed");

	let err = engine
		.delete_job(id)
		.await
		.expect_err("deleting an unfinished job must fail");
	assert!(matches!(err, JobError::InvalidState { .. }));

	wait_finished(&engine, id).await;

	engine.delete_job(id).await.expect("delete failed");
	assert!(matches!(
		engine.job(id).await,
		Err(JobError::NotFound(missing)) if missing == id
	));

	engine.shutdown().await;
}

#[tokio::test]
async fn retention_keeps_the_job_until_its_removal_time() {
	let (engine, _probe) = engine_with_probe(fast_config());

	let id = engine
		.install_background(
			install_params("ephemeral"),
			BackgroundOptions {
				delete_on_completion: true,
				time_before_removal: Some(Duration::from_millis(200)),
				..Default::default()
			},
		)
		.await
		.expect("submission failed");

	wait_finished(&engine, id).await;

	// Still present right after completion...
	assert!(engine.job(id).await.is_ok());

	// ...and reaped once the removal time elapsed.
	tokio::time::sleep(Duration::from_millis(400)).await;
	assert!(matches!(engine.job(id).await, Err(JobError::NotFound(_))));

	engine.shutdown().await;
}

#[tokio::test]
async fn reschedule_moves_the_removal_time() {
	let (engine, _probe) = engine_with_probe(fast_config());

	let id = engine
		.install_background(
			install_params("extended"),
			BackgroundOptions {
				delete_on_completion: true,
				time_before_removal: Some(Duration::from_millis(300)),
				..Default::default()
			},
		)
		.await
		.expect("submission failed");

	wait_finished(&engine, id).await;

	engine
		.reschedule_job_removal(id, true, Duration::from_millis(1000))
		.await
		.expect("reschedule failed");

	tokio::time::sleep(Duration::from_millis(500)).await;
	assert!(
		engine.job(id).await.is_ok(),
		"job reaped before its rescheduled removal time"
	);

	tokio::time::sleep(Duration::from_millis(900)).await;
	assert!(matches!(engine.job(id).await, Err(JobError::NotFound(_))));

	engine.shutdown().await;
}

#[tokio::test]
async fn metadata_names_jobs_and_patches_apply() {
	let (engine, _probe) = engine_with_probe(fast_config());

	let id = engine
		.verify_background(
			depot_job_system::VerifyParams {
				item: "acme-tools".into(),
			},
			BackgroundOptions {
				metadata: JobMetadata {
					name: Some("nightly-verify".into()),
					..Default::default()
				},
				..Default::default()
			},
		)
		.await
		.expect("submission failed");

	wait_finished(&engine, id).await;

	let snapshot = engine
		.job_by_name("nightly-verify")
		.await
		.expect("lookup by name failed");
	assert_eq!(snapshot.id, id);

	engine
		.update_job_metadata(
			id,
			MetadataPatch {
				name: Some("weekly-verify".into()),
				..Default::default()
			},
		)
		.await
		.expect("metadata update failed");

	assert!(engine.job_by_name("nightly-verify").await.is_err());
	assert_eq!(
		engine
			.job_by_name("weekly-verify")
			.await
			.expect("lookup by new name failed")
			.id,
		id
	);

	engine.shutdown().await;
}

#[tokio::test]
async fn depot_faults_surface_as_exception_results() {
	let (engine, probe) = engine_with_probe(fast_config());

	probe.fail_next(depot_job_system::Fault::new(
		FaultKind::AccessDenied,
		"depot is read-only",
	));

	let err = engine
		.remove(depot_job_system::RemoveParams {
			item: "acme-tools".into(),
		})
		.await
		.expect_err("fault must surface");

	match err {
		JobError::Fault(fault) => assert_eq!(fault.kind, FaultKind::AccessDenied),
		other => panic!("expected a fault, got {other}"),
	}

	// Background flavor of the same failure parks the job in exception
	// state instead of raising.
	probe.fail_next(depot_job_system::Fault::new(
		FaultKind::NotFound,
		"no such item",
	));

	let id = engine
		.remove_background(
			depot_job_system::RemoveParams {
				item: "ghost".into(),
			},
			BackgroundOptions::default(),
		)
		.await
		.expect("submission failed");

	let snapshot = wait_finished(&engine, id).await;
	assert_eq!(snapshot.state, JobState::Exception);
	match snapshot.outcome {
		Some(JobOutcome::Failed(fault)) => assert_eq!(fault.kind, FaultKind::NotFound),
		other => panic!("expected a failed outcome, got {other:?}"),
	}

	engine.shutdown().await;
}

#[tokio::test]
async fn depot_termination_is_not_an_error_state() {
	let (engine, probe) = engine_with_probe(fast_config());

	probe.terminate_next();
	let err = engine
		.install(install_params("acme-tools"))
		.await
		.expect_err("termination must raise for foreground callers");
	assert!(matches!(err, JobError::Terminated(_)));

	probe.terminate_next();
	let id = engine
		.install_background(install_params("acme-docs"), BackgroundOptions::default())
		.await
		.expect("submission failed");

	let snapshot = wait_finished(&engine, id).await;
	assert_eq!(snapshot.state, JobState::Terminated);
	assert_eq!(snapshot.outcome, Some(JobOutcome::Terminated));

	engine.shutdown().await;
}

#[tokio::test]
async fn lifecycle_events_carry_snapshots() {
	let (engine, _probe) = engine_with_probe(fast_config());
	let mut events = engine.events();

	let id = engine
		.install_background(install_params("observed"), BackgroundOptions::default())
		.await
		.expect("submission failed");

	wait_finished(&engine, id).await;

	let mut seen = Vec::new();
	while let Ok(Ok(event)) =
		tokio::time::timeout(Duration::from_millis(200), events.recv()).await
	{
		let state = event.snapshot().state;
		seen.push((
			match event {
				JobEvent::Created(_) => "created",
				JobEvent::Changed(_) => "changed",
				JobEvent::Succeeded(_) => "succeeded",
				JobEvent::Failed(_) => "failed",
			},
			state,
		));
	}

	assert_eq!(
		seen,
		vec![
			("created", JobState::New),
			("changed", JobState::Running),
			("changed", JobState::Completed),
			("succeeded", JobState::Completed),
		]
	);

	engine.shutdown().await;
}

#[tokio::test]
async fn query_snapshot_cache_follows_config_mtimes() {
	let (engine, probe) = engine_with_probe(fast_config());

	let dir = tempfile::tempdir().expect("tempdir");
	let config_path = dir.path().join("depot.conf");
	std::fs::write(&config_path, "channel = stable\n").expect("write config");
	probe.set_config_dir(dir.path().to_path_buf());

	let query = |pattern: &str| QueryParams {
		pattern: pattern.into(),
		installed_only: false,
	};

	let value = engine.query(query("acme-*")).await.expect("query failed");
	assert_eq!(value["catalog"]["items"][0], "acme-tools");
	assert_eq!(probe.snapshots(), 1);

	// Unchanged configuration: the cached snapshot is trusted.
	engine.query(query("acme-*")).await.expect("query failed");
	assert_eq!(probe.snapshots(), 1);

	// Touch the configuration; the next query must refresh the snapshot.
	tokio::time::sleep(Duration::from_millis(50)).await;
	std::fs::write(&config_path, "channel = testing\n").expect("rewrite config");

	engine.query(query("acme-*")).await.expect("query failed");
	assert_eq!(probe.snapshots(), 2);

	engine.shutdown().await;
}
