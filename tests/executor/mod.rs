//! Distributed executor end-to-end tests.

use {
	crate::utils::{self, Echo, Sleeper, timeout_s, wait_until},
	core::time::Duration,
	flock::*,
	std::sync::Arc,
};

fn executor_protocol(channel: &Channel) -> Arc<CentralExecutor> {
	channel
		.stack()
		.find_by_type::<CentralExecutor>()
		.expect("stack has an executor layer")
}

#[tokio::test]
async fn submit_executes_on_a_remote_consumer() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let a = utils::connect(&net, "simple_submit").await?;
	let b = utils::connect(&net, "simple_submit").await?;

	let runner = ExecutionRunner::new(&b)?.with_task::<Echo>().spawn();

	let service = ExecutionService::new(&a)?;
	let handle = service.submit(&Echo { value: 100 })?;
	let value = timeout_s(5, handle.join()).await.expect("no result")?;
	assert_eq!(value, 100);

	runner.stop();
	Ok(())
}

#[tokio::test]
async fn concurrent_submissions_all_resolve() -> anyhow::Result<()> {
	const COUNT: u64 = 20;

	let net = LoopbackNet::new();
	let a = utils::connect(&net, "concurrent").await?;
	let b = utils::connect(&net, "concurrent").await?;
	let c = utils::connect(&net, "concurrent").await?;

	let _r1 = ExecutionRunner::new(&a)?.with_task::<Echo>().spawn();
	let _r2 = ExecutionRunner::new(&b)?.with_task::<Echo>().spawn();
	let _r3 = ExecutionRunner::new(&c)?.with_task::<Echo>().spawn();

	let services = [
		ExecutionService::new(&a)?,
		ExecutionService::new(&b)?,
		ExecutionService::new(&c)?,
	];

	let mut handles = Vec::new();
	for i in 0..COUNT {
		for service in &services {
			handles.push((i, service.submit(&Echo { value: i })?));
		}
	}
	for (expected, handle) in handles {
		let value = timeout_s(10, handle.join()).await.expect("no result")?;
		assert_eq!(value, expected);
	}

	Ok(())
}

#[tokio::test]
async fn completion_service_delivers_in_completion_order() -> anyhow::Result<()>
{
	let net = LoopbackNet::new();
	let a = utils::connect(&net, "completion_order").await?;
	let b = utils::connect(&net, "completion_order").await?;
	let c = utils::connect(&net, "completion_order").await?;

	let _r1 = ExecutionRunner::new(&b)?.with_task::<Sleeper>().spawn();
	let _r2 = ExecutionRunner::new(&c)?.with_task::<Sleeper>().spawn();

	// both consumers must be known to the coordinator before submitting,
	// otherwise the two tasks serialize on one runner
	let coordinator = executor_protocol(&a);
	assert!(
		wait_until(Duration::from_secs(2), || {
			coordinator.consumers_snapshot().len() == 2
		})
		.await
	);

	let service = ExecutionService::new(&a)?;
	let mut completion = CompletionService::new(&service);

	let slow = completion.submit(&Sleeper { millis: 300 })?;
	let fast = completion.submit(&Sleeper { millis: 100 })?;

	let first = timeout_s(5, completion.take()).await.expect("no completion");
	let second = timeout_s(5, completion.take()).await.expect("no completion");
	let (first, second) = (first.unwrap(), second.unwrap());

	assert_eq!(first.owner, fast, "the shorter task completes first");
	assert_eq!(second.owner, slow);
	assert_eq!(first.result.unwrap(), 100);
	assert_eq!(second.result.unwrap(), 300);

	Ok(())
}

#[tokio::test]
async fn cancel_before_dispatch_purges_the_queue() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let a = utils::connect(&net, "cancel_queued").await?;

	// no consumers anywhere: the task stays queued at the coordinator
	let service = ExecutionService::new(&a)?;
	let mut handle = service.submit(&Sleeper { millis: 10_000 })?;
	let owner = handle.owner();

	let coordinator = executor_protocol(&a);
	assert!(
		wait_until(Duration::from_secs(2), || {
			coordinator.awaiting_consumer_snapshot().contains(&owner)
		})
		.await
	);
	assert!(coordinator.run_requests_snapshot().contains(&owner));

	let cancelled = timeout_s(5, handle.cancel(false)).await.expect("cancel hung");
	assert!(cancelled);

	// the cancel has returned: the queues are already purged
	assert!(coordinator.awaiting_consumer_snapshot().is_empty());
	assert!(coordinator.run_requests_snapshot().is_empty());

	assert!(matches!(
		timeout_s(2, handle.join()).await.expect("join hung"),
		Err(TaskError::Cancelled)
	));
	Ok(())
}

#[tokio::test]
async fn cancel_with_interrupt_stops_a_running_task() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let a = utils::connect(&net, "cancel_running").await?;
	let b = utils::connect(&net, "cancel_running").await?;

	let _runner = ExecutionRunner::new(&b)?.with_task::<Sleeper>().spawn();

	let service = ExecutionService::new(&a)?;
	let mut handle = service.submit(&Sleeper { millis: 10_000 })?;
	let owner = handle.owner();

	// wait until the coordinator has handed the task to the consumer
	let coordinator = executor_protocol(&a);
	assert!(
		wait_until(Duration::from_secs(2), || {
			coordinator
				.dispatched_snapshot()
				.iter()
				.any(|(o, _)| *o == owner)
		})
		.await
	);

	// plain cancel is too late now
	assert!(!handle.cancel(false).await);

	let cancelled =
		timeout_s(5, handle.cancel(true)).await.expect("cancel hung");
	assert!(cancelled, "interrupt cancel failed");

	Ok(())
}

#[tokio::test]
async fn coordinator_failover_preserves_a_request_exactly_once()
-> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let a = utils::connect(&net, "failover").await?;
	let b = utils::connect(&net, "failover").await?;
	let c = utils::connect(&net, "failover").await?;

	let b_addr = b.address().unwrap();

	// hold B's run request just before transmit
	let exec_b = executor_protocol(&b);
	exec_b.pause_run_requests();

	let service = ExecutionService::new(&b)?;
	let handle = service.submit(&Echo { value: 23 })?;
	assert_eq!(handle.owner().address, b_addr);
	assert_eq!(handle.owner().request_id, 0);

	// the old coordinator goes away while the request is in limbo
	a.close();
	assert!(
		wait_until(Duration::from_secs(2), || {
			b.view().is_some_and(|v| v.coordinator() == Some(b_addr))
		})
		.await
	);

	exec_b.resume_run_requests();

	// exactly one copy of the request lands on the new coordinator
	assert!(
		wait_until(Duration::from_secs(2), || {
			!exec_b.run_requests_snapshot().is_empty()
		})
		.await
	);
	let requests = exec_b.run_requests_snapshot();
	assert_eq!(requests.len(), 1, "request duplicated: {requests:?}");
	assert_eq!(requests[0].address, b_addr);
	assert_eq!(requests[0].request_id, 0);
	assert_eq!(exec_b.awaiting_consumer_snapshot(), requests);

	// and the group can still execute it
	let _runner = ExecutionRunner::new(&c)?.with_task::<Echo>().spawn();
	let value = timeout_s(5, handle.join()).await.expect("no result")?;
	assert_eq!(value, 23);

	Ok(())
}

#[tokio::test]
async fn shutdown_rejects_further_submissions() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let a = utils::connect(&net, "shutdown").await?;
	let b = utils::connect(&net, "shutdown").await?;

	let _runner = ExecutionRunner::new(&b)?.with_task::<Sleeper>().spawn();

	let service = ExecutionService::new(&a)?;
	let handle = service.submit(&Sleeper { millis: 100 })?;

	service.shutdown();
	assert!(matches!(
		service.submit(&Sleeper { millis: 1 }),
		Err(TaskError::Rejected)
	));

	assert!(service.await_termination(Duration::from_secs(2)).await);
	assert_eq!(timeout_s(2, handle.join()).await.expect("join hung")?, 100);
	Ok(())
}

#[tokio::test]
async fn shutdown_now_interrupts_outstanding_tasks() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let a = utils::connect(&net, "shutdown_now").await?;
	let b = utils::connect(&net, "shutdown_now").await?;

	let _runner = ExecutionRunner::new(&b)?.with_task::<Sleeper>().spawn();

	let service = ExecutionService::new(&a)?;
	let handle = service.submit(&Sleeper { millis: 10_000 })?;
	let owner = handle.owner();

	let coordinator = executor_protocol(&a);
	assert!(
		wait_until(Duration::from_secs(2), || {
			coordinator
				.dispatched_snapshot()
				.iter()
				.any(|(o, _)| *o == owner)
		})
		.await
	);

	service.shutdown_now();
	assert!(service.await_termination(Duration::from_secs(2)).await);
	assert!(matches!(
		timeout_s(2, handle.join()).await.expect("join hung"),
		Err(TaskError::Cancelled)
	));
	Ok(())
}

#[tokio::test]
async fn unregistered_task_kinds_fail_back_to_the_owner() -> anyhow::Result<()>
{
	let net = LoopbackNet::new();
	let a = utils::connect(&net, "unknown_kind").await?;
	let b = utils::connect(&net, "unknown_kind").await?;

	// the runner knows about sleepers only
	let _runner = ExecutionRunner::new(&b)?.with_task::<Sleeper>().spawn();

	let service = ExecutionService::new(&a)?;
	let handle = service.submit(&Echo { value: 1 })?;
	match timeout_s(5, handle.join()).await.expect("join hung") {
		Err(TaskError::Failed(text)) => {
			assert!(text.contains("no task registered"), "unexpected: {text}");
		}
		other => panic!("expected a task failure, got {other:?}"),
	}
	Ok(())
}

#[tokio::test]
async fn submitting_without_a_connection_is_rejected() -> anyhow::Result<()> {
	let net = LoopbackNet::new();
	let a = Channel::new(&net)?;
	let service = ExecutionService::new(&a)?;
	assert!(matches!(
		service.submit(&Echo { value: 1 }),
		Err(TaskError::NotConnected)
	));
	Ok(())
}
