use {
	super::{
		CentralExecutor,
		DispatchedTask,
		frame::Owner,
		task::{
			RemoteTask,
			TaskContext,
			TaskError,
			TaskOutcome,
			TaskRegistry,
			TaskSpec,
		},
	},
	crate::{channel::Channel, error::ChannelError},
	std::sync::{Arc, atomic::Ordering},
	tokio_util::sync::CancellationToken,
};

/// A consumer worker.
///
/// Advertises readiness to the coordinator, executes the tasks dispatched
/// to it one at a time and re-advertises after each completion. Stopping
/// the runner unregisters the consumer and exits the loop.
pub struct ExecutionRunner {
	executor: Arc<CentralExecutor>,
	registry: TaskRegistry,
}

impl ExecutionRunner {
	pub fn new(channel: &Channel) -> Result<Self, ChannelError> {
		Ok(Self {
			executor: channel
				.stack()
				.find_by_type::<CentralExecutor>()
				.ok_or(ChannelError::NoExecutorProtocol)?,
			registry: TaskRegistry::new(),
		})
	}

	/// Makes a task kind executable by this runner. Submissions of
	/// unregistered kinds fail back to their owner.
	#[must_use]
	pub fn with_task<T: RemoteTask>(self) -> Self {
		self.registry.register::<T>();
		self
	}

	/// Spawns the runner loop and returns a guard that stops it.
	pub fn spawn(self) -> RunnerGuard {
		let cancel = CancellationToken::new();
		let guard = RunnerGuard {
			cancel: cancel.clone(),
		};
		tokio::spawn(self.run(cancel));
		guard
	}

	/// The consumer loop. Runs until the token is cancelled.
	pub async fn run(self, cancel: CancellationToken) {
		let registration = match self.executor.register_runner() {
			Ok(registration) => registration,
			Err(e) => {
				tracing::warn!(error = %e, "runner could not register");
				return;
			}
		};
		let consumer = registration.consumer;
		let busy = registration.busy;
		let mut tasks = registration.tasks;

		tracing::debug!(%consumer, "runner started");
		loop {
			tokio::select! {
				() = cancel.cancelled() => break,
				task = tasks.recv() => {
					let Some(task) = task else { break };
					busy.store(true, Ordering::SeqCst);
					self.execute(task).await;
					busy.store(false, Ordering::SeqCst);
					self.executor.advertise_ready(consumer);
				}
			}
		}

		tracing::debug!(%consumer, "runner stopping");
		self.executor.unregister_runner(consumer);
	}

	async fn execute(&self, task: DispatchedTask) {
		let owner = task.owner;
		let outcome = self.execute_inner(owner, task.payload).await;
		self.executor.send_result(owner, &outcome);
	}

	async fn execute_inner(
		&self,
		owner: Owner,
		payload: bytes::Bytes,
	) -> TaskOutcome {
		let spec: TaskSpec = match crate::encoding::deserialize(&payload) {
			Ok(spec) => spec,
			Err(e) => return TaskOutcome::Err(format!("undecodable task: {e}")),
		};

		let cancel = CancellationToken::new();
		self.executor.note_running(owner, cancel.clone());
		if cancel.is_cancelled() {
			// cancelled before we even started
			self.executor.clear_running(owner);
			return TaskOutcome::Cancelled;
		}

		let cx = TaskContext::new(owner, cancel.clone());
		tracing::debug!(%owner, kind = %spec.kind, "executing task");

		// dropping the future at the cancellation point is the async
		// analog of interrupting the executing thread
		let result = tokio::select! {
			result = self.registry.run(&spec.kind, spec.args, cx) => result,
			() = cancel.cancelled() => Err(TaskError::Cancelled),
		};
		self.executor.clear_running(owner);

		match result {
			Ok(bytes) => TaskOutcome::Ok(bytes),
			Err(TaskError::Cancelled) => TaskOutcome::Cancelled,
			Err(e) => TaskOutcome::Err(e.to_string()),
		}
	}
}

/// Stops the spawned runner, explicitly or when dropped.
pub struct RunnerGuard {
	cancel: CancellationToken,
}

impl RunnerGuard {
	pub fn stop(&self) {
		self.cancel.cancel();
	}
}

impl Drop for RunnerGuard {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}
