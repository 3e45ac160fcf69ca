use {
	super::{
		CentralExecutor,
		frame::Owner,
		task::{RemoteTask, TaskError, TaskOutcome, TaskSpec},
	},
	crate::{channel::Channel, error::ChannelError},
	core::{marker::PhantomData, time::Duration},
	serde::de::DeserializeOwned,
	std::sync::{
		Arc,
		Mutex,
		atomic::{AtomicBool, Ordering},
	},
	tokio::sync::{mpsc, watch},
};

/// Submission facade over the executor protocol.
///
/// Each service instance tracks its own submissions: `shutdown` rejects
/// further submits on this instance, `shutdown_now` additionally
/// interrupts everything still outstanding, and `await_termination`
/// waits for those submissions to resolve. The protocol layer underneath
/// keeps serving other services on the same channel.
#[derive(Clone)]
pub struct ExecutionService {
	inner: Arc<ServiceInner>,
}

struct ServiceInner {
	executor: Arc<CentralExecutor>,
	shut_down: AtomicBool,
	submissions: Mutex<Vec<(Owner, watch::Receiver<Option<TaskOutcome>>)>>,
}

impl ExecutionService {
	pub fn new(channel: &Channel) -> Result<Self, ChannelError> {
		Ok(Self {
			inner: Arc::new(ServiceInner {
				executor: channel
					.stack()
					.find_by_type::<CentralExecutor>()
					.ok_or(ChannelError::NoExecutorProtocol)?,
				shut_down: AtomicBool::new(false),
				submissions: Mutex::new(Vec::new()),
			}),
		})
	}

	/// Submits a task for execution somewhere in the group.
	pub fn submit<T: RemoteTask>(
		&self,
		task: &T,
	) -> Result<TaskHandle<T::Output>, TaskError> {
		if self.inner.shut_down.load(Ordering::SeqCst) {
			return Err(TaskError::Rejected);
		}

		let payload = crate::encoding::serialize(&TaskSpec::of(task));
		let (owner, outcome, dispatched) =
			self.inner.executor.submit_raw(payload)?;

		self
			.inner
			.submissions
			.lock()
			.expect("service lock poisoned")
			.push((owner, outcome.clone()));

		Ok(TaskHandle {
			owner,
			outcome,
			dispatched,
			executor: Arc::clone(&self.inner.executor),
			_marker: PhantomData,
		})
	}

	/// Stops accepting submissions on this service instance.
	pub fn shutdown(&self) {
		self.inner.shut_down.store(true, Ordering::SeqCst);
	}

	/// Stops accepting submissions and interrupts everything outstanding.
	pub fn shutdown_now(&self) {
		self.shutdown();
		let submissions = self
			.inner
			.submissions
			.lock()
			.expect("service lock poisoned")
			.clone();
		for (owner, outcome) in submissions {
			if outcome.borrow().is_none() {
				self.inner.executor.request_cancel(owner, true);
			}
		}
	}

	/// Waits until every submission made through this instance has
	/// resolved. Returns `false` when the timeout elapses first.
	pub async fn await_termination(&self, timeout: Duration) -> bool {
		let submissions = self
			.inner
			.submissions
			.lock()
			.expect("service lock poisoned")
			.clone();
		let wait_all = async {
			for (_, mut outcome) in submissions {
				if outcome.wait_for(|o| o.is_some()).await.is_err() {
					// sender gone means resolved-and-removed
					continue;
				}
			}
		};
		tokio::time::timeout(timeout, wait_all).await.is_ok()
	}

	pub fn is_shut_down(&self) -> bool {
		self.inner.shut_down.load(Ordering::SeqCst)
	}
}

/// The submitter-side future of one task.
pub struct TaskHandle<R> {
	owner: Owner,
	outcome: watch::Receiver<Option<TaskOutcome>>,
	dispatched: watch::Receiver<bool>,
	executor: Arc<CentralExecutor>,
	_marker: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> TaskHandle<R> {
	pub fn owner(&self) -> Owner {
		self.owner
	}

	pub fn is_done(&self) -> bool {
		self.outcome.borrow().is_some()
	}

	/// Waits for the task to resolve and decodes its output.
	pub async fn join(mut self) -> Result<R, TaskError> {
		let outcome = self.wait_outcome().await?;
		match outcome {
			TaskOutcome::Ok(bytes) => crate::encoding::deserialize(&bytes)
				.map_err(|e| TaskError::Codec(e.to_string())),
			TaskOutcome::Err(text) => Err(TaskError::Failed(text)),
			TaskOutcome::Cancelled => Err(TaskError::Cancelled),
		}
	}

	/// Attempts to cancel the task.
	///
	/// Without `interrupt` only a task still queued at the coordinator
	/// can be cancelled; with it, a task already executing is interrupted
	/// at its next cancellation point. Returns `true` when the task
	/// resolved as cancelled; by then the coordinator has already purged
	/// it from its queues.
	pub async fn cancel(&mut self, interrupt: bool) -> bool {
		if self.is_done() {
			return false;
		}
		if !interrupt && *self.dispatched.borrow() {
			return false;
		}

		self.executor.request_cancel(self.owner, interrupt);

		if interrupt {
			return matches!(self.wait_outcome().await, Ok(TaskOutcome::Cancelled));
		}

		// resolves either way: cancelled in the queue, or the dispatch
		// beat the cancel to the coordinator
		let mut outcome = self.outcome.clone();
		let mut dispatched = self.dispatched.clone();
		tokio::select! {
			result = Self::wait_outcome_on(&mut outcome) => {
				matches!(result, Ok(TaskOutcome::Cancelled))
			}
			result = dispatched.wait_for(|d| *d) => match result {
				Ok(_) => false,
				Err(_) => matches!(
					&*self.outcome.borrow(),
					Some(TaskOutcome::Cancelled)
				),
			},
		}
	}

	async fn wait_outcome(&mut self) -> Result<TaskOutcome, TaskError> {
		Self::wait_outcome_on(&mut self.outcome).await
	}

	async fn wait_outcome_on(
		outcome: &mut watch::Receiver<Option<TaskOutcome>>,
	) -> Result<TaskOutcome, TaskError> {
		let value = outcome
			.wait_for(|o| o.is_some())
			.await
			.map_err(|_| TaskError::Failed("executor stopped".to_owned()))?;
		Ok(value.clone().expect("checked some"))
	}
}

/// A resolved submission delivered by the [`CompletionService`].
#[derive(Debug)]
pub struct CompletedTask<R> {
	pub owner: Owner,
	pub result: Result<R, TaskError>,
}

/// Delivers completed submissions in completion order, not submission
/// order.
pub struct CompletionService<R> {
	service: ExecutionService,
	completed_tx: mpsc::UnboundedSender<CompletedTask<R>>,
	completed_rx: mpsc::UnboundedReceiver<CompletedTask<R>>,
}

impl<R> CompletionService<R>
where
	R: DeserializeOwned + Send + 'static,
{
	pub fn new(service: &ExecutionService) -> Self {
		let (completed_tx, completed_rx) = mpsc::unbounded_channel();
		Self {
			service: service.clone(),
			completed_tx,
			completed_rx,
		}
	}

	/// Submits a task; its outcome will surface through `poll`/`take`.
	pub fn submit<T: RemoteTask<Output = R>>(
		&self,
		task: &T,
	) -> Result<Owner, TaskError> {
		let handle = self.service.submit(task)?;
		let owner = handle.owner();
		let tx = self.completed_tx.clone();
		tokio::spawn(async move {
			let result = handle.join().await;
			tx.send(CompletedTask { owner, result }).ok();
		});
		Ok(owner)
	}

	/// Next completed task, waiting at most `timeout`.
	pub async fn poll(&mut self, timeout: Duration) -> Option<CompletedTask<R>> {
		tokio::time::timeout(timeout, self.completed_rx.recv())
			.await
			.ok()
			.flatten()
	}

	/// Next completed task, waiting as long as it takes.
	pub async fn take(&mut self) -> Option<CompletedTask<R>> {
		self.completed_rx.recv().await
	}
}
