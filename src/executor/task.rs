use {
	super::frame::Owner,
	bytes::Bytes,
	futures::{FutureExt, future::BoxFuture},
	serde::{Deserialize, Serialize, de::DeserializeOwned},
	std::{
		collections::HashMap,
		sync::{Arc, RwLock},
	},
	tokio_util::sync::CancellationToken,
};

/// How a task submission can fail or finish abnormally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
	#[error("executor has been shut down")]
	Rejected,

	#[error("channel is not connected to a cluster")]
	NotConnected,

	#[error("task was cancelled")]
	Cancelled,

	#[error("task failed: {0}")]
	Failed(String),

	#[error("task codec error: {0}")]
	Codec(String),
}

/// Handed to a running task: its owner identity and the cancellation
/// token that stands in for thread interruption. Long-running tasks
/// should check it at cooperative points; regardless, the runner drops
/// the task future when the token fires.
pub struct TaskContext {
	owner: Owner,
	cancel: CancellationToken,
}

impl TaskContext {
	pub(crate) fn new(owner: Owner, cancel: CancellationToken) -> Self {
		Self { owner, cancel }
	}

	pub fn owner(&self) -> Owner {
		self.owner
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	pub async fn cancelled(&self) {
		self.cancel.cancelled().await;
	}
}

/// A unit of work that can be shipped to any consumer in the group.
///
/// The task value itself is serialized; the consumer reconstructs it from
/// the registered `KIND`, the portable carrier for callables that do not
/// travel as code.
pub trait RemoteTask:
	Serialize + DeserializeOwned + Send + Sync + 'static
{
	/// Registry name under which consumers reconstruct this task.
	const KIND: &'static str;

	type Output: Serialize + DeserializeOwned + Send + 'static;

	fn run(
		&self,
		cx: &TaskContext,
	) -> impl Future<Output = Result<Self::Output, TaskError>> + Send;
}

/// How one submission ended, as observed by the submitter.
#[derive(Debug, Clone)]
pub(crate) enum TaskOutcome {
	Ok(Bytes),
	Err(String),
	Cancelled,
}

/// The wire form of a submission: the registered kind plus the task's
/// serialized fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TaskSpec {
	pub kind: String,
	pub args: Bytes,
}

impl TaskSpec {
	pub(crate) fn of<T: RemoteTask>(task: &T) -> Self {
		Self {
			kind: T::KIND.to_owned(),
			args: crate::encoding::serialize(task),
		}
	}
}

type RunFn = Arc<
	dyn Fn(Bytes, TaskContext) -> BoxFuture<'static, Result<Bytes, TaskError>>
		+ Send
		+ Sync,
>;

/// Maps task kinds to reconstructors on the consumer side. Submitter and
/// consumer must agree on the registered kinds.
#[derive(Clone, Default)]
pub struct TaskRegistry {
	inner: Arc<RwLock<HashMap<String, RunFn>>>,
}

impl TaskRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register<T: RemoteTask>(&self) {
		let run: RunFn = Arc::new(|args, cx| {
			async move {
				let task: T = crate::encoding::deserialize(&args)
					.map_err(|e| TaskError::Codec(e.to_string()))?;
				let output = task.run(&cx).await?;
				Ok(crate::encoding::serialize(&output))
			}
			.boxed()
		});
		self
			.inner
			.write()
			.expect("registry lock poisoned")
			.insert(T::KIND.to_owned(), run);
	}

	pub(crate) async fn run(
		&self,
		kind: &str,
		args: Bytes,
		cx: TaskContext,
	) -> Result<Bytes, TaskError> {
		let run = self
			.inner
			.read()
			.expect("registry lock poisoned")
			.get(kind)
			.cloned()
			.ok_or_else(|| {
				TaskError::Failed(format!("no task registered under kind `{kind}`"))
			})?;
		run(args, cx).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Serialize, Deserialize)]
	struct Doubler {
		value: u32,
	}

	impl RemoteTask for Doubler {
		const KIND: &'static str = "doubler";

		type Output = u32;

		async fn run(&self, _cx: &TaskContext) -> Result<u32, TaskError> {
			Ok(self.value * 2)
		}
	}

	#[tokio::test]
	async fn registry_reconstructs_and_runs() {
		let registry = TaskRegistry::new();
		registry.register::<Doubler>();

		let spec = TaskSpec::of(&Doubler { value: 21 });
		let cx = TaskContext::new(
			Owner {
				address: crate::address::Address::from("a"),
				request_id: 0,
			},
			CancellationToken::new(),
		);

		let out = registry.run(&spec.kind, spec.args, cx).await.unwrap();
		let decoded: u32 = crate::encoding::deserialize(&out).unwrap();
		assert_eq!(decoded, 42);
	}

	#[tokio::test]
	async fn unknown_kind_fails() {
		let registry = TaskRegistry::new();
		let cx = TaskContext::new(
			Owner {
				address: crate::address::Address::from("a"),
				request_id: 0,
			},
			CancellationToken::new(),
		);
		let err = registry
			.run("nope", Bytes::new(), cx)
			.await
			.unwrap_err();
		assert!(matches!(err, TaskError::Failed(_)));
	}
}
