#![allow(unused)]

mod time;
mod tracing;

pub use time::*;

use {
	bytes::Bytes,
	flock::*,
	serde::{Deserialize, Serialize},
	std::sync::{Arc, Mutex},
	tokio::sync::watch,
};

/// Builds a channel over the bus with the default stack and connects it.
pub async fn connect(
	net: &LoopbackNet,
	cluster: &str,
) -> anyhow::Result<Channel> {
	connect_with_stack(net, cluster, DEFAULT_STACK).await
}

pub async fn connect_with_stack(
	net: &LoopbackNet,
	cluster: &str,
	stack: &str,
) -> anyhow::Result<Channel> {
	tracing::init_test_logging();
	let channel = Channel::with_stack(net, stack)?;
	channel.connect(cluster).await?;
	Ok(channel)
}

/// A receiver that remembers everything it was told, for assertions.
pub struct MemoryReceiver {
	/// The application state handed out to requesters.
	state: Mutex<Option<Bytes>>,

	messages: Mutex<Vec<Message>>,
	message_count: watch::Sender<usize>,
	views: Mutex<Vec<View>>,
	view_count: watch::Sender<usize>,

	/// Records every `set_state` callback.
	installed: Mutex<Vec<Option<Bytes>>>,
	installed_count: watch::Sender<usize>,
}

impl Default for MemoryReceiver {
	fn default() -> Self {
		Self {
			state: Mutex::new(None),
			messages: Mutex::new(Vec::new()),
			message_count: watch::Sender::new(0),
			views: Mutex::new(Vec::new()),
			view_count: watch::Sender::new(0),
			installed: Mutex::new(Vec::new()),
			installed_count: watch::Sender::new(0),
		}
	}
}

impl MemoryReceiver {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn with_state(state: impl Into<Bytes>) -> Arc<Self> {
		let receiver = Self::default();
		*receiver.state.lock().unwrap() = Some(state.into());
		Arc::new(receiver)
	}

	pub fn set_local_state(&self, state: impl Into<Bytes>) {
		*self.state.lock().unwrap() = Some(state.into());
	}

	pub fn messages(&self) -> Vec<Message> {
		self.messages.lock().unwrap().clone()
	}

	pub fn views(&self) -> Vec<View> {
		self.views.lock().unwrap().clone()
	}

	pub fn installed_states(&self) -> Vec<Option<Bytes>> {
		self.installed.lock().unwrap().clone()
	}

	/// Waits until at least `count` messages have been delivered.
	pub async fn wait_for_messages(&self, count: usize) -> bool {
		self
			.message_count
			.subscribe()
			.wait_for(|c| *c >= count)
			.await
			.is_ok()
	}

	pub async fn wait_for_installed_state(&self, count: usize) -> bool {
		self
			.installed_count
			.subscribe()
			.wait_for(|c| *c >= count)
			.await
			.is_ok()
	}
}

impl Receiver for MemoryReceiver {
	fn receive(&self, msg: Message) {
		let mut messages = self.messages.lock().unwrap();
		messages.push(msg);
		self.message_count.send_replace(messages.len());
	}

	fn view_accepted(&self, view: &View) {
		let mut views = self.views.lock().unwrap();
		views.push(view.clone());
		self.view_count.send_replace(views.len());
	}

	fn get_state(&self) -> Option<Bytes> {
		self.state.lock().unwrap().clone()
	}

	fn set_state(&self, state: Option<Bytes>) {
		let mut installed = self.installed.lock().unwrap();
		installed.push(state);
		self.installed_count.send_replace(installed.len());
	}
}

/// Returns its value, for exercising the submit/dispatch/result loop.
#[derive(Debug, Serialize, Deserialize)]
pub struct Echo {
	pub value: u64,
}

impl RemoteTask for Echo {
	const KIND: &'static str = "echo";

	type Output = u64;

	async fn run(&self, _cx: &TaskContext) -> Result<u64, TaskError> {
		Ok(self.value)
	}
}

/// Sleeps for the given duration, reporting cancellation cooperatively.
#[derive(Debug, Serialize, Deserialize)]
pub struct Sleeper {
	pub millis: u64,
}

impl RemoteTask for Sleeper {
	const KIND: &'static str = "sleeper";

	type Output = u64;

	async fn run(&self, cx: &TaskContext) -> Result<u64, TaskError> {
		tokio::select! {
			() = tokio::time::sleep(core::time::Duration::from_millis(self.millis)) => {
				Ok(self.millis)
			}
			() = cx.cancelled() => Err(TaskError::Cancelled),
		}
	}
}
