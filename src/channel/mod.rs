//! The channel facade.
//!
//! A channel owns one protocol stack and is the application's only handle
//! on it: connect and disconnect, send, fetch group state, observe views
//! and messages through a registered [`Receiver`].
//!
//! Lifecycle: a channel is `OPEN` after construction, `CONNECTED` after
//! `connect`, back to `OPEN` after `disconnect`, and irrevocably `CLOSED`
//! after `close`; every operation on a closed channel fails.

mod receiver;

pub use receiver::{NullReceiver, Receiver};

use {
	crate::{
		address::Address,
		config::StackConfig,
		error::ChannelError,
		event::{Event, EventKind, StateTransferInfo},
		message::Message,
		net::LoopbackNet,
		stack::{ProtocolStack, UpHandler, registry},
		state_transfer::StateTransfer,
		view::View,
	},
	bytes::Bytes,
	core::time::Duration,
	std::sync::{Arc, Mutex, RwLock},
	tokio::sync::{mpsc, oneshot, watch},
	tokio_util::sync::CancellationToken,
};

/// Event tags the channel honors when they pass over the top of the
/// stack. Used to validate the protocols' required up services.
const CHANNEL_UP_SERVICES: &[EventKind] = &[
	EventKind::Msg,
	EventKind::ViewChange,
	EventKind::TmpView,
	EventKind::Config,
	EventKind::SetLocalAddress,
	EventKind::GetApplState,
	EventKind::GetStateOk,
];

/// The default protocol chain, transport first.
pub const DEFAULT_STACK: &str = "loopback:fifo:state-transfer:executor";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
	Open,
	Connected { cluster: String },
	Closed,
}

pub struct Channel {
	core: Arc<ChannelCore>,
}

struct ChannelCore {
	stack: ProtocolStack,
	phase: Mutex<Phase>,
	local: watch::Sender<Option<Address>>,
	view: watch::Sender<Option<View>>,
	receiver: RwLock<Option<Arc<dyn Receiver>>>,
	pending_state: Mutex<Option<oneshot::Sender<StateTransferInfo>>>,
	deliveries: mpsc::UnboundedSender<Delivery>,
	cancel: CancellationToken,
}

/// Callbacks queued for the per-channel delivery task, so protocol
/// threads never run application code except the inline `get_state`.
enum Delivery {
	Message(Message),
	View(View),
	State(Option<Bytes>),
}

impl Channel {
	/// Builds a channel over the given bus with the default stack.
	pub fn new(net: &LoopbackNet) -> Result<Self, ChannelError> {
		Self::with_stack(net, DEFAULT_STACK)
	}

	/// Builds a channel from a stack configuration input: the flat string
	/// form or a path to a file containing it.
	///
	/// Configuration problems (unknown protocols or properties, missing
	/// required services, two state-transfer layers) all fail here.
	pub fn with_stack(
		net: &LoopbackNet,
		stack: &str,
	) -> Result<Self, ChannelError> {
		let config = StackConfig::resolve(stack)?;

		let mut protocols = Vec::with_capacity(config.protocols.len());
		for descriptor in &config.protocols {
			let cx = registry::BuildContext {
				net: net.clone(),
				properties: descriptor.properties.clone(),
			};
			protocols.push(registry::build(&descriptor.name, &cx)?);
		}
		// the configuration lists the transport first; the stack wants
		// top first
		protocols.reverse();
		let stack = ProtocolStack::new(protocols);
		stack.validate(CHANNEL_UP_SERVICES)?;

		let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
		let core = Arc::new(ChannelCore {
			stack,
			phase: Mutex::new(Phase::Open),
			local: watch::Sender::new(None),
			view: watch::Sender::new(None),
			receiver: RwLock::new(None),
			pending_state: Mutex::new(None),
			deliveries: deliveries_tx,
			cancel: CancellationToken::new(),
		});
		let core_dyn: Arc<dyn UpHandler> = core.clone();
		let top: std::sync::Weak<dyn UpHandler> = Arc::downgrade(&core_dyn);
		core.stack.set_top_handler(top);
		core.stack.start()?;
		core.spawn_delivery_task(deliveries_rx);

		Ok(Self { core })
	}

	/// Joins the named cluster and waits for the first view that lists
	/// this node. Connecting an already connected channel is a no-op.
	pub async fn connect(&self, cluster: &str) -> Result<(), ChannelError> {
		{
			let phase = self.core.phase.lock().expect("channel lock poisoned");
			match &*phase {
				Phase::Closed => return Err(ChannelError::Closed),
				Phase::Connected { .. } => return Ok(()),
				Phase::Open => {}
			}
		}

		self.core.stack.down(Event::Connect(cluster.to_owned()));

		let local =
			(*self.core.local.borrow()).ok_or(ChannelError::NotConnected)?;
		let mut view = self.core.view.subscribe();
		view
			.wait_for(|v| v.as_ref().is_some_and(|v| v.contains(&local)))
			.await
			.map_err(|_| ChannelError::Closed)?;

		*self.core.phase.lock().expect("channel lock poisoned") =
			Phase::Connected {
				cluster: cluster.to_owned(),
			};
		tracing::debug!(%local, cluster, "connected");
		Ok(())
	}

	/// Leaves the cluster. The channel can connect again afterwards.
	pub fn disconnect(&self) {
		{
			let mut phase = self.core.phase.lock().expect("channel lock poisoned");
			match &*phase {
				Phase::Connected { .. } => {}
				_ => return,
			}
			*phase = Phase::Open;
		}
		self.core.stack.down(Event::Disconnect);
		self.core.local.send_replace(None);
		self.core.view.send_replace(None);
	}

	/// Disconnects and releases the stack. Terminal: every subsequent
	/// operation fails with a channel-closed error.
	pub fn close(&self) {
		{
			let phase = self.core.phase.lock().expect("channel lock poisoned");
			if *phase == Phase::Closed {
				return;
			}
		}
		self.disconnect();
		self.core.stack.stop();
		self.core.cancel.cancel();
		*self.core.phase.lock().expect("channel lock poisoned") = Phase::Closed;
	}

	/// Sends a message into the group.
	pub fn send(&self, msg: Message) -> Result<(), ChannelError> {
		self.ensure_connected()?;
		self.core.stack.down(Event::Msg(msg));
		Ok(())
	}

	/// Fetches the group state from `target`, or from the coordinator
	/// when `target` is `None`.
	///
	/// Resolves with `Ok(None)` when this node is the only member or the
	/// provider crashed mid-transfer; times out with an error when no
	/// response arrives in time.
	pub async fn get_state(
		&self,
		target: Option<Address>,
		timeout: Duration,
	) -> Result<Option<Bytes>, ChannelError> {
		self.ensure_connected()?;
		if self.core.stack.find_by_type::<StateTransfer>().is_none() {
			return Err(ChannelError::NoStateProtocol);
		}

		let rx = {
			let mut pending = self
				.core
				.pending_state
				.lock()
				.expect("channel lock poisoned");
			if pending.is_some() {
				return Err(ChannelError::StateTransferInProgress);
			}
			let (tx, rx) = oneshot::channel();
			*pending = Some(tx);
			rx
		};

		self
			.core
			.stack
			.down(Event::GetState(StateTransferInfo::request(target, timeout)));

		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(info)) => Ok(info.state),
			Ok(Err(_)) => Err(ChannelError::Closed),
			Err(_) => {
				self
					.core
					.pending_state
					.lock()
					.expect("channel lock poisoned")
					.take();
				Err(ChannelError::StateTransferTimeout)
			}
		}
	}

	pub fn set_receiver(&self, receiver: Arc<dyn Receiver>) {
		*self.core.receiver.write().expect("channel lock poisoned") =
			Some(receiver);
	}

	pub fn address(&self) -> Option<Address> {
		*self.core.local.borrow()
	}

	pub fn view(&self) -> Option<View> {
		self.core.view.borrow().clone()
	}

	pub fn cluster_name(&self) -> Option<String> {
		match &*self.core.phase.lock().expect("channel lock poisoned") {
			Phase::Connected { cluster } => Some(cluster.clone()),
			_ => None,
		}
	}

	pub fn is_open(&self) -> bool {
		*self.core.phase.lock().expect("channel lock poisoned") != Phase::Closed
	}

	pub fn is_connected(&self) -> bool {
		matches!(
			&*self.core.phase.lock().expect("channel lock poisoned"),
			Phase::Connected { .. }
		)
	}

	/// The protocol stack, for locating protocol layers.
	pub fn stack(&self) -> &ProtocolStack {
		&self.core.stack
	}

	fn ensure_connected(&self) -> Result<(), ChannelError> {
		match &*self.core.phase.lock().expect("channel lock poisoned") {
			Phase::Closed => Err(ChannelError::Closed),
			Phase::Open => Err(ChannelError::NotConnected),
			Phase::Connected { .. } => Ok(()),
		}
	}
}

impl Drop for Channel {
	fn drop(&mut self) {
		self.close();
	}
}

impl ChannelCore {
	fn spawn_delivery_task(
		self: &Arc<Self>,
		mut deliveries: mpsc::UnboundedReceiver<Delivery>,
	) {
		let core = Arc::clone(self);
		let cancel = self.cancel.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					() = cancel.cancelled() => break,
					delivery = deliveries.recv() => {
						let Some(delivery) = delivery else { break };
						let receiver = core
							.receiver
							.read()
							.expect("channel lock poisoned")
							.clone();
						let Some(receiver) = receiver else { continue };
						match delivery {
							Delivery::Message(msg) => receiver.receive(msg),
							Delivery::View(view) => receiver.view_accepted(&view),
							Delivery::State(state) => receiver.set_state(state),
						}
					}
				}
			}
		});
	}
}

impl UpHandler for ChannelCore {
	fn up(&self, event: Event) -> Option<Event> {
		match event {
			Event::Msg(msg) => {
				self.deliveries.send(Delivery::Message(msg)).ok();
				None
			}
			Event::ViewChange(view) => {
				// only a member sees views: nothing is delivered after
				// disconnect
				let local = *self.local.borrow();
				let Some(local) = local else { return None };
				if !view.contains(&local) {
					return None;
				}
				self.view.send_replace(Some(view.clone()));
				self.deliveries.send(Delivery::View(view)).ok();
				None
			}
			Event::SetLocalAddress(addr) => {
				self.local.send_replace(Some(addr));
				// tell every layer below who we are
				self.stack.down(Event::SetLocalAddress(addr));
				None
			}
			Event::GetApplState(info) => {
				let state = self
					.receiver
					.read()
					.expect("channel lock poisoned")
					.clone()
					.and_then(|r| r.get_state());
				Some(Event::GetApplStateOk(StateTransferInfo {
					target: info.target,
					timeout: Duration::ZERO,
					state,
				}))
			}
			Event::GetStateOk(info) => {
				if let Some(tx) = self
					.pending_state
					.lock()
					.expect("channel lock poisoned")
					.take()
				{
					tx.send(info.clone()).ok();
				}
				self.deliveries.send(Delivery::State(info.state)).ok();
				None
			}
			Event::TmpView(_) | Event::Config(_) => None,
			other => {
				tracing::trace!(kind = ?other.kind(), "event ignored at the channel");
				None
			}
		}
	}
}
