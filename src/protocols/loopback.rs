use {
	crate::{
		address::Address,
		config::reject_unknown_properties,
		error::ConfigError,
		event::{Event, EventKind},
		net::{Envelope, LoopbackNet},
		stack::{Neighbors, Protocol, ProtocolId, UpHandler, registry::BuildContext},
	},
	std::{
		any::Any,
		sync::{Arc, Mutex},
	},
	tokio_util::sync::CancellationToken,
};

/// The bottom layer: attaches the stack to a [`LoopbackNet`] bus.
///
/// `Connect` joins a cluster, announces the minted local address upward
/// and starts a pump task that decodes inbound frames and drives them up
/// the stack. `Disconnect` leaves the cluster and terminates the pump.
pub struct Loopback {
	neighbors: Arc<Neighbors>,
	net: LoopbackNet,
	joined: Mutex<Option<Joined>>,
}

struct Joined {
	cluster: String,
	addr: Address,
	cancel: CancellationToken,
}

impl Loopback {
	pub const ID: ProtocolId = 1;
	pub const NAME: &'static str = "loopback";

	pub fn new(net: LoopbackNet) -> Arc<Self> {
		Arc::new(Self {
			neighbors: Arc::new(Neighbors::default()),
			net,
			joined: Mutex::new(None),
		})
	}

	pub(crate) fn build(
		cx: &BuildContext,
	) -> Result<Arc<dyn Protocol>, ConfigError> {
		reject_unknown_properties(Self::NAME, &cx.properties, &[])?;
		Ok(Self::new(cx.net.clone()))
	}

	/// The address minted for this node, `None` while not connected.
	pub fn local_address(&self) -> Option<Address> {
		self.joined.lock().expect("loopback lock poisoned").as_ref().map(|j| j.addr)
	}

	fn connect(&self, cluster: String) {
		let mut joined = self.joined.lock().expect("loopback lock poisoned");
		if joined.is_some() {
			tracing::warn!(cluster, "connect on an already connected transport");
			return;
		}

		let (addr, mut rx) = self.net.join(&cluster);
		let cancel = CancellationToken::new();
		*joined = Some(Joined {
			cluster,
			addr,
			cancel: cancel.clone(),
		});
		drop(joined);

		// the address must be known above before the first view arrives
		self.neighbors.pass_up(Event::SetLocalAddress(addr));

		let neighbors = Arc::clone(&self.neighbors);
		tokio::spawn(async move {
			loop {
				tokio::select! {
					() = cancel.cancelled() => break,
					envelope = rx.recv() => {
						let Some(envelope) = envelope else { break };
						match envelope {
							Envelope::View(view) => {
								neighbors.pass_up(Event::ViewChange(view));
							}
							Envelope::Data(frame) => {
								match crate::encoding::deserialize(&frame) {
									Ok(msg) => {
										neighbors.pass_up(Event::Msg(msg));
									}
									Err(e) => {
										tracing::warn!(error = %e, "undecodable frame dropped");
									}
								}
							}
						}
					}
				}
			}
		});
	}

	fn disconnect(&self) {
		let Some(joined) = self.joined.lock().expect("loopback lock poisoned").take()
		else {
			return;
		};
		joined.cancel.cancel();
		self.net.leave(&joined.cluster, joined.addr);
	}

	fn send(&self, mut msg: crate::message::Message) {
		let joined = self.joined.lock().expect("loopback lock poisoned");
		let Some(joined) = joined.as_ref() else {
			tracing::warn!("message dropped: transport not connected");
			return;
		};
		msg.set_src(joined.addr);
		let frame = crate::encoding::serialize(&msg);
		self.net.send(&joined.cluster, joined.addr, msg.dest(), frame);
	}
}

impl UpHandler for Loopback {
	fn up(&self, event: Event) -> Option<Event> {
		// nothing below the transport; entry point for stack.up()
		self.neighbors.pass_up(event)
	}
}

impl Protocol for Loopback {
	fn name(&self) -> &'static str {
		Self::NAME
	}

	fn id(&self) -> ProtocolId {
		Self::ID
	}

	fn neighbors(&self) -> &Neighbors {
		&self.neighbors
	}

	fn stop(&self) {
		self.disconnect();
	}

	fn provided_down_services(&self) -> &'static [EventKind] {
		&[EventKind::Msg, EventKind::Connect, EventKind::Disconnect]
	}

	fn down(&self, event: Event) -> Option<Event> {
		match event {
			Event::Connect(cluster) => {
				self.connect(cluster);
				None
			}
			Event::Disconnect => {
				self.disconnect();
				None
			}
			Event::Msg(msg) => {
				self.send(msg);
				None
			}
			// the transport minted the address, nothing below to tell
			Event::SetLocalAddress(_) => None,
			other => self.neighbors.pass_down(other),
		}
	}

	fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
		self
	}
}
