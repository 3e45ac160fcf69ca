//! In-process cluster bus.
//!
//! The only transport shipped with the crate: clusters are keyed by name
//! inside one `LoopbackNet`, members get per-destination FIFO queues, and
//! view installs are serialized under the bus lock so every member
//! observes the same sequence of views. Delivery is best effort: sends
//! from or to a departed member are silently dropped.

use {
	crate::{
		address::Address,
		view::{View, ViewId},
	},
	bytes::Bytes,
	std::{
		collections::HashMap,
		sync::{Arc, Mutex},
	},
	tokio::sync::mpsc,
};

/// What travels over a member's queue: encoded message frames and view
/// installs, in the order the bus produced them.
#[derive(Debug)]
pub(crate) enum Envelope {
	Data(Bytes),
	View(View),
}

/// Handle to an in-process network of clusters. Cheap to clone; channels
/// built against the same instance can reach each other.
#[derive(Clone, Default)]
pub struct LoopbackNet {
	inner: Arc<NetInner>,
}

#[derive(Default)]
struct NetInner {
	clusters: Mutex<HashMap<String, Cluster>>,
}

#[derive(Default)]
struct Cluster {
	epoch: u64,
	members: Vec<Member>,
}

struct Member {
	addr: Address,
	tx: mpsc::UnboundedSender<Envelope>,
}

impl LoopbackNet {
	pub fn new() -> Self {
		Self::default()
	}

	/// Joins a cluster: mints an address, registers a delivery queue and
	/// installs a new view on every member, the newcomer included.
	pub(crate) fn join(
		&self,
		cluster: &str,
	) -> (Address, mpsc::UnboundedReceiver<Envelope>) {
		let mut clusters = self.inner.clusters.lock().expect("bus lock poisoned");
		let state = clusters.entry(cluster.to_owned()).or_default();

		let addr = Address::random();
		let (tx, rx) = mpsc::unbounded_channel();
		state.members.push(Member { addr, tx });
		Self::install_view(state);

		(addr, rx)
	}

	/// Removes a member and installs the next view on the remainder.
	pub(crate) fn leave(&self, cluster: &str, addr: Address) {
		let mut clusters = self.inner.clusters.lock().expect("bus lock poisoned");
		let Some(state) = clusters.get_mut(cluster) else {
			return;
		};

		let before = state.members.len();
		state.members.retain(|m| m.addr != addr);
		if state.members.len() == before {
			return;
		}
		if state.members.is_empty() {
			clusters.remove(cluster);
			return;
		}
		Self::install_view(state);
	}

	/// Routes an encoded frame: unicast to one member, or to every member
	/// (the sender included) when `dest` is `None`.
	pub(crate) fn send(
		&self,
		cluster: &str,
		from: Address,
		dest: Option<Address>,
		frame: Bytes,
	) {
		let clusters = self.inner.clusters.lock().expect("bus lock poisoned");
		let Some(state) = clusters.get(cluster) else {
			tracing::trace!(%from, "send into unknown cluster dropped");
			return;
		};
		if !state.members.iter().any(|m| m.addr == from) {
			tracing::trace!(%from, "send from departed member dropped");
			return;
		}

		match dest {
			Some(dest) => {
				match state.members.iter().find(|m| m.addr == dest) {
					Some(member) => {
						member.tx.send(Envelope::Data(frame)).ok();
					}
					None => {
						tracing::trace!(%from, %dest, "unicast to departed member dropped");
					}
				}
			}
			None => {
				for member in &state.members {
					member.tx.send(Envelope::Data(frame.clone())).ok();
				}
			}
		}
	}

	fn install_view(state: &mut Cluster) {
		state.epoch += 1;
		let creator = state.members[0].addr;
		let view = View::new(
			ViewId { epoch: state.epoch, creator },
			state.members.iter().map(|m| m.addr).collect(),
		);

		tracing::debug!(view = %view, "installing view");
		for member in &state.members {
			member.tx.send(Envelope::View(view.clone())).ok();
		}
	}
}
