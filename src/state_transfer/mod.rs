//! Byte-array state transfer.
//!
//! A state request is sent to a chosen member (the coordinator when no
//! target is given). That member captures a copy of its delivery digest,
//! asks its application for the current state and returns both to the
//! requester, which first installs the digest and only then hands the
//! state to its application. Closing the delivery barrier around the
//! install guarantees that no message past the new checkpoint reaches the
//! application early; suspending stability keeps the provider from
//! trimming buffers the requester still needs.

mod header;

pub use header::{StateHeader, StateTransferKind};

use {
	crate::{
		address::Address,
		config::reject_unknown_properties,
		digest::Digest,
		error::{ConfigError, StackError},
		event::{Event, EventKind, StateTransferInfo},
		message::{Header, Message},
		stack::{Neighbors, Protocol, ProtocolId, UpHandler, registry::BuildContext},
		view::View,
	},
	bytes::Bytes,
	std::{
		any::Any,
		collections::{HashMap, HashSet},
		sync::{
			Arc,
			Mutex,
			atomic::{AtomicBool, AtomicU64, Ordering},
		},
		time::{Instant, SystemTime, UNIX_EPOCH},
	},
};

/// The state-transfer layer.
pub struct StateTransfer {
	neighbors: Arc<Neighbors>,
	local: Mutex<Option<Address>>,

	/// Current membership snapshot. Never held across an emit.
	members: Mutex<Vec<Address>>,

	/// Pending requesters on the provider side. Mutated only under its
	/// own lock; all enqueued requesters receive the same response.
	requesters: Mutex<HashSet<Address>>,

	/// Set while this node waits for a state response.
	waiting_for_state_response: AtomicBool,

	/// A flush layer above makes digest exchange unnecessary.
	flush_in_stack: AtomicBool,

	/// Another state-transfer layer announced itself; fatal at start.
	duplicate_in_stack: AtomicBool,

	num_state_reqs: AtomicU64,
	num_bytes_sent: AtomicU64,
	timing: Mutex<Timing>,
}

#[derive(Default)]
struct Timing {
	start: Option<Instant>,
	stop: Option<Instant>,
}

impl StateTransfer {
	pub const ID: ProtocolId = 3;
	pub const NAME: &'static str = "state-transfer";

	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			neighbors: Arc::new(Neighbors::default()),
			local: Mutex::new(None),
			members: Mutex::new(Vec::new()),
			requesters: Mutex::new(HashSet::new()),
			waiting_for_state_response: AtomicBool::new(false),
			flush_in_stack: AtomicBool::new(false),
			duplicate_in_stack: AtomicBool::new(false),
			num_state_reqs: AtomicU64::new(0),
			num_bytes_sent: AtomicU64::new(0),
			timing: Mutex::new(Timing::default()),
		})
	}

	pub(crate) fn build(
		cx: &BuildContext,
	) -> Result<Arc<dyn Protocol>, ConfigError> {
		reject_unknown_properties(Self::NAME, &cx.properties, &[])?;
		Ok(Self::new())
	}
}

/// Statistics.
impl StateTransfer {
	pub fn num_state_requests(&self) -> u64 {
		self.num_state_reqs.load(Ordering::SeqCst)
	}

	pub fn num_bytes_sent(&self) -> u64 {
		self.num_bytes_sent.load(Ordering::SeqCst)
	}

	pub fn average_state_size(&self) -> f64 {
		let reqs = self.num_state_requests();
		if reqs == 0 {
			return 0.0;
		}
		self.num_bytes_sent() as f64 / reqs as f64
	}

	pub fn reset_stats(&self) {
		self.num_state_reqs.store(0, Ordering::SeqCst);
		self.num_bytes_sent.store(0, Ordering::SeqCst);
	}

	/// Duration of the last completed transfer on the requester side.
	pub fn last_transfer_time(&self) -> Option<core::time::Duration> {
		let timing = self.timing.lock().expect("state lock poisoned");
		match (timing.start, timing.stop) {
			(Some(start), Some(stop)) => Some(stop.duration_since(start)),
			_ => None,
		}
	}

	/// True while a state request is outstanding on this node.
	pub fn is_waiting_for_state_response(&self) -> bool {
		self.waiting_for_state_response.load(Ordering::SeqCst)
	}
}

impl StateTransfer {
	/// With a flush layer in the stack digests are not exchanged.
	fn digest_needed(&self) -> bool {
		!self.flush_in_stack.load(Ordering::SeqCst)
	}

	fn local_address(&self) -> Option<Address> {
		*self.local.lock().expect("state lock poisoned")
	}

	/// The first member of the current view that is not this node.
	fn pick_provider(&self) -> Option<Address> {
		let local = self.local_address();
		self
			.members
			.lock()
			.expect("state lock poisoned")
			.iter()
			.copied()
			.find(|m| Some(*m) != local)
	}

	/// Application asked for the group state.
	fn handle_get_state(&self, info: StateTransferInfo) {
		let local = self.local_address();
		let target = match info.target {
			None => self.pick_provider(),
			Some(target) if Some(target) == local => {
				tracing::error!("cannot fetch state from myself");
				None
			}
			Some(target) => Some(target),
		};

		let Some(provider) = target else {
			tracing::debug!("first member, no state to fetch");
			self
				.neighbors
				.pass_up(Event::GetStateOk(StateTransferInfo::response(None, None)));
			return;
		};

		let Some(local) = local else {
			tracing::error!("get-state before the local address is known");
			self
				.neighbors
				.pass_up(Event::GetStateOk(StateTransferInfo::response(None, None)));
			return;
		};

		// keep the provider from trimming buffers we still need; wakes up
		// again when the state has been received or the timeout elapses
		tracing::debug!(%provider, "asking for state, suspending stability");
		self
			.neighbors
			.pass_down(Event::SuspendStable(info.timeout));

		self
			.waiting_for_state_response
			.store(true, Ordering::SeqCst);
		self.timing.lock().expect("state lock poisoned").start =
			Some(Instant::now());

		let id = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_millis() as u64;
		let request = Message::unicast(provider, Bytes::new()).put_header(
			Self::ID,
			Header::State(StateHeader::request(local, id)),
		);
		self.neighbors.pass_down(Event::Msg(request));
	}

	/// A member asked us for our state.
	///
	/// When a fetch is already in flight the new requester simply rides
	/// the same response. Otherwise the digest is captured behind a
	/// closed barrier, strictly before the application state is read.
	fn handle_state_req(&self, sender: Address) {
		let was_empty = {
			let mut requesters = self.requesters.lock().expect("state lock poisoned");
			let was_empty = requesters.is_empty();
			requesters.insert(sender);
			was_empty
		};

		if !self.digest_needed() {
			// flush keeps the group quiescent, no digest and no barrier
			self.fetch_and_respond(None, false);
		} else if was_empty {
			self.neighbors.pass_down(Event::CloseBarrier);
			let digest = match self.neighbors.pass_down(Event::GetDigest) {
				Some(Event::GetDigestOk(digest)) => Some(digest),
				_ => {
					tracing::error!("no digest from the layer below");
					None
				}
			};
			tracing::debug!(digest = ?digest, "fetching application state");
			self.fetch_and_respond(digest, true);
		}
	}

	/// Asks the application for its state and answers every enqueued
	/// requester with the same digest and state bytes.
	fn fetch_and_respond(&self, digest: Option<Digest>, open_barrier: bool) {
		let state = match self
			.neighbors
			.pass_up(Event::GetApplState(StateTransferInfo::default()))
		{
			Some(Event::GetApplStateOk(info)) => info.state,
			_ => {
				tracing::warn!("application did not answer the state request");
				None
			}
		};

		// the digest is captured; deliveries may resume before the
		// responses go out
		if open_barrier {
			self.neighbors.pass_down(Event::OpenBarrier);
		}

		let responses = {
			let mut requesters = self.requesters.lock().expect("state lock poisoned");
			if requesters.is_empty() {
				tracing::warn!("received application state but there are no requesters");
				return;
			}

			self.num_state_reqs.fetch_add(1, Ordering::SeqCst);
			if let Some(state) = &state {
				self
					.num_bytes_sent
					.fetch_add(state.len() as u64, Ordering::SeqCst);
			}

			let local = self.local_address();
			let responses: Vec<Message> = requesters
				.drain()
				.filter_map(|requester| {
					let local = local?;
					Some(
						Message::unicast(
							requester,
							state.clone().unwrap_or_default(),
						)
						.put_header(
							Self::ID,
							Header::State(StateHeader::response(local, digest.clone())),
						),
					)
				})
				.collect();
			responses
		};

		for response in responses {
			tracing::debug!(
				dest = ?response.dest(),
				bytes = response.len(),
				"sending state"
			);
			self.neighbors.pass_down(Event::Msg(response));
		}
	}

	/// Installs the digest and hands the state up to the application.
	fn handle_state_rsp(&self, hdr: StateHeader, state: Option<Bytes>) {
		let digest_needed = self.digest_needed();

		self
			.waiting_for_state_response
			.store(false, Ordering::SeqCst);

		if digest_needed {
			if let Some(digest) = hdr.digest {
				self.neighbors.pass_down(Event::OverwriteDigest(digest));
			}
		}

		let elapsed = {
			let mut timing = self.timing.lock().expect("state lock poisoned");
			timing.stop = Some(Instant::now());
			timing
				.start
				.map(|start| timing.stop.expect("just set").duration_since(start))
		};

		tracing::debug!("passing down RESUME_STABLE");
		self.neighbors.pass_down(Event::ResumeStable);

		tracing::debug!(
			bytes = state.as_ref().map_or(0, Bytes::len),
			elapsed = ?elapsed,
			"received state"
		);
		self.neighbors.pass_up(Event::GetStateOk(
			StateTransferInfo::response(Some(hdr.sender), state),
		));
	}

	/// Keeps the membership snapshot current and unblocks a requester
	/// whose provider crashed mid-transfer.
	///
	/// Only a coordinator-picked provider is covered: an explicit
	/// `get_state(target)` whose target crashes is left to the caller's
	/// timeout.
	fn handle_view_change(&self, view: &View) {
		let crashed_provider = {
			let mut members = self.members.lock().expect("state lock poisoned");
			let old_coord = members.first().copied();
			members.clear();
			members.extend_from_slice(&view.members);

			match old_coord {
				Some(old)
					if self.waiting_for_state_response.load(Ordering::SeqCst)
						&& !members.contains(&old) =>
				{
					Some(old)
				}
				_ => None,
			}
		};

		if let Some(provider) = crashed_provider {
			tracing::warn!(
				%provider,
				"state provider crashed, returning null state to the application"
			);
			let Some(local) = self.local_address() else { return };
			self.handle_state_rsp(StateHeader::response(local, None), None);
		}
	}

	fn handle_up_config(&self, config: &HashMap<String, String>) {
		if config.contains_key("state_transfer") {
			tracing::error!(
				"protocol stack cannot contain two state transfer protocols; \
				 remove either one of them"
			);
			self.duplicate_in_stack.store(true, Ordering::SeqCst);
		}
	}
}

/// Reopens the barrier when dropped, so the requester-side install can
/// never leave delivery parked.
struct BarrierGuard<'a> {
	neighbors: &'a Neighbors,
}

impl Drop for BarrierGuard<'_> {
	fn drop(&mut self) {
		self.neighbors.pass_down(Event::OpenBarrier);
	}
}

impl UpHandler for StateTransfer {
	fn up(&self, event: Event) -> Option<Event> {
		match event {
			Event::Msg(msg) => {
				let Some(Header::State(hdr)) = msg.header(Self::ID) else {
					return self.neighbors.pass_up(Event::Msg(msg));
				};
				let hdr = hdr.clone();
				match hdr.kind {
					StateTransferKind::Request => {
						self.handle_state_req(hdr.sender);
					}
					StateTransferKind::Response => {
						// no message past the incoming checkpoint may reach
						// the application before the digest is installed
						let guard = self.digest_needed().then(|| {
							self.neighbors.pass_down(Event::CloseBarrier);
							BarrierGuard { neighbors: self.neighbors.as_ref() }
						});
						let state = (!msg.is_empty()).then(|| msg.payload().clone());
						self.handle_state_rsp(hdr, state);
						drop(guard);
					}
				}
				None
			}
			Event::ViewChange(view) => {
				self.handle_view_change(&view);
				self.neighbors.pass_up(Event::ViewChange(view))
			}
			Event::TmpView(view) => {
				self.handle_view_change(&view);
				self.neighbors.pass_up(Event::TmpView(view))
			}
			Event::Config(config) => {
				self.handle_up_config(&config);
				self.neighbors.pass_up(Event::Config(config))
			}
			other => self.neighbors.pass_up(other),
		}
	}
}

impl Protocol for StateTransfer {
	fn name(&self) -> &'static str {
		Self::NAME
	}

	fn id(&self) -> ProtocolId {
		Self::ID
	}

	fn neighbors(&self) -> &Neighbors {
		&self.neighbors
	}

	fn start(&self) -> Result<(), StackError> {
		if self.duplicate_in_stack.load(Ordering::SeqCst) {
			return Err(StackError::DuplicateStateTransfer);
		}
		let mut config = HashMap::new();
		config.insert("state_transfer".to_owned(), "true".to_owned());
		self.neighbors.pass_up(Event::Config(config));
		Ok(())
	}

	fn stop(&self) {
		self
			.waiting_for_state_response
			.store(false, Ordering::SeqCst);
	}

	fn required_down_services(&self) -> &'static [EventKind] {
		&[EventKind::GetDigest, EventKind::OverwriteDigest]
	}

	fn required_up_services(&self) -> &'static [EventKind] {
		&[EventKind::GetApplState, EventKind::GetStateOk]
	}

	fn provided_down_services(&self) -> &'static [EventKind] {
		&[EventKind::GetState]
	}

	fn down(&self, event: Event) -> Option<Event> {
		match event {
			Event::GetState(info) => {
				self.handle_get_state(info);
				None
			}
			Event::ViewChange(view) => {
				self.handle_view_change(&view);
				self.neighbors.pass_down(Event::ViewChange(view))
			}
			Event::TmpView(view) => {
				self.handle_view_change(&view);
				self.neighbors.pass_down(Event::TmpView(view))
			}
			Event::Config(config) => {
				if config.contains_key("flush_supported") {
					self.flush_in_stack.store(true, Ordering::SeqCst);
				}
				self.neighbors.pass_down(Event::Config(config))
			}
			Event::SetLocalAddress(addr) => {
				*self.local.lock().expect("state lock poisoned") = Some(addr);
				self.neighbors.pass_down(Event::SetLocalAddress(addr))
			}
			other => self.neighbors.pass_down(other),
		}
	}

	fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
		self
	}
}
