use {
	crate::{
		address::Address,
		config::reject_unknown_properties,
		digest::{Digest, Seqnos},
		error::ConfigError,
		event::{Event, EventKind},
		message::{Header, Message},
		stack::{Neighbors, Protocol, ProtocolId, UpHandler, registry::BuildContext},
	},
	core::time::Duration,
	derive_builder::Builder,
	serde::{Deserialize, Serialize},
	std::{
		any::Any,
		collections::{BTreeMap, HashMap, VecDeque},
		sync::{
			Arc,
			Mutex,
			atomic::{AtomicU64, Ordering},
		},
	},
};

/// Sequence number stamped on outgoing multicasts, one stream per sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqnoHeader {
	pub seq: u64,
}

/// Configuration options for the reliable-delivery layer.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", setter(prefix = "with"))]
#[builder_struct_attr(doc(hidden))]
pub struct FifoConfig {
	/// The maximum number of out-of-order messages buffered per sender
	/// before further gapped arrivals are dropped.
	#[builder(default = "2048")]
	pub max_buffered: usize,

	/// Upper bound on a requested stability suspension. A state transfer
	/// asking for more is clamped, so a stuck requester cannot park the
	/// message GC indefinitely.
	#[builder(default = "Duration::from_secs(60)")]
	pub max_stability_suspension: Duration,
}

impl Default for FifoConfig {
	fn default() -> Self {
		FifoConfigBuilder::default()
			.build()
			.expect("all options have defaults")
	}
}

impl FifoConfig {
	/// Creates a new config builder with default values.
	pub fn builder() -> FifoConfigBuilder {
		FifoConfigBuilder::default()
	}
}

/// Reliable FIFO delivery for multicasts, plus the control surface the
/// state-transfer layer depends on: digest capture (`GetDigest`), digest
/// install (`OverwriteDigest`), the delivery barrier
/// (`CloseBarrier`/`OpenBarrier`) and stability suspension
/// (`SuspendStable`/`ResumeStable`).
///
/// Multicasts are stamped with a per-sender seqno and delivered gapless
/// and in order per sender; out-of-order arrivals are buffered. Unicasts
/// ride the transport's per-sender FIFO queues and bypass both the seqno
/// machinery and the barrier; the delivery checkpoint covers the
/// multicast streams only.
pub struct Fifo {
	neighbors: Arc<Neighbors>,
	local: Mutex<Option<Address>>,

	/// Next seqno for outgoing multicasts, pre-increment.
	sent: AtomicU64,

	inbound: Mutex<HashMap<Address, SenderState>>,
	barrier: Mutex<Barrier>,
	stability: Arc<Mutex<Stability>>,
	config: FifoConfig,
}

struct SenderState {
	/// Next seqno expected from this sender; everything below has been
	/// delivered or superseded by an installed digest.
	next: u64,
	buffered: BTreeMap<u64, Message>,
}

impl Default for SenderState {
	fn default() -> Self {
		Self {
			next: 1,
			buffered: BTreeMap::new(),
		}
	}
}

#[derive(Default)]
struct Barrier {
	depth: usize,
	held: VecDeque<Message>,
}

#[derive(Default)]
struct Stability {
	suspended: bool,
	/// Invalidates auto-resume timers from earlier suspensions.
	generation: u64,
	suspends: u64,
	resumes: u64,
}

impl Fifo {
	pub const ID: ProtocolId = 2;
	pub const NAME: &'static str = "fifo";

	pub fn new(config: FifoConfig) -> Arc<Self> {
		Arc::new(Self {
			neighbors: Arc::new(Neighbors::default()),
			local: Mutex::new(None),
			sent: AtomicU64::new(0),
			inbound: Mutex::new(HashMap::new()),
			barrier: Mutex::new(Barrier::default()),
			stability: Arc::new(Mutex::new(Stability::default())),
			config,
		})
	}

	pub(crate) fn build(
		cx: &BuildContext,
	) -> Result<Arc<dyn Protocol>, ConfigError> {
		reject_unknown_properties(Self::NAME, &cx.properties, &[
			"max_buffered",
			"max_stability_suspension_ms",
		])?;

		let mut builder = FifoConfig::builder();
		if let Some(value) = cx.properties.get("max_buffered") {
			let parsed = value.parse().map_err(|_| ConfigError::InvalidProperty {
				key: "max_buffered".into(),
				value: value.clone(),
			})?;
			builder = builder.with_max_buffered(parsed);
		}
		if let Some(value) = cx.properties.get("max_stability_suspension_ms") {
			let millis: u64 =
				value.parse().map_err(|_| ConfigError::InvalidProperty {
					key: "max_stability_suspension_ms".into(),
					value: value.clone(),
				})?;
			builder =
				builder.with_max_stability_suspension(Duration::from_millis(millis));
		}

		let config = builder
			.build()
			.expect("all options have defaults");
		Ok(Self::new(config))
	}

	/// Current delivery checkpoint: per known sender the highest gapless
	/// delivered seqno and the highest seen at all. The local sender's
	/// entry accounts for everything it has sent, delivered back or not.
	pub fn digest(&self) -> Digest {
		let inbound = self.inbound.lock().expect("fifo lock poisoned");
		let mut digest = Digest::new();
		for (sender, state) in inbound.iter() {
			let delivered = state.next - 1;
			let received = state
				.buffered
				.keys()
				.next_back()
				.copied()
				.unwrap_or(delivered)
				.max(delivered);
			digest.insert(*sender, Seqnos { delivered, received });
		}
		if let Some(local) = *self.local.lock().expect("fifo lock poisoned") {
			let sent = self.sent.load(Ordering::SeqCst);
			let entry = digest.get(&local).unwrap_or_default();
			digest.insert(local, Seqnos {
				delivered: entry.delivered,
				received: entry.received.max(sent),
			});
		}
		digest
	}

	pub fn barrier_depth(&self) -> usize {
		self.barrier.lock().expect("fifo lock poisoned").depth
	}

	pub fn is_barrier_closed(&self) -> bool {
		self.barrier_depth() > 0
	}

	pub fn is_stability_suspended(&self) -> bool {
		self.stability.lock().expect("fifo lock poisoned").suspended
	}

	pub fn stability_suspends(&self) -> u64 {
		self.stability.lock().expect("fifo lock poisoned").suspends
	}

	pub fn stability_resumes(&self) -> u64 {
		self.stability.lock().expect("fifo lock poisoned").resumes
	}

	/// Sequences one inbound multicast. Returns the run of messages that
	/// became deliverable, in order.
	fn sequence(&self, sender: Address, seq: u64, msg: Message) -> Vec<Message> {
		let mut inbound = self.inbound.lock().expect("fifo lock poisoned");
		let state = inbound.entry(sender).or_default();

		if seq < state.next {
			tracing::trace!(%sender, seq, next = state.next, "stale seqno dropped");
			return Vec::new();
		}
		if seq > state.next {
			if state.buffered.len() >= self.config.max_buffered {
				tracing::warn!(%sender, seq, "gap buffer full, message dropped");
			} else {
				state.buffered.insert(seq, msg);
			}
			return Vec::new();
		}

		let mut deliverable = vec![msg];
		state.next += 1;
		while let Some(next) = state.buffered.remove(&state.next) {
			deliverable.push(next);
			state.next += 1;
		}
		deliverable
	}

	/// Delivers messages upward, or parks them while the barrier is
	/// closed.
	fn deliver(&self, deliverable: Vec<Message>) {
		if deliverable.is_empty() {
			return;
		}
		{
			let mut barrier = self.barrier.lock().expect("fifo lock poisoned");
			if barrier.depth > 0 {
				barrier.held.extend(deliverable);
				return;
			}
		}
		for msg in deliverable {
			self.neighbors.pass_up(Event::Msg(msg));
		}
	}

	/// Installs a delivery checkpoint: delivery restarts after each
	/// sender's `delivered` mark, buffered or held messages at or below
	/// it are discarded, and anything that became deliverable flows on.
	fn overwrite_digest(&self, digest: Digest) {
		tracing::debug!(digest = %digest, "overwriting digest");
		let mut newly_deliverable = Vec::new();
		{
			let mut inbound = self.inbound.lock().expect("fifo lock poisoned");
			for (sender, seqnos) in digest.iter() {
				let state = inbound.entry(*sender).or_default();
				if seqnos.delivered + 1 > state.next {
					state.next = seqnos.delivered + 1;
				}
				state.buffered.retain(|seq, _| *seq >= state.next);
				while let Some(next) = state.buffered.remove(&state.next) {
					newly_deliverable.push(next);
					state.next += 1;
				}
			}
		}
		{
			let mut barrier = self.barrier.lock().expect("fifo lock poisoned");
			barrier.held.retain(|msg| {
				let Some(src) = msg.src() else { return true };
				let Some(floor) = digest.get(&src) else { return true };
				match msg.header(Self::ID) {
					Some(Header::Seqno(h)) => h.seq > floor.delivered,
					_ => true,
				}
			});
		}
		self.deliver(newly_deliverable);
	}

	fn close_barrier(&self) {
		let mut barrier = self.barrier.lock().expect("fifo lock poisoned");
		barrier.depth += 1;
		tracing::debug!(depth = barrier.depth, "barrier closed");
	}

	fn open_barrier(&self) {
		let flush = {
			let mut barrier = self.barrier.lock().expect("fifo lock poisoned");
			if barrier.depth == 0 {
				tracing::warn!("open on an already open barrier");
				return;
			}
			barrier.depth -= 1;
			if barrier.depth == 0 {
				barrier.held.drain(..).collect()
			} else {
				Vec::new()
			}
		};
		for msg in flush {
			self.neighbors.pass_up(Event::Msg(msg));
		}
	}

	fn suspend_stability(&self, timeout: Duration) {
		let timeout = timeout.min(self.config.max_stability_suspension);
		let generation = {
			let mut stability = self.stability.lock().expect("fifo lock poisoned");
			stability.suspended = true;
			stability.suspends += 1;
			stability.generation += 1;
			stability.generation
		};
		tracing::debug!(?timeout, "stability suspended");

		// auto-resume: a timed-out state transfer must not leave the
		// message GC suspended forever
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			let stability = Arc::clone(&self.stability);
			handle.spawn(async move {
				tokio::time::sleep(timeout).await;
				let mut stability = stability.lock().expect("fifo lock poisoned");
				if stability.generation == generation && stability.suspended {
					stability.suspended = false;
					stability.resumes += 1;
					tracing::debug!("stability auto-resumed after timeout");
				}
			});
		}
	}

	fn resume_stability(&self) {
		let mut stability = self.stability.lock().expect("fifo lock poisoned");
		stability.generation += 1;
		if stability.suspended {
			stability.suspended = false;
			stability.resumes += 1;
			tracing::debug!("stability resumed");
		}
	}
}

impl UpHandler for Fifo {
	fn up(&self, event: Event) -> Option<Event> {
		match event {
			Event::Msg(msg) => {
				let seq = match msg.header(Self::ID) {
					Some(Header::Seqno(h)) => h.seq,
					// not one of ours: unicast or control, straight up
					_ => return self.neighbors.pass_up(Event::Msg(msg)),
				};
				let Some(sender) = msg.src() else {
					tracing::warn!("sequenced message without a source dropped");
					return None;
				};
				let deliverable = self.sequence(sender, seq, msg);
				self.deliver(deliverable);
				None
			}
			other => self.neighbors.pass_up(other),
		}
	}
}

impl Protocol for Fifo {
	fn name(&self) -> &'static str {
		Self::NAME
	}

	fn id(&self) -> ProtocolId {
		Self::ID
	}

	fn neighbors(&self) -> &Neighbors {
		&self.neighbors
	}

	fn provided_down_services(&self) -> &'static [EventKind] {
		&[
			EventKind::GetDigest,
			EventKind::OverwriteDigest,
			EventKind::CloseBarrier,
			EventKind::OpenBarrier,
			EventKind::SuspendStable,
			EventKind::ResumeStable,
		]
	}

	fn down(&self, event: Event) -> Option<Event> {
		match event {
			Event::Msg(msg) if msg.dest().is_none() => {
				let seq = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
				let msg = msg.put_header(Self::ID, Header::Seqno(SeqnoHeader { seq }));
				self.neighbors.pass_down(Event::Msg(msg))
			}
			Event::GetDigest => Some(Event::GetDigestOk(self.digest())),
			Event::OverwriteDigest(digest) => {
				self.overwrite_digest(digest);
				None
			}
			Event::CloseBarrier => {
				self.close_barrier();
				None
			}
			Event::OpenBarrier => {
				self.open_barrier();
				None
			}
			Event::SuspendStable(timeout) => {
				self.suspend_stability(timeout);
				None
			}
			Event::ResumeStable => {
				self.resume_stability();
				None
			}
			Event::SetLocalAddress(addr) => {
				*self.local.lock().expect("fifo lock poisoned") = Some(addr);
				self.neighbors.pass_down(Event::SetLocalAddress(addr))
			}
			other => self.neighbors.pass_down(other),
		}
	}

	fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
		self
	}
}
