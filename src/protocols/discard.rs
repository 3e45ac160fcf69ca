use {
	crate::{
		config::reject_unknown_properties,
		error::ConfigError,
		event::Event,
		message::Message,
		stack::{Neighbors, Protocol, ProtocolId, UpHandler, registry::BuildContext},
	},
	std::{
		any::Any,
		sync::{
			Arc,
			RwLock,
			atomic::{AtomicU64, Ordering},
		},
	},
};

type DropPredicate = Box<dyn Fn(&Message) -> bool + Send + Sync>;

/// Failure-injection layer: drops upward messages matching a predicate.
///
/// Used by tests to simulate a member that stops responding, e.g. a
/// state provider that never answers a request, without racing against
/// real delivery timing. Forwards everything else untouched.
pub struct Discard {
	neighbors: Arc<Neighbors>,
	drop_up: RwLock<Option<DropPredicate>>,
	discarded: AtomicU64,
}

impl Discard {
	pub const ID: ProtocolId = 5;
	pub const NAME: &'static str = "discard";

	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			neighbors: Arc::new(Neighbors::default()),
			drop_up: RwLock::new(None),
			discarded: AtomicU64::new(0),
		})
	}

	pub(crate) fn build(
		cx: &BuildContext,
	) -> Result<Arc<dyn Protocol>, ConfigError> {
		reject_unknown_properties(Self::NAME, &cx.properties, &[])?;
		Ok(Self::new())
	}

	/// Starts dropping upward messages for which the predicate holds.
	pub fn drop_up_matching(
		&self,
		predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
	) {
		*self.drop_up.write().expect("discard lock poisoned") =
			Some(Box::new(predicate));
	}

	pub fn stop_dropping(&self) {
		*self.drop_up.write().expect("discard lock poisoned") = None;
	}

	pub fn discarded(&self) -> u64 {
		self.discarded.load(Ordering::SeqCst)
	}
}

impl UpHandler for Discard {
	fn up(&self, event: Event) -> Option<Event> {
		if let Event::Msg(msg) = &event {
			let drop_up = self.drop_up.read().expect("discard lock poisoned");
			if drop_up.as_ref().is_some_and(|pred| pred(msg)) {
				self.discarded.fetch_add(1, Ordering::SeqCst);
				tracing::debug!(src = ?msg.src(), "discarding message");
				return None;
			}
		}
		self.neighbors.pass_up(event)
	}
}

impl Protocol for Discard {
	fn name(&self) -> &'static str {
		Self::NAME
	}

	fn id(&self) -> ProtocolId {
		Self::ID
	}

	fn neighbors(&self) -> &Neighbors {
		&self.neighbors
	}

	fn down(&self, event: Event) -> Option<Event> {
		self.neighbors.pass_down(event)
	}

	fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
		self
	}
}
