use {
	crate::{
		error::StackError,
		event::{Event, EventKind},
	},
	std::{
		any::Any,
		sync::{Arc, RwLock, Weak},
	},
};

/// Identifies a protocol inside a stack and keys its message headers.
pub type ProtocolId = u16;

/// Anything that can receive events travelling up the stack. Implemented
/// by every protocol and by the channel core sitting on top of the chain.
pub trait UpHandler: Send + Sync + 'static {
	/// Handles an event arriving from below. Returns `None` when the event
	/// was consumed, or a reply/event to propagate back to the caller.
	fn up(&self, event: Event) -> Option<Event>;
}

/// One layer of a protocol stack.
///
/// A protocol's `up` and `down` entry points are re-entrant and may be
/// called from arbitrary threads; each layer owns its synchronization.
/// Unconsumed events are forwarded to the neighbor through
/// [`Neighbors::pass_up`] / [`Neighbors::pass_down`], exactly mirroring
/// how replies travel back as return values.
pub trait Protocol: UpHandler {
	fn name(&self) -> &'static str;

	/// The id under which this protocol attaches message headers.
	fn id(&self) -> ProtocolId;

	/// The neighbor references wired by the owning stack.
	fn neighbors(&self) -> &Neighbors;

	fn init(&self) -> Result<(), StackError> {
		Ok(())
	}

	fn start(&self) -> Result<(), StackError> {
		Ok(())
	}

	fn stop(&self) {}

	/// Event tags this layer will send down and needs a lower layer to
	/// honor.
	fn required_down_services(&self) -> &'static [EventKind] {
		&[]
	}

	/// Event tags this layer will send up and needs a higher layer (or
	/// the channel) to honor.
	fn required_up_services(&self) -> &'static [EventKind] {
		&[]
	}

	/// Event tags this layer consumes and answers on the way down.
	fn provided_down_services(&self) -> &'static [EventKind] {
		&[]
	}

	/// Event tags this layer consumes and answers on the way up.
	fn provided_up_services(&self) -> &'static [EventKind] {
		&[]
	}

	/// Handles an event descending from above. Returns `None` when the
	/// event was consumed, or a reply to propagate back to the caller.
	fn down(&self, event: Event) -> Option<Event>;

	/// Type-erased self, used by [`ProtocolStack::find_by_type`].
	///
	/// [`ProtocolStack::find_by_type`]: super::ProtocolStack::find_by_type
	fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// The upward neighbor of a layer: either another protocol or the channel
/// core over the top of the stack.
#[derive(Clone)]
pub(crate) enum UpRef {
	Protocol(Weak<dyn Protocol>),
	Top(Weak<dyn UpHandler>),
}

/// Non-owning references to a layer's immediate neighbors.
///
/// The stack owns every protocol and rewires these on composition changes;
/// a layer only ever forwards through them.
#[derive(Default)]
pub struct Neighbors {
	up: RwLock<Option<UpRef>>,
	down: RwLock<Option<Weak<dyn Protocol>>>,
}

impl Neighbors {
	pub(crate) fn set_up(&self, up: Option<UpRef>) {
		*self.up.write().expect("neighbors lock poisoned") = up;
	}

	pub(crate) fn set_down(&self, down: Option<Weak<dyn Protocol>>) {
		*self.down.write().expect("neighbors lock poisoned") = down;
	}

	/// Forwards an event to the layer above, or to the channel when this
	/// is the top layer. Events falling off an unwired top are dropped.
	pub fn pass_up(&self, event: Event) -> Option<Event> {
		let up = self.up.read().expect("neighbors lock poisoned").clone();
		match up {
			Some(UpRef::Protocol(p)) => p.upgrade()?.up(event),
			Some(UpRef::Top(t)) => t.upgrade()?.up(event),
			None => {
				tracing::trace!(kind = ?event.kind(), "event fell off the stack top");
				None
			}
		}
	}

	/// Forwards an event to the layer below. Events falling off the
	/// bottom are dropped.
	pub fn pass_down(&self, event: Event) -> Option<Event> {
		let down = self.down.read().expect("neighbors lock poisoned").clone();
		match down.and_then(|w| w.upgrade()) {
			Some(p) => p.down(event),
			None => {
				tracing::trace!(kind = ?event.kind(), "event fell off the stack bottom");
				None
			}
		}
	}
}
