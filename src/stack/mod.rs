//! The layered protocol stack.
//!
//! A stack is an ordered chain of protocols, top to bottom. Events enter
//! at either end and traverse layer by layer; each layer consumes,
//! transforms or forwards. The stack owns every protocol and wires the
//! non-owning neighbor references between them.

mod protocol;
pub mod registry;

pub use protocol::{Neighbors, Protocol, ProtocolId, UpHandler};
pub(crate) use protocol::UpRef;

use {
	crate::{
		error::StackError,
		event::{Event, EventKind},
	},
	std::sync::{
		Arc,
		RwLock,
		Weak,
		atomic::{AtomicBool, Ordering},
	},
};

/// An ordered chain of protocols, index 0 at the top.
pub struct ProtocolStack {
	protocols: RwLock<Vec<Arc<dyn Protocol>>>,
	top_handler: RwLock<Option<Weak<dyn UpHandler>>>,
	started: AtomicBool,
}

impl ProtocolStack {
	/// Builds a stack from protocols ordered top to bottom and wires
	/// their neighbor references.
	pub fn new(protocols: Vec<Arc<dyn Protocol>>) -> Self {
		let stack = Self {
			protocols: RwLock::new(protocols),
			top_handler: RwLock::new(None),
			started: AtomicBool::new(false),
		};
		stack.rewire();
		stack
	}

	/// Installs the handler that receives events passing over the top of
	/// the stack (the channel core).
	pub fn set_top_handler(&self, handler: Weak<dyn UpHandler>) {
		*self.top_handler.write().expect("stack lock poisoned") = Some(handler);
		self.rewire();
	}

	pub fn insert_at_top(&self, protocol: Arc<dyn Protocol>) {
		self
			.protocols
			.write()
			.expect("stack lock poisoned")
			.insert(0, protocol);
		self.rewire();
	}

	pub fn insert_at_bottom(&self, protocol: Arc<dyn Protocol>) {
		self
			.protocols
			.write()
			.expect("stack lock poisoned")
			.push(protocol);
		self.rewire();
	}

	/// Finds the first protocol of the given concrete type, top down.
	pub fn find_by_type<P: Protocol>(&self) -> Option<Arc<P>> {
		self
			.protocols
			.read()
			.expect("stack lock poisoned")
			.iter()
			.find_map(|p| Arc::clone(p).as_any_arc().downcast::<P>().ok())
	}

	pub fn find_by_name(&self, name: &str) -> Option<Arc<dyn Protocol>> {
		self
			.protocols
			.read()
			.expect("stack lock poisoned")
			.iter()
			.find(|p| p.name() == name)
			.cloned()
	}

	/// Protocol names, top to bottom.
	pub fn names(&self) -> Vec<&'static str> {
		self
			.protocols
			.read()
			.expect("stack lock poisoned")
			.iter()
			.map(|p| p.name())
			.collect()
	}

	/// Checks that every layer's required services are honored by the
	/// composed stack.
	///
	/// Down services must be provided by some lower layer; up services by
	/// some higher layer or by the over-the-top handler, whose provided
	/// set is passed in by the caller.
	pub fn validate(&self, top_provided: &[EventKind]) -> Result<(), StackError> {
		let protocols = self.protocols.read().expect("stack lock poisoned");
		for (i, protocol) in protocols.iter().enumerate() {
			for service in protocol.required_down_services() {
				let satisfied = protocols[i + 1..]
					.iter()
					.any(|p| p.provided_down_services().contains(service));
				if !satisfied {
					return Err(StackError::MissingService {
						protocol: protocol.name(),
						direction: "down",
						service: *service,
					});
				}
			}
			for service in protocol.required_up_services() {
				let satisfied = protocols[..i]
					.iter()
					.any(|p| p.provided_up_services().contains(service))
					|| top_provided.contains(service);
				if !satisfied {
					return Err(StackError::MissingService {
						protocol: protocol.name(),
						direction: "up",
						service: *service,
					});
				}
			}
		}
		Ok(())
	}

	/// Starts all protocols bottom to top. Idempotent.
	///
	/// On failure the layers already started are stopped again and the
	/// error is surfaced to the caller.
	pub fn start(&self) -> Result<(), StackError> {
		if self.started.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		let protocols = self
			.protocols
			.read()
			.expect("stack lock poisoned")
			.clone();

		for protocol in protocols.iter().rev() {
			protocol.init()?;
		}

		for (i, protocol) in protocols.iter().enumerate().rev() {
			if let Err(e) = protocol.start() {
				for started in protocols[i + 1..].iter() {
					started.stop();
				}
				self.started.store(false, Ordering::SeqCst);
				return Err(e);
			}
		}

		Ok(())
	}

	/// Stops all protocols top to bottom. Idempotent.
	pub fn stop(&self) {
		if !self.started.swap(false, Ordering::SeqCst) {
			return;
		}
		let protocols = self
			.protocols
			.read()
			.expect("stack lock poisoned")
			.clone();
		for protocol in &protocols {
			protocol.stop();
		}
	}

	/// Injects an event at the bottom of the stack, flowing up.
	pub fn up(&self, event: Event) -> Option<Event> {
		let bottom = self
			.protocols
			.read()
			.expect("stack lock poisoned")
			.last()
			.cloned()?;
		bottom.up(event)
	}

	/// Injects an event at the top of the stack, flowing down.
	pub fn down(&self, event: Event) -> Option<Event> {
		let top = self
			.protocols
			.read()
			.expect("stack lock poisoned")
			.first()
			.cloned()?;
		top.down(event)
	}

	/// Re-establishes every layer's neighbor references after a
	/// composition change.
	fn rewire(&self) {
		let protocols = self.protocols.read().expect("stack lock poisoned");
		let top = self.top_handler.read().expect("stack lock poisoned");

		for (i, protocol) in protocols.iter().enumerate() {
			let up = if i == 0 {
				top.clone().map(UpRef::Top)
			} else {
				Some(UpRef::Protocol(Arc::downgrade(&protocols[i - 1])))
			};
			let down = protocols.get(i + 1).map(Arc::downgrade);
			protocol.neighbors().set_up(up);
			protocol.neighbors().set_down(down);
		}
	}
}

impl Drop for ProtocolStack {
	fn drop(&mut self) {
		self.stop();
	}
}
