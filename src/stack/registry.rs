//! Process-wide protocol registry.
//!
//! Maps protocol names to their ids and factories. The shipped protocols
//! are pre-registered; embedders may add their own before building any
//! stack. This registry is the only process-wide state in the crate.

use {
	super::{Protocol, ProtocolId},
	crate::{error::ConfigError, net::LoopbackNet},
	std::{
		collections::HashMap,
		sync::{Arc, OnceLock, RwLock},
	},
};

/// Everything a protocol factory needs to build one layer instance.
pub struct BuildContext {
	/// The in-process bus the stack's transport will attach to.
	pub net: LoopbackNet,

	/// Properties from the stack configuration for this layer.
	pub properties: HashMap<String, String>,
}

/// A protocol factory. Plain function pointers keep registrations
/// comparable and the registry free of lifetimes.
pub type BuildFn =
	fn(&BuildContext) -> Result<Arc<dyn Protocol>, ConfigError>;

struct Registration {
	id: ProtocolId,
	build: BuildFn,
}

fn registry() -> &'static RwLock<HashMap<String, Registration>> {
	static REGISTRY: OnceLock<RwLock<HashMap<String, Registration>>> =
		OnceLock::new();
	REGISTRY.get_or_init(|| {
		let mut map = HashMap::new();
		defaults(&mut map);
		RwLock::new(map)
	})
}

fn defaults(map: &mut HashMap<String, Registration>) {
	use crate::{
		executor::CentralExecutor,
		protocols::{Fifo, Loopback},
		state_transfer::StateTransfer,
	};

	map.insert(Loopback::NAME.into(), Registration {
		id: Loopback::ID,
		build: Loopback::build,
	});
	map.insert(Fifo::NAME.into(), Registration {
		id: Fifo::ID,
		build: Fifo::build,
	});
	map.insert(StateTransfer::NAME.into(), Registration {
		id: StateTransfer::ID,
		build: StateTransfer::build,
	});
	map.insert(CentralExecutor::NAME.into(), Registration {
		id: CentralExecutor::ID,
		build: CentralExecutor::build,
	});

	#[cfg(feature = "test-utils")]
	map.insert(crate::protocols::Discard::NAME.into(), Registration {
		id: crate::protocols::Discard::ID,
		build: crate::protocols::Discard::build,
	});
}

/// Registers a protocol under a name. Must happen before any stack using
/// the name is built. Re-registering the same `(name, id, factory)` is a
/// no-op; conflicting registrations are rejected.
pub fn register(
	name: &str,
	id: ProtocolId,
	build: BuildFn,
) -> Result<(), ConfigError> {
	let mut map = registry().write().expect("registry lock poisoned");
	if let Some(existing) = map.get(name) {
		if existing.id == id && std::ptr::fn_addr_eq(existing.build, build) {
			return Ok(());
		}
		return Err(ConfigError::Parse(format!(
			"protocol `{name}` is already registered with id {}",
			existing.id
		)));
	}
	if map.values().any(|r| r.id == id) {
		return Err(ConfigError::Parse(format!(
			"protocol id {id} is already taken"
		)));
	}
	map.insert(name.into(), Registration { id, build });
	Ok(())
}

/// The id registered for a protocol name.
pub fn id_of(name: &str) -> Option<ProtocolId> {
	registry()
		.read()
		.expect("registry lock poisoned")
		.get(name)
		.map(|r| r.id)
}

/// Builds one protocol layer by registered name.
pub(crate) fn build(
	name: &str,
	cx: &BuildContext,
) -> Result<Arc<dyn Protocol>, ConfigError> {
	let build = registry()
		.read()
		.expect("registry lock poisoned")
		.get(name)
		.map(|r| r.build)
		.ok_or_else(|| ConfigError::UnknownProtocol(name.into()))?;
	build(cx)
}
