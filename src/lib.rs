//! Group communication toolkit.
//!
//! A `flock` node hosts a [`Channel`](prelude::Channel): a facade over an
//! ordered chain of protocol layers. Events descend from the application
//! through the chain to a transport and ascend from the transport back to
//! the application; every layer consumes, transforms or forwards each
//! event. On top of the chain ride the two higher-level services this
//! crate is about:
//!
//! - **state transfer**, which synchronizes a joining member with the group by
//!   atomically capturing a provider's delivery checkpoint and application
//!   state and installing both at the requester before any further
//!   delivery, and
//! - **the distributed executor**, which routes task submissions to a
//!   coordinator-elected consumer anywhere in the group and preserves
//!   request ownership across coordinator failover.

mod address;
mod channel;
mod config;
mod digest;
mod encoding;
mod error;
mod event;
mod executor;
mod message;
mod net;
mod primitives;
mod protocols;
mod stack;
mod state_transfer;
mod view;

pub mod prelude {
	pub use super::{
		address::Address,
		channel::{Channel, DEFAULT_STACK, NullReceiver, Receiver},
		config::{ProtocolConfig, StackConfig, substitute_variables},
		digest::{Digest, Seqnos},
		error::{ChannelError, ConfigError, StackError},
		event::{Event, EventKind, StateTransferInfo},
		executor::{
			CentralExecutor,
			CompletedTask,
			CompletionService,
			ExecHeader,
			ExecutionRunner,
			ExecutionService,
			Owner,
			RemoteTask,
			RunnerGuard,
			TaskContext,
			TaskError,
			TaskHandle,
			TaskRegistry,
		},
		message::{Header, Message},
		net::LoopbackNet,
		protocols::{Fifo, FifoConfig, Loopback, SeqnoHeader},
		stack::{
			Neighbors,
			Protocol,
			ProtocolId,
			ProtocolStack,
			UpHandler,
			registry,
		},
		state_transfer::{StateHeader, StateTransfer, StateTransferKind},
		view::{View, ViewId},
	};

	#[cfg(feature = "test-utils")]
	pub use super::protocols::Discard;
}

pub use prelude::*;
