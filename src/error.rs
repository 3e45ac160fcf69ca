use crate::event::EventKind;

/// Errors surfaced by the channel facade.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
	#[error("channel is closed")]
	Closed,

	#[error("channel is not connected to a cluster")]
	NotConnected,

	#[error("no state transfer protocol in the stack")]
	NoStateProtocol,

	#[error("no executor protocol in the stack")]
	NoExecutorProtocol,

	#[error("a state transfer is already in progress")]
	StateTransferInProgress,

	#[error("state transfer timed out")]
	StateTransferTimeout,

	#[error("stack configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("protocol stack error: {0}")]
	Stack(#[from] StackError),
}

/// Errors raised while composing or running a protocol stack.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
	#[error(
		"protocol `{protocol}` requires {direction} service {service:?} which \
		 no other layer provides"
	)]
	MissingService {
		protocol: &'static str,
		direction: &'static str,
		service: EventKind,
	},

	#[error(
		"protocol stack cannot contain two state transfer protocols; remove \
		 either one of them"
	)]
	DuplicateStateTransfer,
}

/// Errors raised by the stack configuration input adapter.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("unparseable stack configuration: {0}")]
	Parse(String),

	#[error("unknown protocol `{0}`")]
	UnknownProtocol(String),

	#[error("protocol `{protocol}` does not understand property `{key}`")]
	UnknownProperty { protocol: String, key: String },

	#[error("invalid value for property `{key}`: {value}")]
	InvalidProperty { key: String, value: String },

	#[error("undefined variable `${{{0}}}` with no default")]
	UnresolvedVariable(String),

	#[error("failed to read stack configuration: {0}")]
	Io(#[from] std::io::Error),
}
