use {
	crate::{address::Address, digest::Digest, message::Message, view::View},
	bytes::Bytes,
	core::time::Duration,
	std::collections::HashMap,
};

/// Parameters and result of one state transfer.
///
/// On the way down (`GetState`) `target` selects the provider (`None`
/// picks the coordinator) and `timeout` bounds the wait. On the way up
/// (`GetStateOk`) `target` carries the provider that answered and `state`
/// the transferred bytes, `None` when there was no provider or it crashed.
#[derive(Debug, Clone, Default)]
pub struct StateTransferInfo {
	pub target: Option<Address>,
	pub timeout: Duration,
	pub state: Option<Bytes>,
}

impl StateTransferInfo {
	pub fn request(target: Option<Address>, timeout: Duration) -> Self {
		Self { target, timeout, state: None }
	}

	pub fn response(provider: Option<Address>, state: Option<Bytes>) -> Self {
		Self {
			target: provider,
			timeout: Duration::ZERO,
			state,
		}
	}
}

/// The envelope passed between layers of a protocol stack.
///
/// Every layer decides per tag whether to consume, transform or forward an
/// event. Some tags are request/reply pairs (`GetDigest`/`GetDigestOk`,
/// `GetApplState`/`GetApplStateOk`): the reply travels back as the return
/// value of the `up`/`down` call that submitted the request.
#[derive(Debug, Clone)]
pub enum Event {
	/// A message travelling through the stack in either direction.
	Msg(Message),

	/// Join the named cluster. Consumed by the transport.
	Connect(String),

	/// Leave the current cluster. Consumed by the transport.
	Disconnect,

	/// A new membership snapshot, delivered in total order.
	ViewChange(View),

	/// A provisional membership snapshot during a pending view install.
	TmpView(View),

	/// Inter-layer configuration exchange.
	Config(HashMap<String, String>),

	/// The transport's identity for this node, announced at connect time.
	SetLocalAddress(Address),

	/// Application asks for the group state.
	GetState(StateTransferInfo),

	/// State transfer finished; carries provider and state bytes.
	GetStateOk(StateTransferInfo),

	/// State protocol asks the application for its current state.
	GetApplState(StateTransferInfo),

	/// Application's reply to `GetApplState`.
	GetApplStateOk(StateTransferInfo),

	/// Ask the reliable-delivery layer for its delivery checkpoint.
	GetDigest,

	/// Reply to `GetDigest`.
	GetDigestOk(Digest),

	/// Install a delivery checkpoint in the reliable-delivery layer.
	OverwriteDigest(Digest),

	/// Pause upward message delivery. Nests.
	CloseBarrier,

	/// Undo one `CloseBarrier`; delivery resumes at depth zero.
	OpenBarrier,

	/// Suspend the message-GC/stability machinery for at most the given
	/// duration.
	SuspendStable(Duration),

	/// Resume the message-GC/stability machinery.
	ResumeStable,
}

impl Event {
	pub fn kind(&self) -> EventKind {
		match self {
			Event::Msg(_) => EventKind::Msg,
			Event::Connect(_) => EventKind::Connect,
			Event::Disconnect => EventKind::Disconnect,
			Event::ViewChange(_) => EventKind::ViewChange,
			Event::TmpView(_) => EventKind::TmpView,
			Event::Config(_) => EventKind::Config,
			Event::SetLocalAddress(_) => EventKind::SetLocalAddress,
			Event::GetState(_) => EventKind::GetState,
			Event::GetStateOk(_) => EventKind::GetStateOk,
			Event::GetApplState(_) => EventKind::GetApplState,
			Event::GetApplStateOk(_) => EventKind::GetApplStateOk,
			Event::GetDigest => EventKind::GetDigest,
			Event::GetDigestOk(_) => EventKind::GetDigestOk,
			Event::OverwriteDigest(_) => EventKind::OverwriteDigest,
			Event::CloseBarrier => EventKind::CloseBarrier,
			Event::OpenBarrier => EventKind::OpenBarrier,
			Event::SuspendStable(_) => EventKind::SuspendStable,
			Event::ResumeStable => EventKind::ResumeStable,
		}
	}
}

/// Discriminant of [`Event`], used to declare and validate the services a
/// layer requires from its neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	Msg,
	Connect,
	Disconnect,
	ViewChange,
	TmpView,
	Config,
	SetLocalAddress,
	GetState,
	GetStateOk,
	GetApplState,
	GetApplStateOk,
	GetDigest,
	GetDigestOk,
	OverwriteDigest,
	CloseBarrier,
	OpenBarrier,
	SuspendStable,
	ResumeStable,
}
