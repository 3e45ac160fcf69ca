use {
	crate::{message::Message, view::View},
	bytes::Bytes,
};

/// Application callbacks, invoked from the channel's delivery task.
///
/// `get_state` is the one exception: the state-transfer layer calls it
/// inline while the delivery barrier is closed, so the returned snapshot
/// is consistent with the captured digest. Keep it fast.
pub trait Receiver: Send + Sync + 'static {
	/// A message addressed to this node or to the whole group.
	fn receive(&self, _msg: Message) {}

	/// A new membership snapshot was installed.
	fn view_accepted(&self, _view: &View) {}

	/// Produce the application state for a requesting member.
	fn get_state(&self) -> Option<Bytes> {
		None
	}

	/// Install state received from a provider; `None` when there was no
	/// provider or it crashed mid-transfer.
	fn set_state(&self, _state: Option<Bytes>) {}
}

/// A receiver that ignores everything.
pub struct NullReceiver;

impl Receiver for NullReceiver {}
