use {
	crate::address::Address,
	core::fmt,
	serde::{Deserialize, Serialize},
};

/// Uniquely identifies a task submission across the group, and survives
/// coordinator failover: the submitter's address plus its locally
/// monotonic request id.
///
/// Consumer advertisements reuse the same shape with a runner-local id.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	PartialOrd,
	Ord,
	Hash,
	Serialize,
	Deserialize,
)]
pub struct Owner {
	pub address: Address,
	pub request_id: u64,
}

impl fmt::Display for Owner {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.address, self.request_id)
	}
}

/// Wire frames of the executor protocol. Bodies (the serialized task for
/// dispatch, the serialized result or error text for completion) ride in
/// the message buffer, not the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecHeader {
	/// Submitter → coordinator: queue this task.
	RunRequest { owner: Owner },

	/// Consumer host → coordinator: a runner is idle.
	ConsumerReady { consumer: Owner },

	/// Consumer host → coordinator: a runner is leaving.
	ConsumerUnready { consumer: Owner },

	/// Coordinator → consumer host: execute this task.
	TaskDispatch { owner: Owner, consumer: Owner },

	/// Consumer host → submitter: the task started; failover must not
	/// re-send it.
	TaskAccepted { owner: Owner },

	/// Consumer host → submitter: completed, result in the buffer.
	TaskResult { owner: Owner },

	/// Consumer host → submitter: failed, error text in the buffer.
	TaskException { owner: Owner },

	/// Coordinator or consumer host → submitter: cancelled.
	TaskCancelled { owner: Owner },

	/// Submitter → coordinator, possibly forwarded to the executing
	/// consumer: abandon the task.
	CancelRequest { owner: Owner, interrupt: bool },
}

impl ExecHeader {
	/// Serialized size in bytes, used for framing budgets.
	pub fn size(&self) -> usize {
		crate::encoding::serialized_size(self)
	}
}
