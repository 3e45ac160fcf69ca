use {
	crate::{address::Address, digest::Digest},
	core::fmt,
	serde::{Deserialize, Serialize},
};

/// Discriminates the two state-transfer wire messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateTransferKind {
	Request,
	Response,
}

/// Wire header for a state request or response.
///
/// The transferred state itself never rides in the header; it travels in
/// the message buffer. The digest is only present on responses and is
/// framed with a presence flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHeader {
	pub kind: StateTransferKind,

	/// Distinguishes transfers started close together; the requester's
	/// wall clock at request time.
	pub id: u64,

	/// Sender of the request or response.
	pub sender: Address,

	/// The provider's delivery checkpoint, captured before its state was
	/// read. Responses only.
	pub digest: Option<Digest>,
}

impl StateHeader {
	pub fn request(sender: Address, id: u64) -> Self {
		Self {
			kind: StateTransferKind::Request,
			id,
			sender,
			digest: None,
		}
	}

	pub fn response(sender: Address, digest: Option<Digest>) -> Self {
		Self {
			kind: StateTransferKind::Response,
			id: 0,
			sender,
			digest,
		}
	}

	/// Serialized size in bytes, used for framing budgets.
	pub fn size(&self) -> usize {
		crate::encoding::serialized_size(self)
	}
}

impl fmt::Display for StateHeader {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?} from {}", self.kind, self.sender)?;
		if self.id != 0 {
			write!(f, " id={}", self.id)?;
		}
		if let Some(digest) = &self.digest {
			write!(f, " digest={digest}")?;
		}
		Ok(())
	}
}
