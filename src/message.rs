use {
	crate::{
		address::Address,
		executor::ExecHeader,
		protocols::SeqnoHeader,
		stack::ProtocolId,
		state_transfer::StateHeader,
	},
	bytes::Bytes,
	serde::{Deserialize, Serialize},
};

/// A per-protocol header attached to a [`Message`].
///
/// Headers form a closed sum over the protocols shipped with the crate;
/// each protocol reads and writes only the variant carrying its own id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Header {
	Seqno(SeqnoHeader),
	State(StateHeader),
	Exec(ExecHeader),
}

impl Header {
	/// Serialized size in bytes, used for framing budgets.
	pub fn size(&self) -> usize {
		crate::encoding::serialized_size(self)
	}
}

/// An immutable message frame.
///
/// `dest == None` addresses the whole group. Headers are attach-only:
/// [`Message::put_header`] adds a header for a protocol id, and layers
/// below must never mutate a header attached above them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
	dest: Option<Address>,
	src: Option<Address>,
	payload: Bytes,
	headers: Vec<(ProtocolId, Header)>,
}

impl Message {
	pub fn new(dest: Option<Address>, payload: impl Into<Bytes>) -> Self {
		Self {
			dest,
			src: None,
			payload: payload.into(),
			headers: Vec::new(),
		}
	}

	pub fn unicast(dest: Address, payload: impl Into<Bytes>) -> Self {
		Self::new(Some(dest), payload)
	}

	pub fn multicast(payload: impl Into<Bytes>) -> Self {
		Self::new(None, payload)
	}

	pub fn dest(&self) -> Option<Address> {
		self.dest
	}

	pub fn src(&self) -> Option<Address> {
		self.src
	}

	/// Stamped by the transport on the way out.
	pub(crate) fn set_src(&mut self, src: Address) {
		self.src = Some(src);
	}

	pub fn payload(&self) -> &Bytes {
		&self.payload
	}

	pub fn len(&self) -> usize {
		self.payload.len()
	}

	pub fn is_empty(&self) -> bool {
		self.payload.is_empty()
	}

	/// Attaches a header under the given protocol id.
	#[must_use]
	pub fn put_header(mut self, id: ProtocolId, header: Header) -> Self {
		debug_assert!(
			self.header(id).is_none(),
			"protocol {id} attached two headers"
		);
		self.headers.push((id, header));
		self
	}

	/// Returns the header attached under the given protocol id, if any.
	pub fn header(&self, id: ProtocolId) -> Option<&Header> {
		self
			.headers
			.iter()
			.find(|(hid, _)| *hid == id)
			.map(|(_, h)| h)
	}

	/// Total serialized size of all attached headers.
	pub fn headers_size(&self) -> usize {
		self.headers.iter().map(|(_, h)| h.size()).sum()
	}
}
