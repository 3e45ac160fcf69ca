use {
	crate::address::Address,
	core::fmt,
	serde::{Deserialize, Serialize},
	std::collections::BTreeMap,
};

/// Highest delivered and received sequence numbers for one sender.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Seqnos {
	/// Highest seqno delivered to the application, gapless.
	pub delivered: u64,

	/// Highest seqno received from the sender, possibly ahead of
	/// `delivered` when gaps are outstanding.
	pub received: u64,
}

/// The reliability checkpoint of the group: for every known sender, how
/// far delivery has progressed on this node.
///
/// A digest captured by a state provider pins the point up to which the
/// provider's application state already reflects delivered messages;
/// installing it at the requester makes the reliable-delivery layer skip
/// everything at or below that point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
	entries: BTreeMap<Address, Seqnos>,
}

impl Digest {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_entries(
		entries: impl IntoIterator<Item = (Address, Seqnos)>,
	) -> Self {
		Self {
			entries: entries.into_iter().collect(),
		}
	}

	pub fn insert(&mut self, sender: Address, seqnos: Seqnos) {
		self.entries.insert(sender, seqnos);
	}

	pub fn get(&self, sender: &Address) -> Option<Seqnos> {
		self.entries.get(sender).copied()
	}

	pub fn contains(&self, sender: &Address) -> bool {
		self.entries.contains_key(sender)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Address, &Seqnos)> {
		self.entries.iter()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Merges another digest into this one, keeping the higher seqnos
	/// per sender.
	pub fn merge(&mut self, other: &Digest) {
		for (sender, seqnos) in &other.entries {
			let entry = self.entries.entry(*sender).or_default();
			entry.delivered = entry.delivered.max(seqnos.delivered);
			entry.received = entry.received.max(seqnos.received);
		}
	}

	/// Serialized size in bytes, used for framing budgets.
	pub fn size(&self) -> usize {
		crate::encoding::serialized_size(self)
	}
}

impl fmt::Display for Digest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{")?;
		for (i, (sender, seqnos)) in self.entries.iter().enumerate() {
			if i > 0 {
				write!(f, ", ")?;
			}
			write!(f, "{sender}: [{}|{}]", seqnos.delivered, seqnos.received)?;
		}
		write!(f, "}}")
	}
}
