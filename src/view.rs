use {
	crate::address::Address,
	core::fmt,
	itertools::Itertools,
	serde::{Deserialize, Serialize},
};

/// Identifies one generation of the group membership.
///
/// View ids grow monotonically: for any two views delivered to the same
/// node, the later view carries the greater id.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ViewId {
	/// Monotonically increasing generation counter.
	pub epoch: u64,

	/// The member that installed this view.
	pub creator: Address,
}

/// A totally ordered snapshot of the group membership.
///
/// The first member is the coordinator by convention. Views are delivered
/// in total order on every node: all members observe the same sequence of
/// views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
	pub id: ViewId,
	pub members: Vec<Address>,
}

impl View {
	pub fn new(id: ViewId, members: Vec<Address>) -> Self {
		Self { id, members }
	}

	/// The coordinator of this view, `None` only for an empty view.
	pub fn coordinator(&self) -> Option<Address> {
		self.members.first().copied()
	}

	pub fn contains(&self, member: &Address) -> bool {
		self.members.contains(member)
	}

	pub fn len(&self) -> usize {
		self.members.len()
	}

	pub fn is_empty(&self) -> bool {
		self.members.is_empty()
	}
}

impl fmt::Display for View {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"[{}|{}] ({})",
			self.id.epoch,
			self.id.creator,
			self.members.iter().map(|m| m.to_string()).join(", ")
		)
	}
}
