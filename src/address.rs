use {
	crate::primitives::Short,
	core::{fmt, str::FromStr},
	derive_more::Deref,
	serde::{Deserialize, Deserializer, Serialize, de},
};

/// Uniquely identifies a group member.
///
/// Addresses are opaque 32-byte values minted by the transport layer when a
/// channel connects to a cluster. They are hashable and totally ordered so
/// that every node ranks the membership identically.
///
/// Notes:
///  - when serialized to human readable formats addresses are represented
///    as hex-encoded strings.
///  - when serialized to binary formats addresses are raw 32-byte arrays.
#[derive(Clone, Copy, Deref, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 32]);

impl Address {
	/// Mints a fresh random address. Called by the transport at connect
	/// time; two connects never observe the same address.
	pub fn random() -> Self {
		Self(*blake3::hash(&rand::random::<[u8; 16]>()).as_bytes())
	}

	/// Returns the byte representation of the address.
	pub const fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	/// Builds an address from raw bytes. Used by codecs and tests that
	/// need deterministic identities.
	pub const fn from_bytes(bytes: [u8; 32]) -> Self {
		Self(bytes)
	}
}

impl AsRef<[u8]> for Address {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

impl From<&str> for Address {
	fn from(s: &str) -> Self {
		Self(*blake3::hash(s.as_bytes()).as_bytes())
	}
}

impl FromStr for Address {
	type Err = core::convert::Infallible;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self::from(s))
	}
}

impl fmt::Debug for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", Short(self.0))
	}
}

impl Serialize for Address {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		if serializer.is_human_readable() {
			serializer.serialize_str(&hex::encode(self.0))
		} else {
			self.0.serialize(serializer)
		}
	}
}

impl<'de> Deserialize<'de> for Address {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		if deserializer.is_human_readable() {
			let s = String::deserialize(deserializer)?;
			let bytes = hex::decode(&s).map_err(de::Error::custom)?;
			let bytes: [u8; 32] = bytes
				.try_into()
				.map_err(|_| de::Error::custom("address must be 32 bytes"))?;
			Ok(Self(bytes))
		} else {
			Ok(Self(<[u8; 32]>::deserialize(deserializer)?))
		}
	}
}
