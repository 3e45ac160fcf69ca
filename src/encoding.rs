//! Wire codec.
//!
//! Everything that crosses the bus (message frames, headers, task
//! payloads, results) goes through these two functions, so the crate has
//! exactly one wire format: `postcard`.

use {
	bytes::Bytes,
	serde::{Serialize, de::DeserializeOwned},
};

/// Encodes a value into an owned buffer.
///
/// # Panics
///
/// When the `Serialize` impl itself reports an error. The wire types in
/// this crate are plain data and never do.
pub fn serialize<T: Serialize>(value: &T) -> Bytes {
	match postcard::to_allocvec(value) {
		Ok(encoded) => encoded.into(),
		Err(e) => panic!("wire type failed to encode: {e}"),
	}
}

pub fn deserialize<T: DeserializeOwned>(
	bytes: impl AsRef<[u8]>,
) -> Result<T, postcard::Error> {
	postcard::from_bytes(bytes.as_ref())
}

/// Serialized size of a value, used for framing budgets.
pub fn serialized_size<T: Serialize>(value: &T) -> usize {
	serialize(value).len()
}
