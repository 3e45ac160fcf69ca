use core::fmt;

/// Formats an id-like byte string as a short hex prefix for log output.
pub(crate) struct Short<T>(pub T);

impl<T: AsRef<[u8]>> fmt::Display for Short<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let bytes = self.0.as_ref();
		let prefix = &bytes[..bytes.len().min(5)];
		write!(f, "{}", hex::encode(prefix))
	}
}
