//! The lower layers of the default stack: the loopback transport and the
//! reliable-delivery layer.

mod fifo;
mod loopback;

#[cfg(feature = "test-utils")]
mod discard;

pub use {
	fifo::{Fifo, FifoConfig, SeqnoHeader},
	loopback::Loopback,
};

#[cfg(feature = "test-utils")]
pub use discard::Discard;
