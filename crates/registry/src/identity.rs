//! Opaque party identities.
//!
//! The registry does not manage producer or consumer lifecycles; it only
//! keys its bookkeeping on identity tokens handed in by the hosting layer.

use std::fmt;

/// Identity of a party publishing services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId(pub u64);

/// Identity of a party acquiring services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ProducerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "producer#{}", self.0)
	}
}

impl fmt::Display for ConsumerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "consumer#{}", self.0)
	}
}
