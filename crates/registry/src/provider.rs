//! Service providers.
//!
//! A publication is backed either by one shared instance or by a factory
//! that builds one instance per consumer. The registry never calls a factory
//! while holding its global lock.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::{RegistryError, Result};
use crate::identity::ConsumerId;

/// The opaque instance handed to consumers.
pub type ServiceObj = Arc<dyn Any + Send + Sync>;

/// Error type factories may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-consumer lazy instantiation.
///
/// `create` runs at most once per (record, consumer) pair while a cached
/// instance exists; `release` runs when the last reference for that consumer
/// is dropped or the record is force-drained on unpublication.
pub trait ServiceFactory: Send + Sync {
	fn create(&self, consumer: ConsumerId) -> std::result::Result<ServiceObj, BoxError>;
	fn release(&self, consumer: ConsumerId, instance: ServiceObj);
}

/// What backs a publication record.
#[derive(Clone)]
pub enum Provider {
	/// One shared instance handed to every consumer.
	Instance(ServiceObj),
	/// A factory invoked once per consumer.
	Factory(Arc<dyn ServiceFactory>),
}

impl Provider {
	/// Wraps a concrete value as a shared-instance provider.
	pub fn instance<T: Any + Send + Sync>(value: T) -> Self {
		Provider::Instance(Arc::new(value))
	}

	/// Wraps a factory.
	pub fn factory<F: ServiceFactory + 'static>(factory: F) -> Self {
		Provider::Factory(Arc::new(factory))
	}

	/// Produces the instance for `consumer`. A factory panic or error is
	/// surfaced as [`RegistryError::Factory`] with the cause attached.
	pub(crate) fn instantiate(&self, consumer: ConsumerId) -> Result<ServiceObj> {
		match self {
			Provider::Instance(obj) => Ok(obj.clone()),
			Provider::Factory(factory) => {
				let outcome =
					catch_unwind(AssertUnwindSafe(|| factory.create(consumer)));
				match outcome {
					Ok(Ok(obj)) => Ok(obj),
					Ok(Err(cause)) => Err(RegistryError::Factory(cause)),
					Err(panic) => Err(RegistryError::Factory(
						format!("factory panicked: {}", panic_message(panic.as_ref())).into(),
					)),
				}
			}
		}
	}

	/// Releases a previously created instance. Factory failures are logged,
	/// never propagated.
	pub(crate) fn release(&self, consumer: ConsumerId, instance: ServiceObj) {
		if let Provider::Factory(factory) = self {
			let outcome = catch_unwind(AssertUnwindSafe(|| {
				factory.release(consumer, instance);
			}));
			if let Err(panic) = outcome {
				tracing::error!(
					%consumer,
					"factory release panicked: {}",
					panic_message(panic.as_ref())
				);
			}
		}
	}
}

/// Best-effort rendering of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
	if let Some(s) = panic.downcast_ref::<&str>() {
		s
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s
	} else {
		"non-string panic payload"
	}
}
