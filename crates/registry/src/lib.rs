//! A dynamic in-process service directory.
//!
//! Producers publish services under interface names with a property map;
//! consumers look them up by interface and/or predicate, acquire
//! per-consumer instances (lazily through factories where the producer
//! chooses), and release them again. Either side may appear, change, or
//! vanish while the other holds live references; handles to unpublished
//! records turn stale rather than dangling.
//!
//! # Modules
//!
//! - [`registry`] - The core: publish, update, unpublish, lookup, acquire,
//!   release, and the per-record in-flight slot protocol
//! - [`props`] - Immutable case-insensitive property snapshots
//! - [`filter`] - LDAP-style predicate parser and evaluator
//! - [`provider`] - Direct-instance and per-consumer factory providers
//! - [`hooks`] - Ranked find/event/event-listener hooks with shrink-only views
//! - [`dispatch`] - Listener registration and sync/async event delivery
//! - [`identity`] - Opaque producer/consumer identity tokens
//! - [`error`] - Error types

pub mod dispatch;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod identity;
pub mod props;
pub mod provider;
mod record;
pub mod registry;

pub use dispatch::{
	EventKind, FailureEvent, FailureListener, ListenerTarget, ServiceEvent, ServiceListener,
};
pub use error::{RegistryError, Result};
pub use filter::Filter;
pub use hooks::{EventHook, EventListenerHook, FindHook, Shrinkable};
pub use identity::{ConsumerId, ProducerId};
pub use props::{Properties, Value};
pub use provider::{BoxError, Provider, ServiceFactory, ServiceObj};
pub use record::Handle;
pub use registry::{Registry, RegistryConfig};
