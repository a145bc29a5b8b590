use thiserror::Error;

/// Errors surfaced by registry operations.
///
/// Only caller-facing failures appear here. Failures raised by user-supplied
/// code while the registry maintains its own invariants (forced drain, hook
/// and listener invocation) are caught at the boundary and logged instead.
#[derive(Error, Debug)]
pub enum RegistryError {
	/// Operation on a record that has been unpublished.
	#[error("stale handle: record {0} is no longer published")]
	StaleHandle(u64),
	/// A factory callback re-entered the record it is operating on, on the
	/// same thread.
	#[error("re-entrant cycle on record {0}")]
	ReentrantCycle(u64),
	/// Provider instantiation failed or produced no instance.
	#[error("factory error: {0}")]
	Factory(#[source] Box<dyn std::error::Error + Send + Sync>),
	/// Publish-time property map contained a case-insensitive key collision.
	#[error("duplicate service property: {key}")]
	DuplicateProperty {
		/// The colliding key, as supplied by the caller.
		key: String,
	},
	/// A required argument was missing or empty.
	#[error("invalid argument: {0}")]
	InvalidArgument(&'static str),
	/// A predicate string failed to parse.
	#[error("filter syntax error at byte {position}: {reason}")]
	FilterSyntax {
		/// Byte offset of the failure in the input.
		position: usize,
		/// What the parser expected or rejected.
		reason: &'static str,
	},
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RegistryError>;
