//! Publication records and handles.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;

use crate::hooks::HookPayload;
use crate::identity::ProducerId;
use crate::props::Properties;
use crate::provider::Provider;

/// The registry's internal representation of one published service.
///
/// The property snapshot is replaced wholesale on update; readers always see
/// a consistent snapshot without taking any lock. The validity flag flips
/// exactly once, on unpublication, and never back.
pub(crate) struct PublicationRecord {
	id: u64,
	interfaces: Box<[Box<str>]>,
	props: ArcSwap<Properties>,
	provider: Provider,
	producer: ProducerId,
	/// Typed hook payload when this record was published as a hook.
	hook: Option<HookPayload>,
	valid: AtomicBool,
	/// One-shot latch: set when unpublication starts, so a second unpublish
	/// fails fast instead of racing the drain.
	unregistering: AtomicBool,
}

impl PublicationRecord {
	pub(crate) fn new(
		id: u64,
		interfaces: Box<[Box<str>]>,
		props: Properties,
		provider: Provider,
		producer: ProducerId,
		hook: Option<HookPayload>,
	) -> Self {
		Self {
			id,
			interfaces,
			props: ArcSwap::from_pointee(props),
			provider,
			producer,
			hook,
			valid: AtomicBool::new(true),
			unregistering: AtomicBool::new(false),
		}
	}

	pub(crate) fn id(&self) -> u64 {
		self.id
	}

	pub(crate) fn interfaces(&self) -> &[Box<str>] {
		&self.interfaces
	}

	pub(crate) fn producer(&self) -> ProducerId {
		self.producer
	}

	pub(crate) fn provider(&self) -> &Provider {
		&self.provider
	}

	pub(crate) fn hook(&self) -> Option<&HookPayload> {
		self.hook.as_ref()
	}

	pub(crate) fn props(&self) -> Arc<Properties> {
		self.props.load_full()
	}

	/// Swaps in a new snapshot and returns the one it replaced.
	pub(crate) fn swap_props(&self, next: Arc<Properties>) -> Arc<Properties> {
		self.props.swap(next)
	}

	pub(crate) fn is_valid(&self) -> bool {
		self.valid.load(Ordering::Acquire)
	}

	pub(crate) fn invalidate(&self) {
		self.valid.store(false, Ordering::Release);
	}

	/// Claims the unregistration latch. Returns false if someone already did.
	pub(crate) fn begin_unregistering(&self) -> bool {
		self.unregistering
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}
}

/// The externally visible reference to a publication record.
///
/// Handles stay cheap to clone and remain usable for `release` during forced
/// drain even after the record turns invalid; every other operation on a
/// stale handle fails fast.
#[derive(Clone)]
pub struct Handle {
	record: Arc<PublicationRecord>,
}

impl Handle {
	pub(crate) fn new(record: Arc<PublicationRecord>) -> Self {
		Self { record }
	}

	pub(crate) fn record(&self) -> &PublicationRecord {
		&self.record
	}

	/// The record's registry-lifetime-unique id.
	pub fn id(&self) -> u64 {
		self.record.id
	}

	/// Interface names this service is advertised under.
	pub fn interfaces(&self) -> &[Box<str>] {
		&self.record.interfaces
	}

	/// The owning producer.
	pub fn producer(&self) -> ProducerId {
		self.record.producer
	}

	/// The current property snapshot.
	pub fn properties(&self) -> Arc<Properties> {
		self.record.props()
	}

	/// Current lookup rank (`service.rank`, default 0).
	pub fn rank(&self) -> i64 {
		self.record.props.load().rank()
	}

	/// Whether the record is still published.
	pub fn is_valid(&self) -> bool {
		self.record.is_valid()
	}
}

impl PartialEq for Handle {
	fn eq(&self, other: &Self) -> bool {
		self.record.id == other.record.id
	}
}

impl Eq for Handle {}

impl std::hash::Hash for Handle {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.record.id.hash(state);
	}
}

impl fmt::Debug for Handle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Handle")
			.field("id", &self.record.id)
			.field("interfaces", &self.record.interfaces)
			.field("valid", &self.record.is_valid())
			.finish()
	}
}
