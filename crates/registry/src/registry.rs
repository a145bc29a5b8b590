//! The registry core.
//!
//! One global mutex guards the interface index, the per-consumer usage
//! entries, and the in-flight slot map; a single condvar signals slot
//! release and record invalidation. Nothing user-supplied ever runs while
//! that lock is held: factories, hooks, and listeners are all invoked
//! between lock sections, with the in-flight slot standing in for the lock
//! where per-record exclusivity is needed.

use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::dispatch::{
	Dispatcher, EventKind, FailureListener, ServiceEvent, ServiceListener,
};
use crate::error::{RegistryError, Result};
use crate::filter::Filter;
use crate::hooks::{
	EVENT_HOOK, EVENT_LISTENER_HOOK, EventHook, EventListenerHook, FIND_HOOK, FindHook, HookIndex,
	HookPayload,
};
use crate::identity::{ConsumerId, ProducerId};
use crate::props::{Properties, Value};
use crate::provider::{Provider, ServiceObj};
use crate::record::{Handle, PublicationRecord};

/// Registry construction options.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
	/// Deliver every event on the thread that raised it, ignoring the
	/// per-listener asynchronous default. Mostly useful in tests.
	pub synchronous_delivery: bool,
}

/// Live interest of one consumer in one record.
struct UsageEntry {
	handle: Handle,
	/// Cached instance; `None` until the first instantiation succeeds.
	instance: Option<ServiceObj>,
	count: u64,
}

#[derive(Default)]
struct Inner {
	records: FxHashMap<u64, Handle>,
	by_interface: FxHashMap<Box<str>, Vec<Handle>>,
	by_producer: FxHashMap<ProducerId, Vec<Handle>>,
	/// Record id -> thread currently instantiating or releasing it.
	in_flight: FxHashMap<u64, ThreadId>,
	usages: FxHashMap<ConsumerId, Vec<UsageEntry>>,
}

impl Inner {
	fn insert(&mut self, handle: &Handle) {
		self.records.insert(handle.id(), handle.clone());
		for interface in handle.interfaces() {
			self.by_interface
				.entry(interface.clone())
				.or_default()
				.push(handle.clone());
		}
		self.by_producer
			.entry(handle.producer())
			.or_default()
			.push(handle.clone());
	}

	fn remove(&mut self, handle: &Handle) {
		self.records.remove(&handle.id());
		for interface in handle.interfaces() {
			if let Some(list) = self.by_interface.get_mut(interface) {
				list.retain(|h| h != handle);
				if list.is_empty() {
					self.by_interface.remove(interface);
				}
			}
		}
		if let Some(list) = self.by_producer.get_mut(&handle.producer()) {
			list.retain(|h| h != handle);
			if list.is_empty() {
				self.by_producer.remove(&handle.producer());
			}
		}
	}

	fn usage_count(&self, consumer: ConsumerId, handle: &Handle) -> u64 {
		self.usages
			.get(&consumer)
			.and_then(|entries| entries.iter().find(|e| e.handle == *handle))
			.map_or(0, |e| e.count)
	}
}

/// A dynamic in-process service directory.
///
/// Producers publish services under interface names; consumers look them up,
/// acquire per-consumer instances, and release them. Records may be
/// republished, updated, or unpublished at any time while other parties hold
/// handles; handles to unpublished records turn stale rather than dangling.
pub struct Registry {
	inner: Mutex<Inner>,
	/// Signals in-flight slot release and record invalidation.
	slot_freed: Condvar,
	next_id: AtomicU64,
	hooks: HookIndex,
	dispatcher: Dispatcher,
}

impl Registry {
	pub fn new() -> Self {
		Self::with_config(RegistryConfig::default())
	}

	pub fn with_config(config: RegistryConfig) -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			slot_freed: Condvar::new(),
			next_id: AtomicU64::new(1),
			hooks: HookIndex::new(),
			dispatcher: Dispatcher::new(config.synchronous_delivery),
		}
	}

	// ---- publication ----

	/// Publishes a service under one or more interface names.
	///
	/// The returned handle is already visible to lookups when the
	/// `Published` event fires.
	pub fn publish(
		&self,
		producer: ProducerId,
		interfaces: &[&str],
		properties: Vec<(String, Value)>,
		provider: Provider,
	) -> Result<Handle> {
		self.publish_record(producer, interfaces, properties, provider, None)
	}

	/// Publishes a find hook under the reserved `lattice.hook.find`
	/// interface. The hook is also an ordinary acquirable record.
	pub fn publish_find_hook<H: FindHook + 'static>(
		&self,
		producer: ProducerId,
		hook: Arc<H>,
		properties: Vec<(String, Value)>,
	) -> Result<Handle> {
		let payload = HookPayload::Find(hook.clone());
		self.publish_record(
			producer,
			&[FIND_HOOK],
			properties,
			Provider::Instance(hook),
			Some(payload),
		)
	}

	/// Publishes an event hook under the reserved `lattice.hook.event`
	/// interface.
	pub fn publish_event_hook<H: EventHook + 'static>(
		&self,
		producer: ProducerId,
		hook: Arc<H>,
		properties: Vec<(String, Value)>,
	) -> Result<Handle> {
		let payload = HookPayload::Event(hook.clone());
		self.publish_record(
			producer,
			&[EVENT_HOOK],
			properties,
			Provider::Instance(hook),
			Some(payload),
		)
	}

	/// Publishes an event listener hook under the reserved
	/// `lattice.hook.event-listener` interface.
	pub fn publish_event_listener_hook<H: EventListenerHook + 'static>(
		&self,
		producer: ProducerId,
		hook: Arc<H>,
		properties: Vec<(String, Value)>,
	) -> Result<Handle> {
		let payload = HookPayload::EventListener(hook.clone());
		self.publish_record(
			producer,
			&[EVENT_LISTENER_HOOK],
			properties,
			Provider::Instance(hook),
			Some(payload),
		)
	}

	fn publish_record(
		&self,
		producer: ProducerId,
		interfaces: &[&str],
		properties: Vec<(String, Value)>,
		provider: Provider,
		hook: Option<HookPayload>,
	) -> Result<Handle> {
		if interfaces.is_empty() {
			return Err(RegistryError::InvalidArgument(
				"at least one interface name is required",
			));
		}
		let interfaces: Box<[Box<str>]> = interfaces.iter().map(|name| (*name).into()).collect();
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let props = Properties::build_for_record(properties, id, producer, &interfaces)?;
		let handle = Handle::new(Arc::new(PublicationRecord::new(
			id, interfaces, props, provider, producer, hook,
		)));

		self.hooks.add(&handle);
		{
			let mut inner = self.inner.lock();
			inner.insert(&handle);
		}
		self.fire(EventKind::Published, &handle, handle.properties(), None);
		Ok(handle)
	}

	/// Replaces a record's property snapshot.
	///
	/// Reserved keys are re-injected; the `Modified` event carries both the
	/// old and new snapshots so filtered listeners can detect end-of-match.
	pub fn update(&self, handle: &Handle, properties: Vec<(String, Value)>) -> Result<()> {
		if !handle.is_valid() {
			return Err(RegistryError::StaleHandle(handle.id()));
		}
		let next = Arc::new(Properties::build_for_record(
			properties,
			handle.id(),
			handle.producer(),
			handle.interfaces(),
		)?);
		let old = handle.record().swap_props(next.clone());
		self.hooks.update(handle);
		self.fire(EventKind::Modified, handle, next, Some(&*old));
		Ok(())
	}

	/// Unpublishes a record.
	///
	/// Fires `Unregistering` while the record is still acquirable, then
	/// force-drains every consumer's remaining usage, invalidates the record,
	/// and wakes any thread blocked on its in-flight slot.
	pub fn unpublish(&self, handle: &Handle) -> Result<()> {
		if !handle.record().begin_unregistering() {
			return Err(RegistryError::StaleHandle(handle.id()));
		}
		self.hooks.remove(handle);
		{
			let mut inner = self.inner.lock();
			inner.remove(handle);
		}
		self.fire(EventKind::Unregistering, handle, handle.properties(), None);

		self.drain(handle);
		{
			let _inner = self.inner.lock();
			handle.record().invalidate();
			self.slot_freed.notify_all();
		}
		// Acquisitions that slipped in during the unregistration window get
		// cleaned up by one more pass, now against an invalid record.
		self.drain(handle);
		Ok(())
	}

	/// Unpublishes every record still owned by `producer`.
	pub fn unpublish_all(&self, producer: ProducerId) {
		let owned: Vec<Handle> = {
			let inner = self.inner.lock();
			inner.by_producer.get(&producer).cloned().unwrap_or_default()
		};
		for handle in owned {
			if let Err(err) = self.unpublish(&handle) {
				// Lost a race with a direct unpublish; nothing left to do.
				tracing::debug!(record = handle.id(), "bulk unpublish skipped: {err}");
			}
		}
	}

	/// Releases consumer interest in `handle`, once per unit of its current
	/// usage count. Release-side failures are logged, never propagated.
	fn drain(&self, handle: &Handle) {
		let holders: Vec<(ConsumerId, u64)> = {
			let inner = self.inner.lock();
			inner
				.usages
				.iter()
				.filter_map(|(consumer, entries)| {
					entries
						.iter()
						.find(|e| e.handle == *handle)
						.map(|e| (*consumer, e.count))
				})
				.collect()
		};
		for (consumer, count) in holders {
			for _ in 0..count {
				match self.release(consumer, handle) {
					Ok(true) => {}
					Ok(false) => break,
					Err(err) => {
						tracing::warn!(
							%consumer,
							record = handle.id(),
							"forced release failed: {err}"
						);
						break;
					}
				}
			}
		}
	}

	// ---- lookup / acquisition ----

	/// Finds published records, newest property snapshots considered.
	///
	/// Candidates come from the interface index (all records when
	/// `interface` is `None`), are filtered by the predicate, shrunk by find
	/// hooks, and returned rank-descending with newer records winning ties.
	pub fn lookup(
		&self,
		consumer: ConsumerId,
		interface: Option<&str>,
		filter: Option<&Filter>,
	) -> Vec<Handle> {
		let mut candidates: Vec<Handle> = {
			let inner = self.inner.lock();
			match interface {
				Some(name) => inner.by_interface.get(name).cloned().unwrap_or_default(),
				None => inner.records.values().cloned().collect(),
			}
		};
		candidates
			.retain(|h| h.is_valid() && filter.is_none_or(|f| f.matches(&h.properties())));
		self.hooks.filter_find(consumer, interface, filter, &mut candidates);
		candidates.sort_by_key(|h| (Reverse(h.rank()), Reverse(h.id())));
		candidates
	}

	/// Acquires a per-consumer instance of the service behind `handle`.
	///
	/// At most one instantiation or release per record is in flight at any
	/// time; a second thread waits, and the same thread re-entering through
	/// a factory fails with `ReentrantCycle` instead of deadlocking.
	pub fn acquire(&self, consumer: ConsumerId, handle: &Handle) -> Result<ServiceObj> {
		let id = handle.id();
		let me = thread::current().id();
		let mut inner = self.inner.lock();
		loop {
			if !handle.is_valid() {
				return Err(RegistryError::StaleHandle(id));
			}
			match inner.in_flight.get(&id) {
				Some(owner) if *owner == me => return Err(RegistryError::ReentrantCycle(id)),
				Some(_) => self.slot_freed.wait(&mut inner),
				None => break,
			}
		}
		inner.in_flight.insert(id, me);
		let entries = inner.usages.entry(consumer).or_default();
		let cached = match entries.iter_mut().find(|e| e.handle == *handle) {
			Some(entry) => {
				entry.count += 1;
				entry.instance.clone()
			}
			None => {
				entries.push(UsageEntry {
					handle: handle.clone(),
					instance: None,
					count: 1,
				});
				None
			}
		};
		drop(inner);

		if let Some(instance) = cached {
			self.free_slot(id);
			return Ok(instance);
		}

		// Slot held, lock dropped: we are the only thread instantiating
		// this record, and the factory may call back into the registry.
		let created = handle.record().provider().instantiate(consumer);

		let mut inner = self.inner.lock();
		let still_valid = handle.is_valid();
		if still_valid && created.is_ok() {
			if let (Ok(instance), Some(entry)) = (
				&created,
				inner
					.usages
					.get_mut(&consumer)
					.and_then(|entries| entries.iter_mut().find(|e| e.handle == *handle)),
			) {
				entry.instance = Some(instance.clone());
			}
		} else if let Some(entries) = inner.usages.get_mut(&consumer) {
			if let Some(pos) = entries.iter().position(|e| e.handle == *handle) {
				entries[pos].count -= 1;
				if entries[pos].count == 0 {
					entries.remove(pos);
				}
			}
			if entries.is_empty() {
				inner.usages.remove(&consumer);
			}
		}
		drop(inner);

		let outcome = match created {
			Ok(instance) if still_valid => Ok(instance),
			Ok(instance) => {
				// The record was invalidated while we were instantiating;
				// discard the fresh instance and fail like any other stale
				// operation.
				handle.record().provider().release(consumer, instance);
				Err(RegistryError::StaleHandle(id))
			}
			Err(err) => Err(err),
		};
		self.free_slot(id);
		outcome
	}

	/// Releases one unit of consumer interest in `handle`.
	///
	/// Returns `Ok(false)` when the consumer held no usage. Deliberately
	/// works on stale handles: forced drain depends on it.
	pub fn release(&self, consumer: ConsumerId, handle: &Handle) -> Result<bool> {
		let id = handle.id();
		let me = thread::current().id();
		let mut inner = self.inner.lock();
		loop {
			match inner.in_flight.get(&id) {
				Some(owner) if *owner == me => return Err(RegistryError::ReentrantCycle(id)),
				Some(_) => self.slot_freed.wait(&mut inner),
				None => break,
			}
		}
		if inner.usage_count(consumer, handle) == 0 {
			return Ok(false);
		}
		inner.in_flight.insert(id, me);
		let mut went_zero = false;
		let mut instance = None;
		if let Some(entry) = inner
			.usages
			.get_mut(&consumer)
			.and_then(|entries| entries.iter_mut().find(|e| e.handle == *handle))
		{
			entry.count -= 1;
			if entry.count == 0 {
				// Entry stays in place, count zero, until the factory
				// release returns; the held slot keeps new acquisitions of
				// this record waiting meanwhile.
				went_zero = true;
				instance = entry.instance.take();
			}
		}
		drop(inner);

		if !went_zero {
			self.free_slot(id);
			return Ok(true);
		}
		if let Some(instance) = instance {
			handle.record().provider().release(consumer, instance);
		}

		let mut inner = self.inner.lock();
		if let Some(entries) = inner.usages.get_mut(&consumer) {
			entries.retain(|e| !(e.handle == *handle && e.count == 0));
			if entries.is_empty() {
				inner.usages.remove(&consumer);
			}
		}
		inner.in_flight.remove(&id);
		self.slot_freed.notify_all();
		Ok(true)
	}

	/// Releases every usage a departing consumer still holds.
	pub fn release_all(&self, consumer: ConsumerId) {
		let held: Vec<(Handle, u64)> = {
			let inner = self.inner.lock();
			inner
				.usages
				.get(&consumer)
				.map(|entries| entries.iter().map(|e| (e.handle.clone(), e.count)).collect())
				.unwrap_or_default()
		};
		for (handle, count) in held {
			for _ in 0..count {
				match self.release(consumer, &handle) {
					Ok(true) => {}
					Ok(false) => break,
					Err(err) => {
						tracing::warn!(
							%consumer,
							record = handle.id(),
							"bulk release failed: {err}"
						);
						break;
					}
				}
			}
		}
	}

	// ---- introspection ----

	/// Records still published by `producer`.
	pub fn published_by(&self, producer: ProducerId) -> Vec<Handle> {
		let inner = self.inner.lock();
		inner.by_producer.get(&producer).cloned().unwrap_or_default()
	}

	/// Records `consumer` currently holds at least one usage of.
	pub fn in_use_by(&self, consumer: ConsumerId) -> Vec<Handle> {
		let inner = self.inner.lock();
		inner
			.usages
			.get(&consumer)
			.map(|entries| entries.iter().map(|e| e.handle.clone()).collect())
			.unwrap_or_default()
	}

	/// Consumers currently holding usages of `handle`.
	pub fn consumers_of(&self, handle: &Handle) -> Vec<ConsumerId> {
		let inner = self.inner.lock();
		let mut consumers: Vec<ConsumerId> = inner
			.usages
			.iter()
			.filter(|(_, entries)| entries.iter().any(|e| e.handle == *handle))
			.map(|(consumer, _)| *consumer)
			.collect();
		consumers.sort_unstable();
		consumers
	}

	// ---- listeners ----

	/// Registers a service listener for `consumer`, optionally filtered.
	/// Re-adding the same listener replaces its filter in place.
	pub fn add_listener(
		&self,
		consumer: ConsumerId,
		listener: Arc<dyn ServiceListener>,
		filter: Option<Filter>,
		synchronous: bool,
	) {
		self.dispatcher.add_listener(consumer, listener, filter, synchronous);
	}

	/// Removes one service listener registration; true if it was present.
	pub fn remove_listener(
		&self,
		consumer: ConsumerId,
		listener: &Arc<dyn ServiceListener>,
	) -> bool {
		self.dispatcher.remove_listener(consumer, listener)
	}

	/// Registers a failure listener: it receives reports of `consumer`'s
	/// service listeners panicking during delivery.
	pub fn add_failure_listener(&self, consumer: ConsumerId, listener: Arc<dyn FailureListener>) {
		self.dispatcher.add_failure_listener(consumer, listener);
	}

	pub fn remove_failure_listener(
		&self,
		consumer: ConsumerId,
		listener: &Arc<dyn FailureListener>,
	) -> bool {
		self.dispatcher.remove_failure_listener(consumer, listener)
	}

	/// Drops every listener `consumer` has registered.
	pub fn remove_listeners(&self, consumer: ConsumerId) {
		self.dispatcher.remove_consumer(consumer);
	}

	// ---- internals ----

	fn free_slot(&self, id: u64) {
		let mut inner = self.inner.lock();
		inner.in_flight.remove(&id);
		self.slot_freed.notify_all();
		drop(inner);
	}

	fn fire(
		&self,
		kind: EventKind,
		handle: &Handle,
		props: Arc<Properties>,
		old_props: Option<&Properties>,
	) {
		let event = ServiceEvent {
			kind,
			handle: handle.clone(),
			props,
		};
		self.dispatcher.dispatch(&event, old_props, &self.hooks);
	}
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}
