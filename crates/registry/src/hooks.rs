//! Ranked hook index.
//!
//! Hooks are trusted extensions, themselves published as records under
//! reserved interface names, that can mask visibility of services and
//! listeners. Each hook kind keeps its registrations in rank order
//! (descending, ties broken by ascending record id) inside a copy-on-write
//! snapshot, so dispatch reads are lock-free. Hooks can shrink the views
//! they are handed but can never add to them; the view type enforces this,
//! not hook discipline.

use std::cmp::Reverse;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::dispatch::{ListenerTarget, ServiceEvent};
use crate::filter::Filter;
use crate::identity::ConsumerId;
use crate::provider::panic_message;
use crate::record::Handle;

/// Interface name reserved for find hooks.
pub const FIND_HOOK: &str = "lattice.hook.find";
/// Interface name reserved for event hooks.
pub const EVENT_HOOK: &str = "lattice.hook.event";
/// Interface name reserved for event listener hooks.
pub const EVENT_LISTENER_HOOK: &str = "lattice.hook.event-listener";

/// A shrinkable view over a candidate list.
///
/// Hooks may remove entries; there is no way to insert through this type.
pub struct Shrinkable<'a, T> {
	items: &'a mut Vec<T>,
}

impl<'a, T> Shrinkable<'a, T> {
	pub(crate) fn new(items: &'a mut Vec<T>) -> Self {
		Self { items }
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub fn iter(&self) -> std::slice::Iter<'_, T> {
		self.items.iter()
	}

	pub fn get(&self, index: usize) -> Option<&T> {
		self.items.get(index)
	}

	/// Keeps only the entries the predicate accepts.
	pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
		self.items.retain(keep);
	}

	/// Removes the entry at `index`, preserving order of the rest.
	pub fn remove(&mut self, index: usize) -> T {
		self.items.remove(index)
	}
}

impl<T: PartialEq> Shrinkable<'_, T> {
	/// Removes the first entry equal to `item`; true if one was found.
	pub fn remove_item(&mut self, item: &T) -> bool {
		match self.items.iter().position(|candidate| candidate == item) {
			Some(at) => {
				self.items.remove(at);
				true
			}
			None => false,
		}
	}
}

/// Masks lookup results before they reach the calling consumer.
pub trait FindHook: Send + Sync {
	fn filter_matches(
		&self,
		consumer: ConsumerId,
		interface: Option<&str>,
		filter: Option<&Filter>,
		candidates: &mut Shrinkable<'_, Handle>,
	);
}

/// Masks which consumers observe a service event at all.
pub trait EventHook: Send + Sync {
	fn filter_consumers(&self, event: &ServiceEvent, consumers: &mut Shrinkable<'_, ConsumerId>);
}

/// Masks individual listener deliveries for a service event.
pub trait EventListenerHook: Send + Sync {
	fn filter_targets(&self, event: &ServiceEvent, targets: &mut Shrinkable<'_, ListenerTarget>);
}

/// Typed hook capability carried by a hook record.
#[derive(Clone)]
pub enum HookPayload {
	Find(Arc<dyn FindHook>),
	Event(Arc<dyn EventHook>),
	EventListener(Arc<dyn EventListenerHook>),
}

impl HookPayload {
	/// The reserved interface name this payload is advertised under.
	pub fn interface(&self) -> &'static str {
		match self {
			HookPayload::Find(_) => FIND_HOOK,
			HookPayload::Event(_) => EVENT_HOOK,
			HookPayload::EventListener(_) => EVENT_LISTENER_HOOK,
		}
	}
}

struct HookEntry<H: ?Sized> {
	handle: Handle,
	hook: Arc<H>,
}

impl<H: ?Sized> Clone for HookEntry<H> {
	fn clone(&self) -> Self {
		Self {
			handle: self.handle.clone(),
			hook: self.hook.clone(),
		}
	}
}

#[derive(Default, Clone)]
struct HookSnapshot {
	find: Vec<HookEntry<dyn FindHook>>,
	event: Vec<HookEntry<dyn EventHook>>,
	event_listener: Vec<HookEntry<dyn EventListenerHook>>,
}

impl HookSnapshot {
	fn sort(&mut self) {
		// Rank descending, record id ascending on ties.
		self.find
			.sort_by_key(|e| (Reverse(e.handle.rank()), e.handle.id()));
		self.event
			.sort_by_key(|e| (Reverse(e.handle.rank()), e.handle.id()));
		self.event_listener
			.sort_by_key(|e| (Reverse(e.handle.rank()), e.handle.id()));
	}

	fn remove(&mut self, id: u64) {
		self.find.retain(|e| e.handle.id() != id);
		self.event.retain(|e| e.handle.id() != id);
		self.event_listener.retain(|e| e.handle.id() != id);
	}
}

/// Copy-on-write index of hook registrations, one ranked set per kind.
pub(crate) struct HookIndex {
	snap: ArcSwap<HookSnapshot>,
	/// Serializes snapshot rebuilds; readers never take it.
	write: Mutex<()>,
}

impl HookIndex {
	pub(crate) fn new() -> Self {
		Self {
			snap: ArcSwap::from_pointee(HookSnapshot::default()),
			write: Mutex::new(()),
		}
	}

	/// Registers hook interest for a freshly published record, if it
	/// carries a hook payload.
	pub(crate) fn add(&self, handle: &Handle) {
		let Some(payload) = handle.record().hook() else {
			return;
		};
		let _guard = self.write.lock();
		let mut next = (**self.snap.load()).clone();
		match payload {
			HookPayload::Find(hook) => next.find.push(HookEntry {
				handle: handle.clone(),
				hook: hook.clone(),
			}),
			HookPayload::Event(hook) => next.event.push(HookEntry {
				handle: handle.clone(),
				hook: hook.clone(),
			}),
			HookPayload::EventListener(hook) => next.event_listener.push(HookEntry {
				handle: handle.clone(),
				hook: hook.clone(),
			}),
		}
		next.sort();
		self.snap.store(Arc::new(next));
	}

	/// Re-evaluates ordering after a property update (the rank may have
	/// changed).
	pub(crate) fn update(&self, handle: &Handle) {
		if handle.record().hook().is_none() {
			return;
		}
		let _guard = self.write.lock();
		let mut next = (**self.snap.load()).clone();
		next.sort();
		self.snap.store(Arc::new(next));
	}

	/// Drops all hook interest for a record about to be unpublished.
	pub(crate) fn remove(&self, handle: &Handle) {
		if handle.record().hook().is_none() {
			return;
		}
		let _guard = self.write.lock();
		let mut next = (**self.snap.load()).clone();
		next.remove(handle.id());
		self.snap.store(Arc::new(next));
	}

	/// Runs find hooks over lookup candidates, in rank order. A panicking
	/// hook is logged and skipped; the rest still run.
	pub(crate) fn filter_find(
		&self,
		consumer: ConsumerId,
		interface: Option<&str>,
		filter: Option<&Filter>,
		candidates: &mut Vec<Handle>,
	) {
		let snap = self.snap.load_full();
		for entry in &snap.find {
			let mut view = Shrinkable::new(candidates);
			let outcome = catch_unwind(AssertUnwindSafe(|| {
				entry.hook.filter_matches(consumer, interface, filter, &mut view);
			}));
			if let Err(panic) = outcome {
				tracing::warn!(
					hook = entry.handle.id(),
					"find hook panicked: {}",
					panic_message(panic.as_ref())
				);
			}
		}
	}

	/// Runs event hooks over the consumer whitelist for an event.
	pub(crate) fn filter_event_consumers(
		&self,
		event: &ServiceEvent,
		consumers: &mut Vec<ConsumerId>,
	) {
		let snap = self.snap.load_full();
		for entry in &snap.event {
			let mut view = Shrinkable::new(consumers);
			let outcome = catch_unwind(AssertUnwindSafe(|| {
				entry.hook.filter_consumers(event, &mut view);
			}));
			if let Err(panic) = outcome {
				tracing::warn!(
					hook = entry.handle.id(),
					"event hook panicked: {}",
					panic_message(panic.as_ref())
				);
			}
		}
	}

	/// Runs event listener hooks over the per-listener target list.
	pub(crate) fn filter_listener_targets(
		&self,
		event: &ServiceEvent,
		targets: &mut Vec<ListenerTarget>,
	) {
		let snap = self.snap.load_full();
		for entry in &snap.event_listener {
			let mut view = Shrinkable::new(targets);
			let outcome = catch_unwind(AssertUnwindSafe(|| {
				entry.hook.filter_targets(event, &mut view);
			}));
			if let Err(panic) = outcome {
				tracing::warn!(
					hook = entry.handle.id(),
					"event listener hook panicked: {}",
					panic_message(panic.as_ref())
				);
			}
		}
	}
}
