//! Listener registration and event delivery.
//!
//! Listener sets live in a copy-on-write map keyed by consumer, so event
//! dispatch snapshots the whole set without blocking registration. Plain
//! deliveries go through one long-lived delivery thread in enqueue order;
//! listeners registered as synchronous (and every delivery when the registry
//! itself is configured synchronous) run on the calling thread instead.
//!
//! A listener panic never reaches the caller: it is logged and turned into a
//! failure event for the same consumer's failure listeners. A panic inside a
//! failure listener is only logged.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::filter::Filter;
use crate::hooks::HookIndex;
use crate::identity::ConsumerId;
use crate::props::Properties;
use crate::provider::panic_message;
use crate::record::Handle;

/// What happened to a publication record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
	/// The record became visible.
	Published,
	/// The record's properties changed and still match the listener's filter.
	Modified,
	/// The record's properties changed; the listener's filter matched the
	/// old snapshot but does not match the new one.
	ModifiedEndMatch,
	/// The record is about to be unpublished and is still acquirable.
	Unregistering,
}

/// A service lifecycle event, carrying a handle to the affected record.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
	pub kind: EventKind,
	pub handle: Handle,
	/// The property snapshot this event describes, captured when the event
	/// was raised. For `Modified` this is the post-swap snapshot; listener
	/// filters evaluate against it rather than whatever the record holds by
	/// the time delivery happens.
	pub props: Arc<Properties>,
}

/// A delivery error reported to failure listeners: some service listener
/// panicked while handling `event`.
#[derive(Debug, Clone)]
pub struct FailureEvent {
	/// The consumer whose listener failed.
	pub consumer: ConsumerId,
	/// The event that was being delivered.
	pub event: ServiceEvent,
	/// The panic message, best effort.
	pub message: String,
}

/// Receives service lifecycle events.
pub trait ServiceListener: Send + Sync {
	fn on_event(&self, event: &ServiceEvent);
}

/// Receives reports of service listeners that panicked.
pub trait FailureListener: Send + Sync {
	fn on_failure(&self, failure: &FailureEvent);
}

/// One (consumer, listener) delivery an event is headed for. Event listener
/// hooks shrink lists of these.
#[derive(Clone)]
pub struct ListenerTarget {
	pub consumer: ConsumerId,
	pub(crate) listener: Arc<dyn ServiceListener>,
}

impl PartialEq for ListenerTarget {
	fn eq(&self, other: &Self) -> bool {
		self.consumer == other.consumer && Arc::ptr_eq(&self.listener, &other.listener)
	}
}

#[derive(Clone)]
struct ServiceEntry {
	listener: Arc<dyn ServiceListener>,
	filter: Option<Filter>,
	synchronous: bool,
}

#[derive(Default, Clone)]
struct ListenerMap {
	service: FxHashMap<ConsumerId, Vec<ServiceEntry>>,
	failure: FxHashMap<ConsumerId, Vec<Arc<dyn FailureListener>>>,
}

/// Shared between the dispatcher handle and the delivery thread.
struct DispatchState {
	listeners: ArcSwap<ListenerMap>,
	/// Serializes listener map rebuilds; readers never take it.
	write: Mutex<()>,
}

impl DispatchState {
	fn mutate(&self, edit: impl FnOnce(&mut ListenerMap)) {
		let _guard = self.write.lock();
		let mut next = (**self.listeners.load()).clone();
		edit(&mut next);
		self.listeners.store(Arc::new(next));
	}

	/// Runs one service listener, converting a panic into a failure event.
	fn run_listener(
		&self,
		consumer: ConsumerId,
		listener: &Arc<dyn ServiceListener>,
		event: &ServiceEvent,
	) -> Option<FailureEvent> {
		let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
		let panic = outcome.err()?;
		let message = panic_message(panic.as_ref()).to_owned();
		tracing::error!(%consumer, record = event.handle.id(), "service listener panicked: {message}");
		Some(FailureEvent {
			consumer,
			event: event.clone(),
			message,
		})
	}

	/// Delivers a failure event to the consumer's failure listeners. A panic
	/// here is terminal: logged, never escalated further.
	fn run_failure(&self, failure: &FailureEvent) {
		let map = self.listeners.load_full();
		let Some(listeners) = map.failure.get(&failure.consumer) else {
			return;
		};
		for listener in listeners {
			let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_failure(failure)));
			if let Err(panic) = outcome {
				tracing::error!(
					consumer = %failure.consumer,
					"failure listener panicked: {}",
					panic_message(panic.as_ref())
				);
			}
		}
	}
}

enum Job {
	Service {
		consumer: ConsumerId,
		listener: Arc<dyn ServiceListener>,
		event: ServiceEvent,
	},
	Failure(FailureEvent),
	Shutdown,
}

/// Owns the listener map and the delivery thread.
pub(crate) struct Dispatcher {
	state: Arc<DispatchState>,
	tx: mpsc::Sender<Job>,
	worker: Mutex<Option<thread::JoinHandle<()>>>,
	/// Force every delivery onto the calling thread.
	synchronous_delivery: bool,
}

impl Dispatcher {
	pub(crate) fn new(synchronous_delivery: bool) -> Self {
		let state = Arc::new(DispatchState {
			listeners: ArcSwap::from_pointee(ListenerMap::default()),
			write: Mutex::new(()),
		});
		let (tx, rx) = mpsc::channel::<Job>();
		let worker_state = state.clone();
		let worker = thread::Builder::new()
			.name("registry-dispatch".into())
			.spawn(move || delivery_loop(worker_state, rx))
			.ok();
		if worker.is_none() {
			tracing::error!("failed to spawn delivery thread; async deliveries will be dropped");
		}
		Self {
			state,
			tx,
			worker: Mutex::new(worker),
			synchronous_delivery,
		}
	}

	/// Registers a service listener for `consumer`. Re-adding the same
	/// listener (by identity) replaces its filter in place instead of
	/// duplicating the registration.
	pub(crate) fn add_listener(
		&self,
		consumer: ConsumerId,
		listener: Arc<dyn ServiceListener>,
		filter: Option<Filter>,
		synchronous: bool,
	) {
		self.state.mutate(|map| {
			let entries = map.service.entry(consumer).or_default();
			if let Some(existing) = entries
				.iter_mut()
				.find(|e| Arc::ptr_eq(&e.listener, &listener))
			{
				existing.filter = filter;
				existing.synchronous = synchronous;
			} else {
				entries.push(ServiceEntry {
					listener,
					filter,
					synchronous,
				});
			}
		});
	}

	/// Removes one service listener registration; true if it was present.
	pub(crate) fn remove_listener(
		&self,
		consumer: ConsumerId,
		listener: &Arc<dyn ServiceListener>,
	) -> bool {
		let mut removed = false;
		self.state.mutate(|map| {
			if let Some(entries) = map.service.get_mut(&consumer) {
				let before = entries.len();
				entries.retain(|e| !Arc::ptr_eq(&e.listener, listener));
				removed = entries.len() != before;
				if entries.is_empty() {
					map.service.remove(&consumer);
				}
			}
		});
		removed
	}

	pub(crate) fn add_failure_listener(
		&self,
		consumer: ConsumerId,
		listener: Arc<dyn FailureListener>,
	) {
		self.state.mutate(|map| {
			map.failure.entry(consumer).or_default().push(listener);
		});
	}

	pub(crate) fn remove_failure_listener(
		&self,
		consumer: ConsumerId,
		listener: &Arc<dyn FailureListener>,
	) -> bool {
		let mut removed = false;
		self.state.mutate(|map| {
			if let Some(entries) = map.failure.get_mut(&consumer) {
				let before = entries.len();
				entries.retain(|e| !Arc::ptr_eq(e, listener));
				removed = entries.len() != before;
				if entries.is_empty() {
					map.failure.remove(&consumer);
				}
			}
		});
		removed
	}

	/// Drops every listener registered by `consumer`.
	pub(crate) fn remove_consumer(&self, consumer: ConsumerId) {
		self.state.mutate(|map| {
			map.service.remove(&consumer);
			map.failure.remove(&consumer);
		});
	}

	/// Delivers `event` to every matching listener, after hook filtering.
	///
	/// `old_props` is the pre-update snapshot and is only present for
	/// `Modified` events; it decides, per listener, whether a filter that no
	/// longer matches still gets a final end-match notification.
	pub(crate) fn dispatch(
		&self,
		event: &ServiceEvent,
		old_props: Option<&Properties>,
		hooks: &HookIndex,
	) {
		let map = self.state.listeners.load_full();
		if map.service.is_empty() {
			return;
		}

		let mut consumers: Vec<ConsumerId> = map.service.keys().copied().collect();
		consumers.sort_unstable();
		hooks.filter_event_consumers(event, &mut consumers);

		let mut targets = Vec::new();
		for consumer in consumers {
			let Some(entries) = map.service.get(&consumer) else {
				continue;
			};
			for entry in entries {
				targets.push(ListenerTarget {
					consumer,
					listener: entry.listener.clone(),
				});
			}
		}
		hooks.filter_listener_targets(event, &mut targets);

		for target in targets {
			let Some(entry) = map
				.service
				.get(&target.consumer)
				.and_then(|entries| {
					entries
						.iter()
						.find(|e| Arc::ptr_eq(&e.listener, &target.listener))
				})
			else {
				continue;
			};
			let kind =
				match resolve_kind(event.kind, entry.filter.as_ref(), &event.props, old_props) {
					Some(kind) => kind,
					None => continue,
				};
			let event = ServiceEvent {
				kind,
				handle: event.handle.clone(),
				props: event.props.clone(),
			};
			if self.synchronous_delivery || entry.synchronous {
				if let Some(failure) =
					self.state
						.run_listener(target.consumer, &target.listener, &event)
				{
					if self.synchronous_delivery {
						// Fully synchronous mode keeps second-order events
						// on the calling thread too.
						self.state.run_failure(&failure);
					} else {
						// Failures still flow through the delivery thread so
						// they land after any deliveries already queued.
						let _ = self.tx.send(Job::Failure(failure));
					}
				}
			} else {
				let _ = self.tx.send(Job::Service {
					consumer: target.consumer,
					listener: target.listener,
					event,
				});
			}
		}
	}
}

impl Drop for Dispatcher {
	fn drop(&mut self) {
		let _ = self.tx.send(Job::Shutdown);
		if let Some(worker) = self.worker.lock().take() {
			let _ = worker.join();
		}
	}
}

/// Per-listener event refinement: apply the listener's filter to the new
/// property snapshot, falling back to an end-match delivery when a modified
/// record stops matching.
fn resolve_kind(
	kind: EventKind,
	filter: Option<&Filter>,
	new_props: &Properties,
	old_props: Option<&Properties>,
) -> Option<EventKind> {
	let Some(filter) = filter else {
		return Some(kind);
	};
	let matches_new = filter.matches(new_props);
	match kind {
		EventKind::Modified => {
			if matches_new {
				Some(EventKind::Modified)
			} else if old_props.is_some_and(|old| filter.matches(old)) {
				Some(EventKind::ModifiedEndMatch)
			} else {
				None
			}
		}
		_ => matches_new.then_some(kind),
	}
}

fn delivery_loop(state: Arc<DispatchState>, rx: mpsc::Receiver<Job>) {
	while let Ok(job) = rx.recv() {
		match job {
			Job::Service {
				consumer,
				listener,
				event,
			} => {
				if let Some(failure) = state.run_listener(consumer, &listener, &event) {
					state.run_failure(&failure);
				}
			}
			Job::Failure(failure) => state.run_failure(&failure),
			Job::Shutdown => break,
		}
	}
	tracing::debug!("delivery thread exiting");
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::sync::atomic::{AtomicUsize, Ordering};

	use crate::identity::ProducerId;
	use crate::props::Properties;
	use crate::provider::Provider;
	use crate::record::PublicationRecord;

	struct Counter(AtomicUsize);

	impl ServiceListener for Counter {
		fn on_event(&self, _event: &ServiceEvent) {
			self.0.fetch_add(1, Ordering::SeqCst);
		}
	}

	fn handle_with_props(pairs: Vec<(&str, crate::props::Value)>) -> Handle {
		let props =
			Properties::build_for_record(pairs, 1, ProducerId(1), &["svc".into()]).unwrap();
		Handle::new(Arc::new(PublicationRecord::new(
			1,
			vec!["svc".into()].into_boxed_slice(),
			props,
			Provider::instance(()),
			ProducerId(1),
			None,
		)))
	}

	#[test]
	fn end_match_requires_old_snapshot_match() {
		let handle = handle_with_props(vec![("color", "blue".into())]);
		let filter = Filter::parse("(color=red)").unwrap();
		let old_matching = Properties::build(vec![("color".to_owned(), "red".into())]).unwrap();
		let old_other = Properties::build(vec![("color".to_owned(), "green".into())]).unwrap();

		let new_props = handle.properties();
		assert_eq!(
			resolve_kind(
				EventKind::Modified,
				Some(&filter),
				&new_props,
				Some(&old_matching)
			),
			Some(EventKind::ModifiedEndMatch)
		);
		assert_eq!(
			resolve_kind(EventKind::Modified, Some(&filter), &new_props, Some(&old_other)),
			None
		);
	}

	#[test]
	fn filtered_listener_skips_non_matching_publish() {
		let handle = handle_with_props(vec![("color", "blue".into())]);
		let filter = Filter::parse("(color=red)").unwrap();
		let new_props = handle.properties();
		assert_eq!(
			resolve_kind(EventKind::Published, Some(&filter), &new_props, None),
			None
		);
		assert_eq!(
			resolve_kind(EventKind::Published, None, &new_props, None),
			Some(EventKind::Published)
		);
	}

	#[test]
	fn re_adding_listener_updates_filter_in_place() {
		let dispatcher = Dispatcher::new(true);
		let consumer = ConsumerId(7);
		let listener: Arc<dyn ServiceListener> = Arc::new(Counter(AtomicUsize::new(0)));
		dispatcher.add_listener(consumer, listener.clone(), None, true);
		dispatcher.add_listener(
			consumer,
			listener.clone(),
			Some(Filter::parse("(color=red)").unwrap()),
			true,
		);

		let map = dispatcher.state.listeners.load_full();
		let entries = &map.service[&consumer];
		assert_eq!(entries.len(), 1);
		assert!(entries[0].filter.is_some());

		assert!(dispatcher.remove_listener(consumer, &listener));
		assert!(!dispatcher.remove_listener(consumer, &listener));
	}
}
