//! Cross-thread behavior: slot exclusivity, re-entrancy detection, forced
//! drain under contention, and delivery ordering.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use lattice_registry::{
	BoxError, ConsumerId, EventKind, FailureEvent, FailureListener, Filter, FindHook, Handle,
	ProducerId, Provider, Registry, RegistryConfig, RegistryError, ServiceEvent, ServiceFactory,
	ServiceListener, ServiceObj, Shrinkable, Value,
};

const PRODUCER: ProducerId = ProducerId(1);

fn wait_until(mut done: impl FnMut() -> bool) {
	let deadline = Instant::now() + Duration::from_secs(5);
	while !done() {
		assert!(Instant::now() < deadline, "timed out waiting for condition");
		thread::sleep(Duration::from_millis(2));
	}
}

/// Fails if two create or release calls ever overlap.
struct ExclusiveFactory {
	busy: AtomicBool,
	creations: AtomicUsize,
}

impl ExclusiveFactory {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			busy: AtomicBool::new(false),
			creations: AtomicUsize::new(0),
		})
	}

	fn enter(&self) {
		assert!(
			!self.busy.swap(true, Ordering::SeqCst),
			"factory entered concurrently"
		);
		thread::sleep(Duration::from_millis(10));
		self.busy.store(false, Ordering::SeqCst);
	}
}

impl ServiceFactory for ExclusiveFactory {
	fn create(&self, consumer: ConsumerId) -> Result<ServiceObj, BoxError> {
		self.enter();
		self.creations.fetch_add(1, Ordering::SeqCst);
		Ok(Arc::new(consumer.0))
	}

	fn release(&self, _consumer: ConsumerId, _instance: ServiceObj) {
		self.enter();
	}
}

#[test]
fn at_most_one_instantiation_in_flight_per_record() {
	let reg = Arc::new(Registry::new());
	let factory = ExclusiveFactory::new();
	let handle = reg
		.publish(PRODUCER, &["svc"], Vec::new(), Provider::Factory(factory.clone()))
		.unwrap();

	let barrier = Arc::new(Barrier::new(4));
	let workers: Vec<_> = (0..4)
		.map(|n| {
			let reg = reg.clone();
			let handle = handle.clone();
			let barrier = barrier.clone();
			thread::spawn(move || {
				let consumer = ConsumerId(n);
				barrier.wait();
				for _ in 0..5 {
					reg.acquire(consumer, &handle).unwrap();
				}
				for _ in 0..5 {
					assert!(reg.release(consumer, &handle).unwrap());
				}
				assert!(!reg.release(consumer, &handle).unwrap());
			})
		})
		.collect();
	for worker in workers {
		worker.join().unwrap();
	}

	// One instantiation per consumer, every usage gone.
	assert_eq!(factory.creations.load(Ordering::SeqCst), 4);
	for n in 0..4 {
		assert!(reg.in_use_by(ConsumerId(n)).is_empty());
	}
}

#[test]
fn concurrent_acquires_for_one_consumer_share_a_single_instantiation() {
	let reg = Arc::new(Registry::new());
	let factory = ExclusiveFactory::new();
	let handle = reg
		.publish(PRODUCER, &["svc"], Vec::new(), Provider::Factory(factory.clone()))
		.unwrap();

	let consumer = ConsumerId(1);
	let barrier = Arc::new(Barrier::new(2));
	let workers: Vec<_> = (0..2)
		.map(|_| {
			let reg = reg.clone();
			let handle = handle.clone();
			let barrier = barrier.clone();
			thread::spawn(move || {
				barrier.wait();
				reg.acquire(consumer, &handle).unwrap()
			})
		})
		.collect();
	let instances: Vec<_> = workers
		.into_iter()
		.map(|worker| worker.join().unwrap())
		.collect();

	// The loser of the slot race must see the winner's cached instance, not
	// a second factory call.
	assert_eq!(factory.creations.load(Ordering::SeqCst), 1);
	assert!(Arc::ptr_eq(&instances[0], &instances[1]));
}

struct ReentrantFactory {
	reg: Mutex<Option<Arc<Registry>>>,
	handle: Mutex<Option<Handle>>,
}

impl ServiceFactory for ReentrantFactory {
	fn create(&self, consumer: ConsumerId) -> Result<ServiceObj, BoxError> {
		let reg = self.reg.lock().clone().ok_or("registry unset")?;
		let handle = self.handle.lock().clone().ok_or("handle unset")?;
		// Calling back into the record being instantiated must fail fast.
		match reg.acquire(consumer, &handle) {
			Err(RegistryError::ReentrantCycle(_)) => Ok(Arc::new("cycle detected".to_owned())),
			Ok(_) => Err("re-entrant acquire unexpectedly succeeded".into()),
			Err(other) => Err(format!("unexpected error: {other}").into()),
		}
	}

	fn release(&self, _consumer: ConsumerId, _instance: ServiceObj) {}
}

#[test]
fn reentrant_factory_cycle_fails_instead_of_deadlocking() {
	let reg = Arc::new(Registry::new());
	let factory = Arc::new(ReentrantFactory {
		reg: Mutex::new(None),
		handle: Mutex::new(None),
	});
	let handle = reg
		.publish(PRODUCER, &["svc"], Vec::new(), Provider::Factory(factory.clone()))
		.unwrap();
	*factory.reg.lock() = Some(reg.clone());
	*factory.handle.lock() = Some(handle.clone());

	let instance = reg.acquire(ConsumerId(1), &handle).unwrap();
	let message = instance.downcast_ref::<String>().unwrap();
	assert_eq!(message, "cycle detected");
}

/// Blocks create until the gate channel opens (or closes).
struct Gate {
	gate: Mutex<mpsc::Receiver<()>>,
}

impl ServiceFactory for Gate {
	fn create(&self, consumer: ConsumerId) -> Result<ServiceObj, BoxError> {
		let _ = self.gate.lock().recv();
		Ok(Arc::new(consumer.0))
	}

	fn release(&self, _consumer: ConsumerId, _instance: ServiceObj) {}
}

#[test]
fn unpublish_during_contention_stays_live() {
	let reg = Arc::new(Registry::new());
	let (open, gate) = mpsc::channel();
	let handle = reg
		.publish(
			PRODUCER,
			&["svc"],
			Vec::new(),
			Provider::factory(Gate {
				gate: Mutex::new(gate),
			}),
		)
		.unwrap();

	let first = {
		let reg = reg.clone();
		let handle = handle.clone();
		thread::spawn(move || reg.acquire(ConsumerId(1), &handle))
	};
	// Give the first acquire time to claim the slot and block in create.
	thread::sleep(Duration::from_millis(20));

	let second = {
		let reg = reg.clone();
		let handle = handle.clone();
		thread::spawn(move || reg.acquire(ConsumerId(2), &handle))
	};
	let unpublisher = {
		let reg = reg.clone();
		let handle = handle.clone();
		thread::spawn(move || reg.unpublish(&handle))
	};
	thread::sleep(Duration::from_millis(20));
	open.send(()).unwrap();
	drop(open);

	first.join().unwrap().unwrap();
	// The blocked acquire either slipped into the unregistration window or
	// woke to a stale record; both are fine, deadlock is not.
	match second.join().unwrap() {
		Ok(_) => {}
		Err(RegistryError::StaleHandle(_)) => {}
		Err(other) => panic!("unexpected error: {other}"),
	}
	unpublisher.join().unwrap().unwrap();

	assert!(!handle.is_valid());
	assert!(reg.in_use_by(ConsumerId(1)).is_empty());
	assert!(reg.in_use_by(ConsumerId(2)).is_empty());
}

#[derive(Default)]
struct Recorder {
	events: Mutex<Vec<(EventKind, u64)>>,
}

impl ServiceListener for Recorder {
	fn on_event(&self, event: &ServiceEvent) {
		self.events.lock().push((event.kind, event.handle.id()));
	}
}

#[test]
fn async_delivery_preserves_enqueue_order() {
	let reg = Registry::new();
	let recorder = Arc::new(Recorder::default());
	reg.add_listener(ConsumerId(1), recorder.clone(), None, false);

	let a = reg
		.publish(PRODUCER, &["svc"], Vec::new(), Provider::instance(1i64))
		.unwrap();
	let b = reg
		.publish(PRODUCER, &["svc"], Vec::new(), Provider::instance(2i64))
		.unwrap();
	reg.update(&a, vec![("color".to_owned(), "red".into())]).unwrap();
	reg.unpublish(&b).unwrap();

	wait_until(|| recorder.events.lock().len() == 4);
	assert_eq!(
		*recorder.events.lock(),
		vec![
			(EventKind::Published, a.id()),
			(EventKind::Published, b.id()),
			(EventKind::Modified, a.id()),
			(EventKind::Unregistering, b.id()),
		]
	);
}

#[test]
fn modified_end_match_fires_exactly_once() {
	let reg = Registry::with_config(RegistryConfig {
		synchronous_delivery: true,
	});
	let recorder = Arc::new(Recorder::default());
	reg.add_listener(
		ConsumerId(1),
		recorder.clone(),
		Some(Filter::parse("(color=red)").unwrap()),
		true,
	);

	let handle = reg
		.publish(
			PRODUCER,
			&["svc"],
			vec![("color".to_owned(), "red".into())],
			Provider::instance(1i64),
		)
		.unwrap();
	reg.update(&handle, vec![("color".to_owned(), "blue".into())]).unwrap();
	// Already out of match: no further events for this listener.
	reg.update(&handle, vec![("color".to_owned(), "green".into())]).unwrap();
	reg.update(&handle, vec![("color".to_owned(), "red".into())]).unwrap();

	assert_eq!(
		*recorder.events.lock(),
		vec![
			(EventKind::Published, handle.id()),
			(EventKind::ModifiedEndMatch, handle.id()),
			(EventKind::Modified, handle.id()),
		]
	);
}

struct HideMarked;

impl FindHook for HideMarked {
	fn filter_matches(
		&self,
		_consumer: ConsumerId,
		_interface: Option<&str>,
		_filter: Option<&Filter>,
		candidates: &mut Shrinkable<'_, Handle>,
	) {
		candidates.retain(|h| h.properties().get("hidden") != Some(&Value::Bool(true)));
	}
}

struct PanickyFind;

impl FindHook for PanickyFind {
	fn filter_matches(
		&self,
		_consumer: ConsumerId,
		_interface: Option<&str>,
		_filter: Option<&Filter>,
		_candidates: &mut Shrinkable<'_, Handle>,
	) {
		panic!("hook bug");
	}
}

#[test]
fn find_hooks_shrink_results_and_survive_panicking_peers() {
	let reg = Registry::with_config(RegistryConfig {
		synchronous_delivery: true,
	});
	// The panicking hook ranks higher, so it runs first and gets skipped.
	reg.publish_find_hook(
		PRODUCER,
		Arc::new(PanickyFind),
		vec![("service.rank".to_owned(), 10.into())],
	)
	.unwrap();
	reg.publish_find_hook(PRODUCER, Arc::new(HideMarked), Vec::new())
		.unwrap();

	let visible = reg
		.publish(PRODUCER, &["svc"], Vec::new(), Provider::instance(1i64))
		.unwrap();
	reg.publish(
		PRODUCER,
		&["svc"],
		vec![("hidden".to_owned(), true.into())],
		Provider::instance(2i64),
	)
	.unwrap();

	assert_eq!(reg.lookup(ConsumerId(1), Some("svc"), None), vec![visible]);
}

struct MuteConsumer(ConsumerId);

impl lattice_registry::EventHook for MuteConsumer {
	fn filter_consumers(
		&self,
		_event: &ServiceEvent,
		consumers: &mut Shrinkable<'_, ConsumerId>,
	) {
		consumers.retain(|c| *c != self.0);
	}
}

struct MuteTarget(ConsumerId);

impl lattice_registry::EventListenerHook for MuteTarget {
	fn filter_targets(
		&self,
		_event: &ServiceEvent,
		targets: &mut Shrinkable<'_, lattice_registry::ListenerTarget>,
	) {
		targets.retain(|t| t.consumer != self.0);
	}
}

#[test]
fn event_hooks_mute_whole_consumers() {
	let reg = Registry::with_config(RegistryConfig {
		synchronous_delivery: true,
	});
	reg.publish_event_hook(PRODUCER, Arc::new(MuteConsumer(ConsumerId(2))), Vec::new())
		.unwrap();
	let heard = Arc::new(Recorder::default());
	let muted = Arc::new(Recorder::default());
	reg.add_listener(ConsumerId(1), heard.clone(), None, true);
	reg.add_listener(ConsumerId(2), muted.clone(), None, true);

	let handle = reg
		.publish(PRODUCER, &["svc"], Vec::new(), Provider::instance(1i64))
		.unwrap();

	assert_eq!(
		*heard.events.lock(),
		vec![(EventKind::Published, handle.id())]
	);
	assert!(muted.events.lock().is_empty());
}

#[test]
fn event_listener_hooks_mute_individual_targets() {
	let reg = Registry::with_config(RegistryConfig {
		synchronous_delivery: true,
	});
	reg.publish_event_listener_hook(PRODUCER, Arc::new(MuteTarget(ConsumerId(2))), Vec::new())
		.unwrap();
	let heard = Arc::new(Recorder::default());
	let muted = Arc::new(Recorder::default());
	reg.add_listener(ConsumerId(1), heard.clone(), None, true);
	reg.add_listener(ConsumerId(2), muted.clone(), None, true);

	reg.publish(PRODUCER, &["svc"], Vec::new(), Provider::instance(1i64))
		.unwrap();

	assert_eq!(heard.events.lock().len(), 1);
	assert!(muted.events.lock().is_empty());
}

#[derive(Default)]
struct FailureRecorder {
	failures: Mutex<Vec<FailureEvent>>,
}

impl FailureListener for FailureRecorder {
	fn on_failure(&self, failure: &FailureEvent) {
		self.failures.lock().push(failure.clone());
	}
}

struct PanickyListener;

impl ServiceListener for PanickyListener {
	fn on_event(&self, _event: &ServiceEvent) {
		panic!("listener bug");
	}
}

#[test]
fn listener_panic_becomes_a_failure_event() {
	let reg = Registry::new();
	let consumer = ConsumerId(1);
	let failures = Arc::new(FailureRecorder::default());
	reg.add_listener(consumer, Arc::new(PanickyListener), None, false);
	reg.add_failure_listener(consumer, failures.clone());

	let handle = reg
		.publish(PRODUCER, &["svc"], Vec::new(), Provider::instance(1i64))
		.unwrap();

	wait_until(|| !failures.failures.lock().is_empty());
	let seen = failures.failures.lock();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].consumer, consumer);
	assert_eq!(seen[0].event.handle.id(), handle.id());
	assert!(seen[0].message.contains("listener bug"));
}

#[test]
fn synchronous_mode_delivers_failures_before_the_operation_returns() {
	let reg = Registry::with_config(RegistryConfig {
		synchronous_delivery: true,
	});
	let consumer = ConsumerId(1);
	let failures = Arc::new(FailureRecorder::default());
	reg.add_listener(consumer, Arc::new(PanickyListener), None, true);
	reg.add_failure_listener(consumer, failures.clone());

	let handle = reg
		.publish(PRODUCER, &["svc"], Vec::new(), Provider::instance(1i64))
		.unwrap();

	// No waiting: the second-order event ran on this thread during publish.
	let seen = failures.failures.lock();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].event.handle.id(), handle.id());
}
