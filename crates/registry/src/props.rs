//! Service property snapshots.
//!
//! A [`Properties`] value is an immutable, case-insensitive map built once at
//! publish or update time. Concurrent readers always hold a whole snapshot;
//! updates swap in a fresh snapshot rather than mutating in place.

use rustc_hash::FxHashMap;

use crate::error::{RegistryError, Result};
use crate::identity::ProducerId;

/// Property key the registry fills with the record's numeric id.
pub const SERVICE_ID: &str = "service.id";
/// Property key the registry fills with the owning producer's id.
pub const SERVICE_PRODUCER: &str = "service.producer";
/// Property key the registry fills with the advertised interface names.
pub const INTERFACES: &str = "interfaces";
/// Numeric property ordering lookup results; missing or non-integer
/// values count as zero.
pub const SERVICE_RANK: &str = "service.rank";

/// A service property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Str(Box<str>),
	Int(i64),
	Float(f64),
	Bool(bool),
	/// A multi-valued property; a predicate matches a list when it matches
	/// any element.
	List(Vec<Value>),
}

impl From<&str> for Value {
	fn from(s: &str) -> Self {
		Value::Str(s.into())
	}
}

impl From<String> for Value {
	fn from(s: String) -> Self {
		Value::Str(s.into())
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Value::Int(v)
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Value::Float(v)
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Value::Bool(v)
	}
}

#[derive(Debug, Clone)]
struct Entry {
	/// Key as supplied by the caller; lookup goes through the lowercased
	/// map key instead.
	key: Box<str>,
	value: Value,
}

/// Immutable case-insensitive property map.
#[derive(Debug, Clone, Default)]
pub struct Properties {
	entries: FxHashMap<Box<str>, Entry>,
}

impl Properties {
	/// Builds a snapshot from caller-supplied pairs.
	///
	/// Keys colliding case-insensitively are rejected with
	/// [`RegistryError::DuplicateProperty`].
	pub fn build<I, K>(pairs: I) -> Result<Self>
	where
		I: IntoIterator<Item = (K, Value)>,
		K: Into<String>,
	{
		let mut entries = FxHashMap::default();
		for (key, value) in pairs {
			let key: String = key.into();
			let folded: Box<str> = key.to_lowercase().into();
			if entries.contains_key(&folded) {
				return Err(RegistryError::DuplicateProperty { key });
			}
			entries.insert(
				folded,
				Entry {
					key: key.into(),
					value,
				},
			);
		}
		Ok(Self { entries })
	}

	/// Builds the snapshot for a record, overriding the reserved keys the
	/// registry owns. Caller-supplied values for reserved keys are replaced,
	/// not rejected.
	pub(crate) fn build_for_record<I, K>(
		pairs: I,
		id: u64,
		producer: ProducerId,
		interfaces: &[Box<str>],
	) -> Result<Self>
	where
		I: IntoIterator<Item = (K, Value)>,
		K: Into<String>,
	{
		let mut props = Self::build(pairs)?;
		props.put(SERVICE_ID, Value::Int(id as i64));
		props.put(SERVICE_PRODUCER, Value::Int(producer.0 as i64));
		props.put(
			INTERFACES,
			Value::List(
				interfaces
					.iter()
					.map(|name| Value::Str(name.clone()))
					.collect(),
			),
		);
		Ok(props)
	}

	fn put(&mut self, key: &str, value: Value) {
		self.entries.insert(
			key.to_lowercase().into(),
			Entry {
				key: key.into(),
				value,
			},
		);
	}

	/// Case-insensitive lookup.
	pub fn get(&self, key: &str) -> Option<&Value> {
		if let Some(entry) = self.entries.get(key) {
			return Some(&entry.value);
		}
		self.entries
			.get(key.to_lowercase().as_str())
			.map(|entry| &entry.value)
	}

	/// Keys in their original case. Iteration order is unspecified.
	pub fn keys(&self) -> impl Iterator<Item = &str> {
		self.entries.values().map(|entry| &*entry.key)
	}

	/// (key, value) pairs with keys in their original case.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
		self.entries.values().map(|entry| (&*entry.key, &entry.value))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Lookup ordering rank. Missing or non-integer values count as zero.
	pub fn rank(&self) -> i64 {
		match self.get(SERVICE_RANK) {
			Some(Value::Int(rank)) => *rank,
			_ => 0,
		}
	}
}
