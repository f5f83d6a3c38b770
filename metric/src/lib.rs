//! In-process metric primitives.
//!
//! Instruments are registered on a [`Registry`] under a name and description
//! and fan out into per-attribute-set observers. Exposition (Prometheus,
//! OTLP, ...) is the job of an exporter that walks the registry; none is
//! provided here.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::{
    any::Any,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// A set of `(key, value)` attribute pairs identifying one observer of an
/// instrument. Ordered so that attribute sets compare independent of
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Attributes(BTreeMap<&'static str, String>);

impl Attributes {
    /// Insert an attribute pair, replacing any previous value for the key.
    pub fn insert(&mut self, key: &'static str, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }

    /// Iterate the pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str); N]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (*k, (*v).to_string()))
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&'static str, String); N]> for Attributes {
    fn from(pairs: [(&'static str, String); N]) -> Self {
        Self(pairs.into_iter().collect())
    }
}

/// An observer that can be created per attribute set.
pub trait MetricObserver: Clone + std::fmt::Debug + Default + Send + Sync + 'static {}

/// A monotonic counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    value: Arc<AtomicU64>,
}

impl U64Counter {
    /// Add `count` to the counter.
    pub fn inc(&self, count: u64) {
        self.value.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {}

/// A gauge that can move in both directions.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    value: Arc<AtomicU64>,
}

impl U64Gauge {
    /// Set the gauge to `value`.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {}

/// A named instrument: a family of observers keyed by attribute set.
#[derive(Debug)]
pub struct Metric<T: MetricObserver> {
    name: &'static str,
    description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

// Manual impl: `T` need not be `Clone`-bounded at the struct level for the
// handle itself to be cloneable.
impl<T: MetricObserver> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            observers: Arc::clone(&self.observers),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Default::default(),
        }
    }

    /// The instrument name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The instrument description.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Return the observer for `attributes`, creating it on first use.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        let attributes = attributes.into();
        self.observers
            .lock()
            .entry(attributes)
            .or_default()
            .clone()
    }

    /// Return the observer for `attributes` if one has been created.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }
}

/// A registry of instruments.
///
/// Instruments are identified by name; registering the same name twice with
/// the same observer type returns the existing instrument.
#[derive(Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&'static str> = self.instruments.lock().keys().copied().collect();
        f.debug_struct("Registry").field("instruments", &names).finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Register (or fetch) the instrument `name`.
    ///
    /// # Panics
    ///
    /// If `name` was previously registered with a different observer type.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        let entry = instruments
            .entry(name)
            .or_insert_with(|| Box::new(Metric::<T>::new(name, description)));
        entry
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("instrument {name} registered with a different type"))
            .clone()
    }

    /// Look up a previously registered instrument by name.
    pub fn get_instrument<T: MetricObserver>(&self, name: &'static str) -> Option<Metric<T>> {
        self.instruments
            .lock()
            .get(name)
            .and_then(|i| i.downcast_ref::<Metric<T>>())
            .cloned()
    }
}
