//! Structured counters and gauges, recorded through a single process-wide [`Registry`].
//!
//! This mirrors the teacher's `metric` crate: components register a named [`Metric`]
//! once at construction time, then pull out per-label-set recorders (a [`U64Counter`]
//! or [`U64Gauge`]) to update on the hot path without re-locking the registry.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// The set of key/value labels identifying one observation of a [`Metric`].
///
/// Ordered so that two attribute sets built from the same pairs in a different
/// order compare equal and hash equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attributes(BTreeMap<&'static str, String>);

impl Attributes {
    /// An empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a label.
    pub fn insert(&mut self, key: &'static str, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }
}

impl<const N: usize> From<&[(&'static str, &str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &str); N]) -> Self {
        let mut a = Self::new();
        for (k, v) in pairs {
            a.insert(k, *v);
        }
        a
    }
}

impl From<&[(&'static str, &str)]> for Attributes {
    fn from(pairs: &[(&'static str, &str)]) -> Self {
        let mut a = Self::new();
        for (k, v) in pairs {
            a.insert(k, *v);
        }
        a
    }
}

/// A monotonic counter recorder.
///
/// Cloning a `U64Counter` shares the same underlying value: clones are handles,
/// not independent counters.
#[derive(Debug, Clone, Default)]
pub struct U64Counter(Arc<AtomicU64>);

impl U64Counter {
    /// Increment the counter by `delta`.
    pub fn inc(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge recorder that can move up or down.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge(Arc<AtomicI64>);

impl U64Gauge {
    /// Set the gauge to an absolute value.
    pub fn set(&self, value: u64) {
        self.0.store(value as i64, Ordering::Relaxed);
    }

    /// Increment the gauge by `delta`.
    pub fn inc(&self, delta: u64) {
        self.0.fetch_add(delta as i64, Ordering::Relaxed);
    }

    /// Decrement the gauge by `delta`, saturating at zero.
    pub fn dec(&self, delta: u64) {
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some((v - delta as i64).max(0))
            })
            .ok();
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed).max(0) as u64
    }
}

/// Anything that can be recorded as a named, labeled instrument.
///
/// Implemented by [`U64Counter`] and [`U64Gauge`]; not meant to be implemented
/// outside this crate.
pub trait MetricObserver: Clone + Default + Debug + Send + Sync + 'static {}
impl MetricObserver for U64Counter {}
impl MetricObserver for U64Gauge {}

/// A named, described instrument that fans out into one recorder per [`Attributes`] set.
#[derive(Debug)]
pub struct Metric<T: MetricObserver> {
    name: &'static str,
    description: &'static str,
    observers: Mutex<BTreeMap<Attributes, T>>,
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Mutex::new(BTreeMap::new()),
        }
    }

    /// The instrument's name, as registered.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The instrument's description, as registered.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Get (creating if necessary) the recorder for `attributes`.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        let attributes = attributes.into();
        self.observers
            .lock()
            .entry(attributes)
            .or_insert_with(T::default)
            .clone()
    }

    /// Get the recorder for `attributes`, if one has already been created.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }
}

/// A process-wide (or test-scoped) collection of named instruments.
///
/// Cheap to construct; typically held behind an `Arc` and shared across a
/// component tree the way `metric_registry: Arc<metric::Registry>` is threaded
/// through the teacher's ingester.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or retrieve an already-registered) instrument named `name`.
    ///
    /// Registering the same name twice with the same `T` returns the existing
    /// instrument; registering the same name with a different `T` panics, since
    /// that indicates two components disagree about what the metric measures.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Arc<Metric<T>> {
        let mut instruments = self.instruments.lock();
        let entry = instruments
            .entry(name)
            .or_insert_with(|| Arc::new(Metric::<T>::new(name, description)))
            .clone();
        entry
            .downcast::<Metric<T>>()
            .unwrap_or_else(|_| panic!("metric {name} already registered with a different type"))
    }

    /// Look up a previously registered instrument by name.
    pub fn get_instrument<T: MetricObserver>(&self, name: &str) -> Option<Arc<Metric<T>>> {
        self.instruments
            .lock()
            .get(name)
            .cloned()
            .and_then(|any| any.downcast::<Metric<T>>().ok())
    }
}
