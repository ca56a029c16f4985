//! Observable Values
//!
//! Engine state published through `tokio::sync::watch` for any number of
//! subscribers (UI layer, logging, tests).
//!
//! Only the engine writes an observable; callers get read access through
//! [`Observable::get`] and [`Observable::subscribe`].
//!
//! # Example
//!
//! ```rust,ignore
//! let mut rx = session.regulator().temperature().subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("CCD temperature: {:.2} C", *rx.borrow());
//!     }
//! });
//! ```

use std::fmt::Debug;
use tokio::sync::watch;

/// A thread-safe, observable value with change notifications.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    name: String,
    units: Option<String>,
}

impl<T: Clone + Send + Sync + Debug + 'static> Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.name)
            .field("value", &*self.sender.borrow())
            .field("units", &self.units)
            .finish()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            name: name.into(),
            units: None,
        }
    }

    /// Add units to this observable.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Name of the published quantity.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical units, if any.
    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    /// Publish a value unconditionally.
    pub(crate) fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Publish `value` only if `should_publish(current, &value)` holds.
    ///
    /// Returns whether subscribers were notified.
    pub(crate) fn publish_if<F>(&self, value: T, should_publish: F) -> bool
    where
        F: FnOnce(&T, &T) -> bool,
    {
        self.sender.send_if_modified(|current| {
            if should_publish(current, &value) {
                *current = value;
                true
            } else {
                false
            }
        })
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Publish only when the value differs from the current one.
    pub(crate) fn set_if_changed(&self, value: T) -> bool {
        self.publish_if(value, |current, new| current != new)
    }
}

impl Observable<f64> {
    /// Publish only when the value moved by at least `delta`.
    pub(crate) fn set_if_moved(&self, value: f64, delta: f64) -> bool {
        self.publish_if(value, |current, new| (new - current).abs() >= delta)
    }
}
