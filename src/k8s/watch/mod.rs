/**
 * List + watch resynchronization
 *
 * `EventSource` turns a list function and a watch function into discrete
 * lifecycle events and guarantees at most one open watch. `ResyncStream`
 * drives it: it owns the resource version cursor, relists when the cursor is
 * unknown or stale, rewatches when a watch ends, and closes the watch when the
 * consumer falls behind.
 */
pub mod backoff;
pub mod config;
pub mod resync;
pub mod source;

#[cfg(test)]
pub(crate) mod fake;

pub use backoff::Backoff;
pub use config::ResyncConfig;
pub use resync::{Notice, Phase, ResyncStream, jittered_timeout, timeout_seconds};
pub use source::{EventSource, SourceEvent};

use crate::error::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use kube::core::{ObjectList, WatchEvent};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;

/// Opaque, server assigned position in a resource's change history
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    /// Version meaning "any", used before anything has been observed
    pub const UNKNOWN: &'static str = "0";

    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    #[must_use]
    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Version of a snapshot
    pub fn of_list<K: Clone>(list: &ObjectList<K>) -> Option<Self> {
        list.metadata.resource_version.clone().map(Self)
    }

    /// Version of the object carried by a watch event; `Error` events have none
    pub fn of_event<K: Resource + Clone>(event: &WatchEvent<K>) -> Option<Self> {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                obj.resource_version().map(Self)
            }
            WatchEvent::Bookmark(bookmark) => Some(Self::new(bookmark.metadata.resource_version.clone())),
            WatchEvent::Error(_) => None,
        }
    }
}

impl Default for ResourceVersion {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceVersion {
    fn from(version: &str) -> Self {
        Self::new(version)
    }
}

impl From<String> for ResourceVersion {
    fn from(version: String) -> Self {
        Self(version)
    }
}

impl PartialEq<&str> for ResourceVersion {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListOptions {
    pub resource_version: ResourceVersion,
}

impl ListOptions {
    #[must_use]
    pub const fn new(resource_version: ResourceVersion) -> Self {
        Self { resource_version }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    pub resource_version: ResourceVersion,
    /// Server side timeout hint for the watch request
    pub timeout: Duration,
}

/// Owned cancellation for one watch
///
/// Stopping is idempotent, and dropping the handle stops it, so the watch
/// connection is released exactly once however the watch finishes.
pub struct StopHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl StopHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    /// A handle with nothing to release
    #[must_use]
    pub fn noop() -> Self {
        Self { stop: None }
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }

    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stop.is_none()
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// An open watch: its events, ending with `None` when the server closes it,
/// and the handle that stops it early
pub struct Watch<K> {
    pub events: BoxStream<'static, Result<WatchEvent<K>>>,
    pub stop: StopHandle,
}

/// The list and watch functions for one resource
pub trait ListWatch: Send + Unpin + 'static {
    type Object: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Unpin + 'static;

    /// Fetch a snapshot
    fn list(&self, options: &ListOptions) -> BoxFuture<'static, Result<ObjectList<Self::Object>>>;

    /// Open a watch continuing from `options.resource_version`
    fn watch(&self, options: &WatchOptions) -> Watch<Self::Object>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_stop_handle_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut handle = StopHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.stop();
        handle.stop();
        drop(handle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_handle_runs_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        drop(StopHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resource_version_default_is_unknown() {
        let version = ResourceVersion::default();
        assert!(version.is_unknown());
        assert_eq!(version, "0");
        assert!(!ResourceVersion::from("17").is_unknown());
    }
}
