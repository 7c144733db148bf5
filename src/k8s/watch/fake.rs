//! Scripted list and watch functions for tests

use super::{ListOptions, ListWatch, ResourceVersion, StopHandle, Watch, WatchOptions};
use crate::error::Result;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use k8s_openapi::serde_json::{self, json};
use kube::core::{DynamicObject, ObjectList, WatchEvent};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Items one watch call produces
pub struct WatchScript {
    items: Vec<Result<WatchEvent<DynamicObject>>>,
    hold_open: bool,
}

impl WatchScript {
    /// Produce `items`, then end
    pub fn ending(items: Vec<Result<WatchEvent<DynamicObject>>>) -> Self {
        Self {
            items,
            hold_open: false,
        }
    }

    /// Produce `items`, then stay open
    pub fn open(items: Vec<Result<WatchEvent<DynamicObject>>>) -> Self {
        Self {
            items,
            hold_open: true,
        }
    }
}

#[derive(Default)]
struct Script {
    lists: VecDeque<Result<ObjectList<DynamicObject>>>,
    watches: VecDeque<WatchScript>,
    list_calls: Vec<ResourceVersion>,
    watch_calls: Vec<WatchOptions>,
}

/// Lists and watches answer from a script; unscripted calls never complete
#[derive(Clone, Default)]
pub struct FakeListWatch {
    script: Arc<Mutex<Script>>,
    stops: Arc<AtomicUsize>,
}

impl FakeListWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_list(&self, result: Result<ObjectList<DynamicObject>>) {
        self.script.lock().unwrap().lists.push_back(result);
    }

    pub fn push_watch(&self, script: WatchScript) {
        self.script.lock().unwrap().watches.push_back(script);
    }

    pub fn list_calls(&self) -> Vec<ResourceVersion> {
        self.script.lock().unwrap().list_calls.clone()
    }

    pub fn watch_calls(&self) -> Vec<WatchOptions> {
        self.script.lock().unwrap().watch_calls.clone()
    }

    /// How many times a stop handle has been invoked
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl ListWatch for FakeListWatch {
    type Object = DynamicObject;

    fn list(&self, options: &ListOptions) -> BoxFuture<'static, Result<ObjectList<DynamicObject>>> {
        let mut script = self.script.lock().unwrap();
        script.list_calls.push(options.resource_version.clone());
        match script.lists.pop_front() {
            Some(result) => future::ready(result).boxed(),
            None => future::pending().boxed(),
        }
    }

    fn watch(&self, options: &WatchOptions) -> Watch<DynamicObject> {
        let mut script = self.script.lock().unwrap();
        script.watch_calls.push(options.clone());

        let stops = Arc::clone(&self.stops);
        let stop = StopHandle::new(move || {
            stops.fetch_add(1, Ordering::SeqCst);
        });

        let events = match script.watches.pop_front() {
            Some(WatchScript { items, hold_open: false }) => stream::iter(items).boxed(),
            Some(WatchScript { items, hold_open: true }) => {
                stream::iter(items).chain(stream::pending()).boxed()
            }
            None => stream::pending().boxed(),
        };

        Watch { events, stop }
    }
}

pub fn pod_list(version: &str) -> ObjectList<DynamicObject> {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PodList",
        "metadata": { "resourceVersion": version },
        "items": []
    }))
    .unwrap()
}

pub fn pod_event(name: &str, version: &str) -> WatchEvent<DynamicObject> {
    serde_json::from_value(json!({
        "type": "MODIFIED",
        "object": {
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "resourceVersion": version }
        }
    }))
    .unwrap()
}

pub fn bookmark(version: &str) -> WatchEvent<DynamicObject> {
    serde_json::from_value(json!({
        "type": "BOOKMARK",
        "object": {
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "resourceVersion": version }
        }
    }))
    .unwrap()
}
