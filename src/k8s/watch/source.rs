/**
 * Event source over a list function and a watch function
 *
 * Every call into the injected functions is turned into lifecycle events
 * polled by the owner: `List` per successful list, `Event` per watch record,
 * `Error` for any failure, `End` when a watch finishes on its own and `Close`
 * when it is stopped through `close()`. At most one watch is open at a time.
 * Retrying is left to the caller.
 */
use super::{ListOptions, ListWatch, StopHandle, WatchOptions};
use crate::error::{Error, Result};
use futures::future::{BoxFuture, poll_fn};
use futures::stream::{BoxStream, FuturesOrdered, StreamExt};
use kube::core::{ObjectList, WatchEvent};
use std::collections::VecDeque;
use std::task::{Context, Poll};
use tracing::debug;

#[derive(Debug)]
pub enum SourceEvent<K: Clone> {
    List(ObjectList<K>),
    Event(WatchEvent<K>),
    Error(Error),
    /// The watch finished on its own
    End,
    /// The watch was stopped by `close()`
    Close,
}

struct ActiveWatch<K> {
    events: BoxStream<'static, Result<WatchEvent<K>>>,
    stop: StopHandle,
}

pub struct EventSource<L: ListWatch> {
    lister: L,
    lists: FuturesOrdered<BoxFuture<'static, Result<ObjectList<L::Object>>>>,
    watch: Option<ActiveWatch<L::Object>>,
    closed: VecDeque<SourceEvent<L::Object>>,
}

impl<L: ListWatch> EventSource<L> {
    pub fn new(lister: L) -> Self {
        Self {
            lister,
            lists: FuturesOrdered::new(),
            watch: None,
            closed: VecDeque::new(),
        }
    }

    /// Request a snapshot; reported as `List` or `Error`
    pub fn list(&mut self, options: &ListOptions) {
        debug!("listing from rv {}", options.resource_version);
        self.lists.push_back(self.lister.list(options));
    }

    /// Open a watch unless one is already open
    pub fn watch(&mut self, options: &WatchOptions) {
        if self.watch.is_some() {
            debug!("already watching, ignoring watch from rv {}", options.resource_version);
            return;
        }

        debug!(
            "watching from rv {} with {}s timeout",
            options.resource_version,
            options.timeout.as_secs_f64()
        );
        let watch = self.lister.watch(options);
        self.watch = Some(ActiveWatch {
            events: watch.events,
            stop: watch.stop,
        });
    }

    /// Stop the open watch, if any, and report `Close`
    pub fn close(&mut self) {
        if let Some(mut active) = self.watch.take() {
            debug!("stop watching");
            active.stop.stop();
            self.closed.push_back(SourceEvent::Close);
        }
    }

    /// Drop lists still in flight without reporting them
    pub fn abort_lists(&mut self) {
        if !self.lists.is_empty() {
            debug!("aborting {} in-flight list(s)", self.lists.len());
            self.lists = FuturesOrdered::new();
        }
    }

    #[must_use]
    pub const fn watching(&self) -> bool {
        self.watch.is_some()
    }

    #[must_use]
    pub fn listing(&self) -> bool {
        !self.lists.is_empty()
    }

    /// Nothing in flight and nothing left to report
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.closed.is_empty() && self.lists.is_empty() && self.watch.is_none()
    }

    /// Poll for the next lifecycle event
    ///
    /// `Ready(None)` means the source is idle and will not produce anything
    /// until `list` or `watch` is called again.
    pub fn poll_next_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<SourceEvent<L::Object>>> {
        if let Some(event) = self.closed.pop_front() {
            return Poll::Ready(Some(event));
        }

        if let Poll::Ready(Some(result)) = self.lists.poll_next_unpin(cx) {
            return Poll::Ready(Some(match result {
                Ok(list) => {
                    debug!(
                        "{} returned {} items",
                        list.types.kind,
                        list.items.len()
                    );
                    SourceEvent::List(list)
                }
                Err(err) => {
                    debug!("list error {err}");
                    SourceEvent::Error(err)
                }
            }));
        }

        if let Some(active) = self.watch.as_mut() {
            match active.events.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(SourceEvent::Event(event))),
                Poll::Ready(Some(Err(err))) => {
                    debug!("watch error {err}");
                    return Poll::Ready(Some(SourceEvent::Error(err)));
                }
                Poll::Ready(None) => {
                    debug!("watch end");
                    self.watch = None;
                    return Poll::Ready(Some(SourceEvent::End));
                }
                Poll::Pending => {}
            }
        }

        if self.is_idle() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }

    /// Wait for the next lifecycle event; `None` when idle
    pub async fn next_event(&mut self) -> Option<SourceEvent<L::Object>> {
        poll_fn(|cx| self.poll_next_event(cx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::watch::ResourceVersion;
    use crate::k8s::watch::fake::{FakeListWatch, WatchScript, pod_event, pod_list};
    use futures::FutureExt;
    use std::time::Duration;

    fn watch_options(version: &str) -> WatchOptions {
        WatchOptions {
            resource_version: ResourceVersion::from(version),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_list_emits_list() {
        let fake = FakeListWatch::new();
        fake.push_list(Ok(pod_list("100")));
        let mut source = EventSource::new(fake.clone());

        source.list(&ListOptions::new(ResourceVersion::unknown()));
        match source.next_event().await {
            Some(SourceEvent::List(list)) => {
                assert_eq!(list.metadata.resource_version.as_deref(), Some("100"));
            }
            other => panic!("expected list, got {other:?}"),
        }
        assert_eq!(fake.list_calls(), vec![ResourceVersion::unknown()]);
        assert!(source.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_list_error_leaves_watch_alone() {
        let fake = FakeListWatch::new();
        fake.push_list(Err(Error::transport(Some(500), "boom")));
        fake.push_watch(WatchScript::open(vec![]));
        let mut source = EventSource::new(fake.clone());

        source.watch(&watch_options("7"));
        source.list(&ListOptions::default());

        assert!(matches!(source.next_event().await, Some(SourceEvent::Error(_))));
        assert!(source.watching());
        assert_eq!(fake.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_is_called_once_while_watching() {
        let fake = FakeListWatch::new();
        fake.push_watch(WatchScript::open(vec![]));
        let mut source = EventSource::new(fake.clone());

        source.watch(&watch_options("1"));
        source.watch(&watch_options("2"));
        source.watch(&watch_options("3"));

        assert_eq!(fake.watch_calls().len(), 1);
        assert_eq!(fake.watch_calls()[0].resource_version, "1");
    }

    #[tokio::test]
    async fn test_events_then_end() {
        let fake = FakeListWatch::new();
        fake.push_watch(WatchScript::ending(vec![
            Ok(pod_event("web-0", "101")),
            Err(Error::transport(None, "hiccup")),
            Ok(pod_event("web-0", "102")),
        ]));
        let mut source = EventSource::new(fake.clone());
        source.watch(&watch_options("100"));

        assert!(matches!(source.next_event().await, Some(SourceEvent::Event(_))));
        assert!(matches!(source.next_event().await, Some(SourceEvent::Error(_))));
        assert!(source.watching(), "errors do not end the watch");
        assert!(matches!(source.next_event().await, Some(SourceEvent::Event(_))));
        assert!(matches!(source.next_event().await, Some(SourceEvent::End)));
        assert!(!source.watching());
        assert!(source.next_event().await.is_none());

        // a new watch may start once the previous one ended
        fake.push_watch(WatchScript::open(vec![]));
        source.watch(&watch_options("102"));
        assert_eq!(fake.watch_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_close_stops_once() {
        let fake = FakeListWatch::new();
        fake.push_watch(WatchScript::open(vec![]));
        let mut source = EventSource::new(fake.clone());
        source.watch(&watch_options("5"));

        source.close();
        source.close();

        assert_eq!(fake.stop_count(), 1);
        assert!(!source.watching());
        assert!(matches!(source.next_event().await, Some(SourceEvent::Close)));
        assert!(source.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_close_without_watch_is_noop() {
        let fake = FakeListWatch::new();
        let mut source = EventSource::new(fake.clone());

        source.close();
        assert!(source.is_idle());
        assert_eq!(fake.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_end_releases_stop_handle() {
        let fake = FakeListWatch::new();
        fake.push_watch(WatchScript::ending(vec![]));
        let mut source = EventSource::new(fake.clone());
        source.watch(&watch_options("5"));

        assert!(matches!(source.next_event().await, Some(SourceEvent::End)));
        source.close();
        assert_eq!(fake.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_pending_watch_stays_pending() {
        let fake = FakeListWatch::new();
        fake.push_watch(WatchScript::open(vec![]));
        let mut source = EventSource::new(fake.clone());
        source.watch(&watch_options("5"));

        assert!(source.next_event().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_abort_lists() {
        let fake = FakeListWatch::new();
        let mut source = EventSource::new(fake.clone());
        source.list(&ListOptions::default());
        assert!(source.listing());

        source.abort_lists();
        assert!(source.is_idle());
        assert!(source.next_event().await.is_none());
    }
}
