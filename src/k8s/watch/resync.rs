/**
 * Resynchronizing stream of watch events
 *
 * Pull based: items are produced only while the consumer keeps polling. The
 * stream lists once to learn a resource version, then watches from it,
 * rewatching from the latest observed version every time a watch ends. When
 * the cursor is rejected as too old it relists from scratch.
 *
 * Backpressure: the source is only polled while fewer than `high_water_mark`
 * items are waiting. Filling the buffer closes the open watch; the next watch
 * starts from the cursor once the consumer has caught up. The cursor is
 * advanced before an event is buffered, so delivery is at-least-once: the
 * boundary event may be seen again after a resume.
 */
use super::config::{MAX_WATCH_TIMEOUT_SECONDS, NOTICE_CAPACITY, ResyncConfig};
use super::{Backoff, EventSource, ListOptions, ListWatch, ResourceVersion, SourceEvent, WatchOptions};
use crate::error::{Error, Result};
use futures::stream::{FusedStream, Stream};
use kube::core::{ObjectList, WatchEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Sleep;
use tracing::{debug, warn};

/// Where the stream is in its list/watch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Cursor unknown; the next pull lists
    NeedList,
    /// Cursor known, no watch open; the next pull watches
    NeedWatch,
    /// A watch is open, or is being closed for backpressure
    Watching,
    /// Closed by the consumer
    Closed,
}

/// Out of band notifications for stream listeners
#[derive(Debug, Clone)]
pub enum Notice<K: Clone> {
    /// A snapshot was listed; its items are not part of the item sequence
    Listed(ObjectList<K>),
    /// The stream was closed
    Closed,
}

enum Flow {
    Continue,
    /// Hand control back to the consumer before issuing more requests
    Yield,
}

/// Server side timeout for one watch: `base` stretched by `1 + sample`
///
/// `sample` is expected in `[0, 1)`. It is clamped to `[0, 1]` and a
/// non-finite sample counts as zero, so the result always lies in
/// `[base, 2 * base]`.
#[must_use]
pub fn jittered_timeout(base: Duration, sample: f64) -> Duration {
    let sample = if sample.is_finite() { sample.clamp(0.0, 1.0) } else { 0.0 };
    base.mul_f64(1.0 + sample)
}

pub struct ResyncStream<L: ListWatch> {
    source: EventSource<L>,
    phase: Phase,
    resource_version: ResourceVersion,
    timeout: Duration,
    high_water_mark: usize,
    buffer: VecDeque<Result<WatchEvent<L::Object>>>,
    backoff: Option<Backoff>,
    retry_delay: Option<Pin<Box<Sleep>>>,
    jitter: Box<dyn FnMut() -> f64 + Send>,
    notices: Option<broadcast::Sender<Notice<L::Object>>>,
}

impl<L: ListWatch> ResyncStream<L> {
    pub fn new(lister: L) -> Self {
        Self::with_config(lister, ResyncConfig::default())
    }

    pub fn with_config(lister: L, config: ResyncConfig) -> Self {
        let mut rng = StdRng::from_os_rng();
        Self {
            source: EventSource::new(lister),
            phase: Phase::NeedList,
            resource_version: ResourceVersion::unknown(),
            timeout: config.timeout,
            high_water_mark: config.high_water_mark.max(1),
            buffer: VecDeque::new(),
            backoff: config
                .initial_backoff
                .map(|initial| Backoff::new(initial, config.max_backoff)),
            retry_delay: None,
            jitter: Box::new(move || rng.random::<f64>()),
            notices: Some(broadcast::channel(NOTICE_CAPACITY).0),
        }
    }

    /// Replace the random source used for timeout jitter; samples should lie in `[0, 1)`
    #[must_use]
    pub fn with_jitter(mut self, sample: impl FnMut() -> f64 + Send + 'static) -> Self {
        self.jitter = Box::new(sample);
        self
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Latest observed resource version, `"0"` until the first list completes
    #[must_use]
    pub const fn resource_version(&self) -> &ResourceVersion {
        &self.resource_version
    }

    /// Items waiting for the consumer
    #[must_use]
    pub fn pending_items(&self) -> usize {
        self.buffer.len()
    }

    /// Receive `Listed` for every snapshot and `Closed` once on close
    ///
    /// At most `NOTICE_CAPACITY` notices are retained per receiver; a receiver
    /// that falls further behind gets `RecvError::Lagged` and skips the oldest.
    /// The channel closes after `Closed` has been sent.
    pub fn subscribe(&self) -> broadcast::Receiver<Notice<L::Object>> {
        match &self.notices {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Stop the open watch and any in-flight list; the stream then ends
    pub fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }

        debug!("closing stream at rv {}", self.resource_version);
        self.phase = Phase::Closed;
        self.source.close();
        self.source.abort_lists();
        self.buffer.clear();
        self.retry_delay = None;
        self.notify(Notice::Closed);
        self.notices = None;
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    fn notify(&self, notice: Notice<L::Object>) {
        if let Some(tx) = &self.notices {
            // no receivers is not an error
            let _ = tx.send(notice);
        }
    }

    fn next_timeout(&mut self) -> Duration {
        let sample = (self.jitter)();
        jittered_timeout(self.timeout, sample)
    }

    /// Whether the current phase wants a new request issued
    fn wants_request(&self) -> bool {
        match self.phase {
            Phase::NeedList => !self.source.listing(),
            Phase::NeedWatch => true,
            Phase::Watching | Phase::Closed => false,
        }
    }

    fn issue_request(&mut self) {
        match self.phase {
            Phase::NeedList => {
                debug!("listing objects from rv {}", ResourceVersion::UNKNOWN);
                self.source.list(&ListOptions::new(ResourceVersion::unknown()));
            }
            Phase::NeedWatch => {
                let timeout = self.next_timeout();
                debug!(
                    "watching objects from rv {} with {:.3}s timeout",
                    self.resource_version,
                    timeout.as_secs_f64()
                );
                self.source.watch(&WatchOptions {
                    resource_version: self.resource_version.clone(),
                    timeout,
                });
                self.phase = Phase::Watching;
            }
            Phase::Watching | Phase::Closed => {}
        }
    }

    /// True while a retry delay is still running
    fn retry_pending(&mut self, cx: &mut Context<'_>) -> bool {
        let Some(delay) = self.retry_delay.as_mut() else {
            return false;
        };
        if delay.as_mut().poll(cx).is_pending() {
            return true;
        }
        self.retry_delay = None;
        false
    }

    fn on_source_event(&mut self, event: SourceEvent<L::Object>) -> Flow {
        match event {
            SourceEvent::List(list) => {
                if let Some(backoff) = self.backoff.as_mut() {
                    backoff.reset();
                }
                match ResourceVersion::of_list(&list) {
                    Some(version) => self.resource_version = version,
                    None => warn!("list carried no resource version, watching from rv {}", self.resource_version),
                }
                debug!("latest rv {}", self.resource_version);
                if self.phase == Phase::NeedList {
                    self.phase = Phase::NeedWatch;
                }
                self.notify(Notice::Listed(list));
                Flow::Continue
            }
            SourceEvent::Event(event) => {
                if let Some(backoff) = self.backoff.as_mut() {
                    backoff.reset();
                }
                if let Some(version) = ResourceVersion::of_event(&event) {
                    self.resource_version = version;
                }
                debug!("latest rv {}", self.resource_version);

                self.buffer.push_back(Ok(event));
                if self.buffer.len() >= self.high_water_mark {
                    debug!("consumer buffer is full");
                    self.source.close();
                }
                Flow::Continue
            }
            SourceEvent::Error(err) => {
                self.on_error(err);
                Flow::Yield
            }
            SourceEvent::End => {
                debug!("source watch ended");
                if self.phase == Phase::Watching {
                    self.phase = Phase::NeedWatch;
                }
                Flow::Continue
            }
            SourceEvent::Close => {
                if self.phase == Phase::Watching {
                    debug!("watch closed, resuming from rv {}", self.resource_version);
                    self.phase = Phase::NeedWatch;
                }
                Flow::Continue
            }
        }
    }

    fn on_error(&mut self, err: Error) {
        if err.is_stale_cursor() {
            warn!("rv {} is no longer available, relisting: {err}", self.resource_version);
            self.source.close();
            self.resource_version = ResourceVersion::unknown();
            self.phase = Phase::NeedList;
        } else {
            warn!("stream error in phase {:?}: {err}", self.phase);
        }

        if let Some(backoff) = self.backoff.as_mut() {
            let delay = backoff.next_delay();
            debug!("next request delayed by {delay:?}");
            self.retry_delay = Some(Box::pin(tokio::time::sleep(delay)));
        }

        self.buffer.push_back(Err(err));
    }

    fn poll_items(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<WatchEvent<L::Object>>>> {
        loop {
            if self.phase == Phase::Closed {
                return Poll::Ready(None);
            }

            if self.buffer.len() < self.high_water_mark {
                if self.wants_request() && !self.retry_pending(cx) {
                    self.issue_request();
                }

                if let Poll::Ready(Some(event)) = self.source.poll_next_event(cx) {
                    match self.on_source_event(event) {
                        Flow::Continue => continue,
                        Flow::Yield => {}
                    }
                }
            }

            return match self.buffer.pop_front() {
                Some(item) => Poll::Ready(Some(item)),
                None => Poll::Pending,
            };
        }
    }
}

impl<L: ListWatch> Stream for ResyncStream<L> {
    type Item = Result<WatchEvent<L::Object>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_items(cx)
    }
}

impl<L: ListWatch> FusedStream for ResyncStream<L> {
    fn is_terminated(&self) -> bool {
        self.is_closed()
    }
}

/// Watch timeout in whole seconds as sent to the server
#[must_use]
pub fn timeout_seconds(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_secs())
        .unwrap_or(u32::MAX)
        .clamp(1, MAX_WATCH_TIMEOUT_SECONDS)
}
