//! Watch body decoding
//!
//! The API server writes one JSON object per line for the lifetime of a watch.
//! Chunk boundaries from the transport do not line up with records, so
//! partial lines are buffered until their newline arrives.

use crate::error::{Error, Result, STALE_CURSOR_STATUS};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use futures::future;
use k8s_openapi::serde_json;
use kube::core::WatchEvent;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

/// Splits a chunked body into newline-delimited records
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buffer: BytesMut,
}

impl RecordDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every record completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(newline + 1).freeze();
            if let Some(record) = trimmed(&line) {
                records.push(record);
            }
        }

        records
    }

    /// Flush a final record that was not newline terminated
    pub fn finish(&mut self) -> Option<Bytes> {
        let rest = self.buffer.split().freeze();
        trimmed(&rest)
    }
}

fn trimmed(line: &Bytes) -> Option<Bytes> {
    let record = line.trim_ascii();
    if record.is_empty() {
        None
    } else {
        Some(line.slice_ref(record))
    }
}

/// A bare `Status` object, which is what the server sends instead of events
/// when the watch itself failed
#[derive(Deserialize)]
struct StatusRecord {
    kind: String,
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

/// Parse one record into a watch event
///
/// # Errors
///
/// `Error::StaleCursor` for an expired resource version (either as an `ERROR`
/// event or a bare status), `Error::Transport` for other failure statuses and
/// `Error::Decode` for anything that does not parse
pub fn parse_watch_event<K>(record: &[u8]) -> Result<WatchEvent<K>>
where
    K: DeserializeOwned + Clone,
{
    match serde_json::from_slice::<WatchEvent<K>>(record) {
        Ok(WatchEvent::Error(status)) if status.code == STALE_CURSOR_STATUS => {
            Err(Error::from_status(status.code, &status.message))
        }
        Ok(event) => Ok(event),
        Err(source) => match serde_json::from_slice::<StatusRecord>(record) {
            Ok(status) if status.kind == "Status" => {
                Err(Error::from_status(status.code, status.message))
            }
            _ => {
                warn!("failed to parse watch record: {source}");
                Err(Error::Decode {
                    record: String::from_utf8_lossy(record).into_owned(),
                    source,
                })
            }
        },
    }
}

/// Decode a chunked watch body into events
///
/// Every complete record yields one item. A decode failure yields an `Err`
/// item and decoding continues with the next record; a transport failure is
/// passed through as is. The stream ends when `chunks` ends.
pub fn decode_watch_events<K, S>(chunks: S) -> impl Stream<Item = Result<WatchEvent<K>>> + Send + 'static
where
    K: DeserializeOwned + Clone + Send + 'static,
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let mut decoder = RecordDecoder::new();

    chunks
        .map(Some)
        .chain(stream::once(future::ready(None)))
        .flat_map(move |chunk| {
            let events: Vec<Result<WatchEvent<K>>> = match chunk {
                Some(Ok(bytes)) => decoder
                    .feed(&bytes)
                    .iter()
                    .map(|record| parse_watch_event(record))
                    .collect(),
                Some(Err(err)) => vec![Err(err)],
                None => {
                    debug!("watch body ended");
                    decoder
                        .finish()
                        .iter()
                        .map(|record| parse_watch_event(record))
                        .collect()
                }
            };
            stream::iter(events)
        })
}
