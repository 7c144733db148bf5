//! HTTP capability used by resource clients
//!
//! A transport performs two kinds of GET: a buffered one for lists and a
//! streaming one for watches. TLS, authentication and connection pooling are
//! the transport's concern; callers only build requests and read bytes.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::io::{AsyncRead, AsyncReadExt};
use futures::stream::{self, BoxStream, StreamExt};
use hyper::http::Request;
use tracing::debug;

/// Raw body chunks of a streaming response, in arrival order
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

const READ_CHUNK_SIZE: usize = 16 * 1024;

#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    /// Perform a request and return the complete body
    ///
    /// # Errors
    ///
    /// `Error::Transport` for non-2xx responses and connection failures,
    /// `Error::StaleCursor` for HTTP 410
    async fn get(&self, request: Request<Vec<u8>>) -> Result<Bytes>;

    /// Perform a request and return its body as it arrives
    ///
    /// Dropping the returned stream releases the connection.
    ///
    /// # Errors
    ///
    /// Same as [`HttpTransport::get`] for failures before the body starts
    async fn stream(&self, request: Request<Vec<u8>>) -> Result<ByteStream>;
}

/// Transport backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeTransport {
    client: kube::Client,
}

impl KubeTransport {
    #[must_use]
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for KubeTransport {
    async fn get(&self, request: Request<Vec<u8>>) -> Result<Bytes> {
        debug!("GET {}", request.uri());
        let text = self.client.request_text(request).await?;
        Ok(Bytes::from(text))
    }

    async fn stream(&self, request: Request<Vec<u8>>) -> Result<ByteStream> {
        debug!("GET {} (streaming)", request.uri());
        let reader = self.client.request_stream(request).await?;
        Ok(read_chunks(Box::pin(reader)))
    }
}

/// Turn an async reader into a stream of body chunks, ending on EOF or the first error
pub fn read_chunks<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::try_unfold(reader, read_chunk).boxed()
}

async fn read_chunk<R>(mut reader: R) -> Result<Option<(Bytes, R)>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; READ_CHUNK_SIZE];
    let read = reader
        .read(&mut buf)
        .await
        .map_err(|err| Error::transport(None, err))?;

    if read == 0 {
        return Ok(None);
    }

    buf.truncate(read);
    Ok(Some((Bytes::from(buf), reader)))
}
