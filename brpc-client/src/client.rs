//! Multiplexed RPC client.
//!
//! One connection carries many concurrent calls. Each call takes the next
//! sequence number and waits on its own channel. A single reader task routes
//! each response to the matching call by sequence number.

use crate::context::Context;
use crate::error::ClientError;
use brpc_protocol::codec::{from_value, to_value};
use brpc_protocol::{
    write_options, CodecRegistry, FrameReader, FrameWriter, Header, Options, ProtocolError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
type CallResult = Result<Value, ClientError>;

#[derive(Default)]
struct Pending {
    seq: u64,
    calls: HashMap<u64, oneshot::Sender<CallResult>>,
    /// Set by `close()`.
    closing: bool,
    /// Set when the reader hits an error.
    shutdown: bool,
}

struct Inner {
    pending: parking_lot::Mutex<Pending>,
    writer: tokio::sync::Mutex<FrameWriter<BoxedWrite>>,
    options: Options,
}

impl Inner {
    fn register(&self) -> Result<(u64, oneshot::Receiver<CallResult>), ClientError> {
        let mut pending = self.pending.lock();
        if pending.closing || pending.shutdown {
            return Err(ClientError::Shutdown);
        }
        pending.seq += 1;
        let seq = pending.seq;
        let (tx, rx) = oneshot::channel();
        pending.calls.insert(seq, tx);
        Ok((seq, rx))
    }

    fn take(&self, seq: u64) -> Option<oneshot::Sender<CallResult>> {
        self.pending.lock().calls.remove(&seq)
    }

    /// Fails every pending call once the connection can no longer be read.
    fn terminate(&self, reason: ProtocolError) {
        let calls = {
            let mut pending = self.pending.lock();
            pending.shutdown = true;
            std::mem::take(&mut pending.calls)
        };
        let reason = reason.to_string();
        if !calls.is_empty() {
            tracing::debug!("rpc client: failing {} pending calls: {}", calls.len(), reason);
        }
        for tx in calls.into_values() {
            let _ = tx.send(Err(ClientError::ConnectionBroken(reason.clone())));
        }
    }
}

/// Removes a call from the pending table when the caller stops waiting.
struct PendingGuard<'a> {
    inner: &'a Inner,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.take(self.seq);
    }
}

/// A client connection.
pub struct Client {
    inner: Arc<Inner>,
    reader: JoinHandle<()>,
}

impl Client {
    /// Connects over `network` (`"tcp"`, or `"unix"` on unix targets).
    ///
    /// The whole setup, handshake included, is bounded by
    /// `options.connect_timeout` unless it is zero.
    pub async fn dial(network: &str, address: &str, options: Options) -> Result<Self, ClientError> {
        let timeout = options.connect_timeout;
        tracing::debug!("Dialing {}@{}...", network, address);

        let connect = Self::connect(network, address, options);
        if timeout.is_zero() {
            return connect.await;
        }
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| ClientError::ConnectTimeout(timeout))?
    }

    async fn connect(network: &str, address: &str, options: Options) -> Result<Self, ClientError> {
        match network {
            "tcp" => {
                let stream = TcpStream::connect(address).await?;
                // Configure TCP options for lower latency
                stream.set_nodelay(true).ok();
                Self::new(stream, options).await
            }
            #[cfg(unix)]
            "unix" => {
                let stream = tokio::net::UnixStream::connect(address).await?;
                Self::new(stream, options).await
            }
            other => Err(ClientError::UnsupportedNetwork(other.to_string())),
        }
    }

    /// Connects to an endpoint written as `protocol@address`, e.g.
    /// `tcp@127.0.0.1:9999`.
    pub async fn xdial(endpoint: &str, options: Options) -> Result<Self, ClientError> {
        let (network, address) = parse_endpoint(endpoint)?;
        Self::dial(network, address, options).await
    }

    /// Starts a client over an established stream using the default codecs.
    pub async fn new<S>(stream: S, options: Options) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_codecs(stream, options, &CodecRegistry::default()).await
    }

    /// Starts a client over an established stream, resolving the codec
    /// from `codecs`.
    pub async fn with_codecs<S>(
        stream: S,
        options: Options,
        codecs: &CodecRegistry,
    ) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = codecs.resolve(&options.codec_type)?;

        let (read_half, mut write_half) = tokio::io::split(stream);
        write_options(&mut write_half, &options).await?;

        let write_half: BoxedWrite = Box::new(write_half);
        let inner = Arc::new(Inner {
            pending: parking_lot::Mutex::new(Pending::default()),
            writer: tokio::sync::Mutex::new(FrameWriter::new(write_half, codec.clone())),
            options,
        });
        let reader = tokio::spawn(read_loop(inner.clone(), FrameReader::new(read_half, codec)));

        Ok(Self { inner, reader })
    }

    /// Calls `service_method` and waits for the reply, or for `ctx` to
    /// finish, whichever happens first.
    pub async fn call<A, R>(&self, ctx: &Context, service_method: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = to_value(args)?;
        let reply = self.call_value(ctx, service_method, &args).await?;
        Ok(from_value(reply)?)
    }

    /// Untyped form of [`Client::call`].
    pub async fn call_value(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &Value,
    ) -> Result<Value, ClientError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let (seq, rx) = self.inner.register()?;
        let _guard = PendingGuard {
            inner: &self.inner,
            seq,
        };
        tracing::debug!("Sending {} (seq={})", service_method, seq);

        {
            let mut writer = tokio::select! {
                biased;
                err = ctx.done() => return Err(err.into()),
                writer = self.inner.writer.lock() => writer,
            };
            // Not raced against ctx: a half-written pair would poison the stream.
            writer.write_value(&Header::new(service_method, seq), args).await?;
        }

        tokio::select! {
            biased;
            err = ctx.done() => {
                tracing::debug!("Call {} (seq={}) abandoned: {}", service_method, seq, err);
                Err(err.into())
            }
            result = rx => result.unwrap_or(Err(ClientError::Shutdown)),
        }
    }

    /// Closes the connection and fails pending calls. Idempotent.
    pub async fn close(&self) -> Result<(), ClientError> {
        let calls = {
            let mut pending = self.inner.pending.lock();
            if pending.closing {
                return Ok(());
            }
            pending.closing = true;
            std::mem::take(&mut pending.calls)
        };
        tracing::debug!("Closing client, {} pending calls", calls.len());

        for tx in calls.into_values() {
            let _ = tx.send(Err(ClientError::Shutdown));
        }
        self.inner.writer.lock().await.close().await;
        self.reader.abort();
        Ok(())
    }

    /// Returns whether new calls can be issued.
    pub fn is_available(&self) -> bool {
        let pending = self.inner.pending.lock();
        !pending.closing && !pending.shutdown
    }

    /// Returns the number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().calls.len()
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Splits `protocol@address`.
pub fn parse_endpoint(endpoint: &str) -> Result<(&str, &str), ClientError> {
    match endpoint.split_once('@') {
        Some((network, address)) if !network.is_empty() && !address.is_empty() => {
            Ok((network, address))
        }
        _ => Err(ClientError::InvalidAddress(endpoint.to_string())),
    }
}

async fn read_loop<R>(inner: Arc<Inner>, mut reader: FrameReader<R>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let header = match reader.read_header().await {
            Ok(header) => header,
            Err(e) => break e,
        };
        let call = inner.take(header.seq);

        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(e) => {
                if let Some(tx) = call {
                    let _ = tx.send(Err(ClientError::ConnectionBroken(e.to_string())));
                }
                break e;
            }
        };

        let Some(tx) = call else {
            // Cancelled or never sent; the body was read to stay in sync.
            tracing::debug!("Discarding response for seq={}", header.seq);
            continue;
        };

        let result = if header.is_error() {
            Err(ClientError::Server(header.error))
        } else {
            reader.codec().decode(&body).map_err(ClientError::from)
        };
        let _ = tx.send(result);
    };

    tracing::debug!("Client reader stopped: {}", reason);
    inner.terminate(reason);
}
