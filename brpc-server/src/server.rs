//! RPC server implementation.
//!
//! Each connection runs `HANDSHAKE -> SERVING -> CLOSED`. The handshake reads
//! one JSON `Options` line and selects the codec. Serving reads requests one
//! at a time and hands each to its own task, so slow methods never hold up
//! reading. Responses share one write lock per connection. On close, the
//! server waits for every in-flight request to answer before shutting the
//! stream down.

use crate::error::ServerError;
use crate::registry::Registry;
use crate::service::{PreparedCall, Service};
use brpc_protocol::{
    read_options, Codec, CodecRegistry, FrameReader, FrameWriter, Header, Options,
    ProtocolError, MAGIC_NUMBER,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Handling timeout for clients whose handshake sets none (zero = unlimited).
    pub handle_timeout: Duration,
    /// Codecs accepted in the handshake (empty = every registered codec).
    pub accepted_codecs: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], brpc_protocol::DEFAULT_PORT)),
            max_connections: 1000,
            handle_timeout: Duration::ZERO,
            accepted_codecs: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_accepted_codecs<I, S>(mut self, codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted_codecs = codecs.into_iter().map(Into::into).collect();
        self
    }

    /// Returns whether the handshake may select `codec_type`.
    pub fn accepts(&self, codec_type: &str) -> bool {
        self.accepted_codecs.is_empty() || self.accepted_codecs.iter().any(|c| c == codec_type)
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Error text for a call that did not finish within the handling timeout.
pub fn handle_timeout_error(timeout: Duration) -> String {
    format!("rpc server: request handle timeout: expect within {:?}", timeout)
}

/// Error text for a call that finished but could not be answered in time.
pub fn sent_timeout_error(timeout: Duration) -> String {
    format!(
        "rpc server: called successfully but sent timeout: expect within {:?}",
        timeout
    )
}

type SharedWriter<W> = Arc<Mutex<FrameWriter<W>>>;

struct Shared {
    config: ServerConfig,
    registry: Registry,
    codecs: RwLock<CodecRegistry>,
    stats: ServerStats,
}

/// RPC server.
pub struct Server {
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server with the default codecs.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Registry::new(),
                codecs: RwLock::new(CodecRegistry::default()),
                stats: ServerStats::default(),
            }),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Publishes a service.
    pub fn register(&self, service: Service) -> Result<(), ServerError> {
        self.shared.registry.register(service)?;
        Ok(())
    }

    /// Adds a codec; takes effect for connections accepted afterwards.
    pub fn register_codec(&self, codec: Arc<dyn Codec>) {
        self.shared.codecs.write().register(codec);
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        self.accept(listener).await
    }

    /// Serves connections from `listener` until shutdown.
    pub async fn accept(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();
        let stats = &self.shared.stats;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if stats.connections_active.load(Ordering::Relaxed)
                                >= self.shared.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            // Configure TCP options for lower latency
                            tcp_stream.set_nodelay(true).ok();

                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                tracing::info!("Client connected: {}", addr);

                                let result = shared.clone().serve_conn(tcp_stream, addr.to_string()).await;
                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serves one connection over any duplex byte stream.
    ///
    /// Returns once the peer closes the stream (or it becomes undecodable)
    /// and every in-flight request has been answered.
    pub async fn serve_conn<S>(&self, stream: S, peer: impl Into<String>) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.shared.clone().serve_conn(stream, peer.into()).await
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }
}

impl Shared {
    async fn serve_conn<S>(self: Arc<Self>, stream: S, peer: String) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut buffered = BufReader::new(read_half);

        // The handshake has no error channel: reject by closing.
        let (options, codec) = match self.handshake(&mut buffered).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::warn!("[{}] Handshake rejected: {}", peer, e);
                let _ = write_half.shutdown().await;
                return Err(e);
            }
        };

        let timeout = if options.handle_timeout.is_zero() {
            self.config.handle_timeout
        } else {
            options.handle_timeout
        };
        tracing::debug!(
            "[{}] Negotiated codec={} handle_timeout={:?}",
            peer,
            codec.content_type(),
            timeout
        );

        let mut reader = FrameReader::new(buffered, codec.clone());
        let writer: SharedWriter<_> = Arc::new(Mutex::new(FrameWriter::new(write_half, codec)));
        let mut in_flight = JoinSet::new();

        let result = loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) if e.is_eof() => {
                    tracing::debug!("[{}] Connection closed by client", peer);
                    break Ok(());
                }
                Err(e) => {
                    tracing::debug!("[{}] Read header error: {}", peer, e);
                    break Err(e.into());
                }
            };

            self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("[{}] Request: {} (seq={})", peer, header.service_method, header.seq);

            // The body frame is consumed even when the method is unknown so
            // the stream stays aligned on the next header.
            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(e) => {
                    self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    let text = format!("rpc server: read body error: {}", e);
                    send_response(&writer, header.with_error(text), &Value::Null).await;
                    break Err(e.into());
                }
            };

            match self.prepare(&header.service_method, reader.codec().as_ref(), &body) {
                Ok(call) => {
                    in_flight.spawn(handle_request(writer.clone(), header, call, timeout));
                }
                Err(e) => {
                    self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("[{}] Rejected seq={}: {}", peer, header.seq, e);
                    let text = e.to_string();
                    send_response(&writer, header.with_error(text), &Value::Null).await;
                }
            }

            while in_flight.try_join_next().is_some() {}
        };

        while in_flight.join_next().await.is_some() {}
        writer.lock().await.close().await;
        tracing::debug!("[{}] Connection finished", peer);

        result
    }

    async fn handshake<R>(&self, reader: &mut R) -> Result<(Options, Arc<dyn Codec>), ServerError>
    where
        R: AsyncBufRead + Unpin,
    {
        let options = read_options(reader).await?;
        if options.magic_number != MAGIC_NUMBER {
            return Err(ProtocolError::InvalidMagicNumber(options.magic_number).into());
        }
        if !self.config.accepts(&options.codec_type) {
            return Err(ServerError::CodecNotAccepted(options.codec_type));
        }
        let codec = self.codecs.read().resolve(&options.codec_type)?;
        Ok((options, codec))
    }

    fn prepare(
        &self,
        service_method: &str,
        codec: &dyn Codec,
        body: &[u8],
    ) -> Result<PreparedCall, ServerError> {
        let (_, method) = self.registry.lookup(service_method)?;
        let arg = codec.decode(body)?;
        Ok(method.prepare(arg)?)
    }
}

async fn send_response<W>(writer: &SharedWriter<W>, header: Header, body: &Value)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_value(&header, body).await {
        tracing::warn!("rpc server: write response error: {}", e);
    }
}

/// Runs one call and sends exactly one response for it.
///
/// With a non-zero timeout the deadline races the call; on a tie the
/// deadline wins. `claimed` decides which side writes: the worker claims it
/// only while holding the write lock, the timeout path claims it before
/// taking the lock, so a late result is dropped instead of sent twice.
async fn handle_request<W>(writer: SharedWriter<W>, header: Header, call: PreparedCall, timeout: Duration)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (called_tx, called_rx) = oneshot::channel::<()>();
    let (sent_tx, sent_rx) = oneshot::channel::<()>();
    let claimed = Arc::new(AtomicBool::new(false));

    let worker = {
        let writer = writer.clone();
        let claimed = claimed.clone();
        let mut header = header.clone();
        tokio::spawn(async move {
            let body = match tokio::task::spawn_blocking(move || call.invoke()).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    header.error = e.to_string();
                    Value::Null
                }
                Err(e) => {
                    header.error = format!("rpc server: method panicked: {}", e);
                    Value::Null
                }
            };
            let _ = called_tx.send(());

            let mut writer = writer.lock().await;
            if claimed.swap(true, Ordering::SeqCst) {
                tracing::debug!("Dropping late response for seq={}", header.seq);
                return;
            }
            if let Err(e) = writer.write_value(&header, &body).await {
                tracing::warn!("rpc server: write response error: {}", e);
            }
            drop(writer);
            let _ = sent_tx.send(());
        })
    };

    if timeout.is_zero() {
        join_worker(worker).await;
        return;
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    tokio::select! {
        biased;
        _ = &mut deadline => {
            respond_timeout(&writer, header, &claimed, handle_timeout_error(timeout)).await;
        }
        _ = called_rx => {
            tokio::select! {
                biased;
                _ = &mut deadline => {
                    respond_timeout(&writer, header, &claimed, sent_timeout_error(timeout)).await;
                }
                _ = sent_rx => {}
            }
        }
    }
}

/// Waits for a request task, logging it if the task died. Returns whether
/// it ran to completion.
async fn join_worker(worker: JoinHandle<()>) -> bool {
    match worker.await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("rpc server: request task failed: {}", e);
            false
        }
    }
}

async fn respond_timeout<W>(writer: &SharedWriter<W>, header: Header, claimed: &AtomicBool, text: String)
where
    W: AsyncWrite + Unpin,
{
    if claimed.swap(true, Ordering::SeqCst) {
        // The worker already holds the lock and is writing the real result.
        return;
    }
    tracing::debug!("seq={}: {}", header.seq, text);
    send_response(writer, header.with_error(text), &Value::Null).await;
}
