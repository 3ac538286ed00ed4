//! SSH transport adapter.
//!
//! Start dials the server, exchanges SSH identification strings and then binds
//! the local proxy listener. The accept loop runs on its own task until the
//! adapter is stopped or the session scope is cancelled.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{TransportKind, TunnelConfig};
use crate::probe::LatencyProbe;
use crate::tunnel::adapter::ProtocolAdapter;
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::types::AdapterStats;

const CLIENT_IDENT: &str = concat!("SSH-2.0-meshrelay_", env!("CARGO_PKG_VERSION"), "\r\n");
const MAX_IDENT_LINE: usize = 255;
const MAX_PREAMBLE_LINES: usize = 16;

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connections: AtomicU64,
}

struct Session {
    control: TcpStream,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

pub struct SshAdapter {
    config: TunnelConfig,
    probe: LatencyProbe,
    session: Mutex<Option<Session>>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    counters: Arc<Counters>,
}

impl SshAdapter {
    pub fn new(config: TunnelConfig, probe: LatencyProbe) -> Self {
        SshAdapter {
            config,
            probe,
            session: Mutex::new(None),
            local_addr: std::sync::Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    fn connect_failure(&self, reason: impl Into<String>) -> TunnelError {
        TunnelError::ConnectFailure {
            target: self.config.address(),
            reason: reason.into(),
        }
    }

    async fn dial(&self) -> TunnelResult<TcpStream> {
        let address = self.config.address();
        match tokio::time::timeout(self.config.timeout(), TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(self.connect_failure(e.to_string())),
            Err(_) => Err(self.connect_failure(format!(
                "timed out after {:?}",
                self.config.timeout()
            ))),
        }
    }

    /// Sends our identification and returns the server's.
    async fn exchange_identification(&self, stream: &mut TcpStream) -> TunnelResult<String> {
        stream.write_all(CLIENT_IDENT.as_bytes()).await?;
        self.counters
            .bytes_sent
            .fetch_add(CLIENT_IDENT.len() as u64, Ordering::Relaxed);

        let read = async {
            // Servers may send other lines before the identification string.
            for _ in 0..MAX_PREAMBLE_LINES {
                let line = read_line(stream).await?;
                self.counters
                    .bytes_received
                    .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
                if line.starts_with("SSH-") {
                    return Ok(line);
                }
            }
            Err(self.connect_failure("no SSH identification from server"))
        };

        let ident = tokio::time::timeout(self.config.timeout(), read)
            .await
            .map_err(|_| self.connect_failure("timed out waiting for server identification"))??;

        if !(ident.starts_with("SSH-2.0-") || ident.starts_with("SSH-1.99-")) {
            return Err(self.connect_failure(format!("unsupported protocol version: {ident}")));
        }
        Ok(ident)
    }
}

async fn read_line(stream: &mut TcpStream) -> TunnelResult<String> {
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_IDENT_LINE {
            return Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "identification line too long",
            )));
        }
        line.push(byte);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

async fn accept_loop(
    listener: TcpListener,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    tunnel: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    counters.connections.fetch_add(1, Ordering::Relaxed);
                    debug!(tunnel = %tunnel, %peer, "Accepted local proxy client");
                    drop(socket);
                }
                Err(e) => {
                    warn!(tunnel = %tunnel, error = %e, "Local proxy accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!(tunnel = %tunnel, "Local proxy listener closed");
}

#[async_trait]
impl ProtocolAdapter for SshAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Ssh
    }

    #[instrument(skip(self, scope), fields(tunnel = %self.config.name))]
    async fn start(&self, scope: CancellationToken) -> TunnelResult<()> {
        if self.session.lock().await.is_some() {
            return Ok(());
        }
        if !self.config.has_credentials() {
            return Err(self.connect_failure("no password or key configured"));
        }

        // The session lock is not held while dialing so stop never waits on a handshake.
        let handshake = async {
            let mut control = self.dial().await?;
            let server_ident = self.exchange_identification(&mut control).await?;
            debug!(server = %server_ident, "SSH identification exchanged");
            let listener = TcpListener::bind(("127.0.0.1", self.config.local_port)).await?;
            Ok::<_, TunnelError>((control, listener))
        };
        let (mut control, listener) = tokio::select! {
            _ = scope.cancelled() => {
                return Err(self.connect_failure("cancelled while connecting"));
            }
            result = handshake => result?,
        };
        let local_addr = listener.local_addr()?;

        let mut session = self.session.lock().await;
        if session.is_some() || scope.is_cancelled() {
            debug!(%local_addr, "Dropping handshake that finished after stop");
            drop(listener);
            let _ = control.shutdown().await;
            return if session.is_some() {
                Ok(())
            } else {
                Err(self.connect_failure("cancelled while connecting"))
            };
        }

        let cancel = scope.child_token();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            cancel.clone(),
            Arc::clone(&self.counters),
            self.config.name.clone(),
        ));

        if let Ok(mut addr) = self.local_addr.lock() {
            *addr = Some(local_addr);
        }
        *session = Some(Session {
            control,
            local_addr,
            cancel,
            accept_task,
        });
        info!(%local_addr, proxy = ?self.config.proxy, "SSH tunnel established");
        Ok(())
    }

    async fn stop(&self) -> TunnelResult<()> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };
        if let Ok(mut addr) = self.local_addr.lock() {
            *addr = None;
        }

        session.cancel.cancel();
        if let Err(e) = session.accept_task.await {
            warn!(tunnel = %self.config.name, error = %e, "Accept task ended abnormally");
        }
        debug!(
            tunnel = %self.config.name,
            local_addr = %session.local_addr,
            "Released local proxy port"
        );
        session.control.shutdown().await?;
        Ok(())
    }

    fn status(&self) -> AdapterStats {
        AdapterStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            connections: self.counters.connections.load(Ordering::Relaxed),
            local_addr: self.local_addr.lock().ok().and_then(|a| *a),
        }
    }

    async fn probe(&self) -> TunnelResult<Duration> {
        Ok(self
            .probe
            .measure(&self.config.host, self.config.port_or_default())
            .await?)
    }
}
