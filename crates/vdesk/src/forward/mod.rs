//! Bidirectional TCP relay.
//!
//! One listener per [`ForwardRule`]. Every accepted client gets its own
//! upstream connection and its own task; bytes are copied verbatim in both
//! directions until either side finishes, at which point both sockets close.

use crate::config::ForwardConfig;
use crate::error::{Error, Result};
use crate::model::{ConnectionId, ForwardRule};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Size of each relayed read.
pub const CHUNK_SIZE: usize = 4096;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bound listeners plus the rules they serve.
#[derive(Debug)]
pub struct PortForwarder {
    listeners: Vec<(Arc<ForwardRule>, TcpListener)>,
    connect_timeout: Duration,
}

impl PortForwarder {
    /// Bind one listener per rule.
    ///
    /// A rule whose port cannot be bound is logged and skipped; the call
    /// fails only when nothing could be bound at all.
    pub async fn bind(config: &ForwardConfig) -> Result<Self> {
        let mut listeners = Vec::with_capacity(config.rules.len());
        let mut last_error = None;
        for rule in &config.rules {
            let addr = format!("{}:{}", config.listen_host, rule.local_port);
            match TcpListener::bind(&addr).await {
                Ok(listener) => listeners.push((Arc::new(rule.clone()), listener)),
                Err(err) => {
                    error!(%addr, rule = %rule, error = %err, "failed to bind forward port");
                    last_error = Some(Error::bind(&addr, err));
                }
            }
        }
        if listeners.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| Error::config("no forward rules configured", None)));
        }
        Ok(Self {
            listeners,
            connect_timeout: config.connect_timeout,
        })
    }

    /// Actual bound addresses, in rule order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(_, listener)| listener.local_addr().ok())
            .collect()
    }

    /// Run every accept loop until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut loops = JoinSet::new();
        for (rule, listener) in self.listeners {
            loops.spawn(accept_loop(rule, listener, self.connect_timeout));
        }
        tokio::pin!(shutdown);
        tokio::select! {
            () = &mut shutdown => debug!("forwarder shutting down"),
            Some(joined) = loops.join_next() => {
                if let Err(err) = joined {
                    warn!(error = %err, "accept loop ended unexpectedly");
                }
            }
        }
        loops.shutdown().await;
        Ok(())
    }
}

async fn accept_loop(rule: Arc<ForwardRule>, listener: TcpListener, connect_timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                let rule = Arc::clone(&rule);
                tokio::spawn(async move {
                    let id = ConnectionId::new();
                    debug!(connection = %id, %peer, rule = %rule, "client accepted");
                    match RelayConnection::open(id, client, &rule, connect_timeout).await {
                        Ok(relay) => {
                            let stats = relay.run().await;
                            debug!(
                                connection = %id,
                                to_upstream = stats.to_upstream,
                                to_client = stats.to_client,
                                "relay closed"
                            );
                        }
                        Err(err) => debug!(connection = %id, error = %err, "upstream unavailable"),
                    }
                });
            }
            Err(err) => {
                debug!(rule = %rule, error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Byte counts for one finished relay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_upstream: u64,
    pub to_client: u64,
}

/// A client paired with its upstream connection.
#[derive(Debug)]
pub struct RelayConnection {
    id: ConnectionId,
    client: TcpStream,
    upstream: TcpStream,
}

impl RelayConnection {
    /// Connect upstream for `client`. On failure `client` is dropped, which
    /// closes it.
    pub async fn open(
        id: ConnectionId,
        client: TcpStream,
        rule: &ForwardRule,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let target = rule.upstream();
        let connect = tokio::time::timeout(connect_timeout, TcpStream::connect(&target));
        let upstream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(Error::io(format!("failed to connect to {target}"), err));
            }
            Err(_) => {
                return Err(Error::timeout(
                    format!("connect to {target} timed out"),
                    serde_json::json!({
                        "timeout_ms": crate::process::duration_ms(connect_timeout)
                    }),
                ));
            }
        };
        for (side, stream) in [("client", &client), ("upstream", &upstream)] {
            if let Err(err) = stream.set_nodelay(true) {
                debug!(connection = %id, side, error = %err, "failed to set TCP_NODELAY");
            }
        }
        Ok(Self {
            id,
            client,
            upstream,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Copy both directions until one finishes, then close both sockets.
    pub async fn run(self) -> RelayStats {
        let (mut client_read, mut client_write) = self.client.into_split();
        let (mut upstream_read, mut upstream_write) = self.upstream.into_split();
        let mut stats = RelayStats::default();

        tokio::select! {
            outcome = pump(&mut client_read, &mut upstream_write, &mut stats.to_upstream) => {
                if let Err(err) = outcome {
                    debug!(connection = %self.id, error = %err, "client side ended");
                }
            }
            outcome = pump(&mut upstream_read, &mut client_write, &mut stats.to_client) => {
                if let Err(err) = outcome {
                    debug!(connection = %self.id, error = %err, "upstream side ended");
                }
            }
        }
        // Both sockets close here even if only one direction finished.
        if let Err(err) = client_write.shutdown().await {
            debug!(connection = %self.id, error = %err, "client shutdown failed");
        }
        if let Err(err) = upstream_write.shutdown().await {
            debug!(connection = %self.id, error = %err, "upstream shutdown failed");
        }
        stats
    }
}

/// Copy `reader` to `writer` in fixed chunks until EOF.
pub async fn pump<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buf).await?;
        let Some(chunk) = buf.get(..read).filter(|chunk| !chunk.is_empty()) else {
            return Ok(());
        };
        writer.write_all(chunk).await?;
        *copied += chunk.len() as u64;
    }
}
