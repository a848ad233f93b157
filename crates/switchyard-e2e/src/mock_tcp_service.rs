//! Mock TCP backend for E2E tests
//!
//! Echoes, greets, or silently records whatever a routed connection sends, so
//! tests can check both the payload and anything the router prepends to it.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Behavior of the mock backend
#[derive(Clone, Debug)]
pub enum TcpServiceMode {
    /// Write every received chunk back
    Echo,
    /// Send a greeting as soon as a connection opens, then echo
    Greeting(Vec<u8>),
    /// Read until EOF without answering
    Accumulate,
}

/// One finished connection as the backend saw it
#[derive(Clone, Debug)]
pub struct RecordedTcpConnection {
    pub received_data: Vec<u8>,
    pub peer_addr: SocketAddr,
}

pub struct MockTcpService {
    addr: SocketAddr,
    connections: Arc<RwLock<Vec<RecordedTcpConnection>>>,
    shutdown: CancellationToken,
}

impl MockTcpService {
    /// Echo backend on an ephemeral port
    pub async fn start() -> Self {
        Self::start_with_mode(TcpServiceMode::Echo).await
    }

    pub async fn start_with_mode(mode: TcpServiceMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock TCP service");
        let addr = listener.local_addr().unwrap();

        let connections: Arc<RwLock<Vec<RecordedTcpConnection>>> = Arc::new(RwLock::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let recorded = connections.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok((stream, peer_addr)) => {
                            let recorded = recorded.clone();
                            let mode = mode.clone();
                            tokio::spawn(handle_connection(stream, peer_addr, recorded, mode));
                        }
                        Err(e) => {
                            tracing::error!("Mock TCP accept error: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        Self {
            addr,
            connections,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn connections(&self) -> Vec<RecordedTcpConnection> {
        self.connections.read().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Stop accepting; the port is released once the accept task exits
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockTcpService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    connections: Arc<RwLock<Vec<RecordedTcpConnection>>>,
    mode: TcpServiceMode,
) {
    let mut received_data = Vec::new();
    let mut buf = [0u8; 4096];

    let echo = match &mode {
        TcpServiceMode::Echo => true,
        TcpServiceMode::Greeting(greeting) => {
            if stream.write_all(greeting).await.is_err() {
                return;
            }
            true
        }
        TcpServiceMode::Accumulate => false,
    };

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                received_data.extend_from_slice(&buf[..n]);
                if echo {
                    if let Err(e) = stream.write_all(&buf[..n]).await {
                        tracing::debug!("Mock TCP write error: {}", e);
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::debug!("Mock TCP read error: {}", e);
                break;
            }
        }
    }

    connections.write().push(RecordedTcpConnection {
        received_data,
        peer_addr,
    });
}
