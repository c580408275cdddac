//! Minimal TCP health endpoint for liveness and readiness probes.
//!
//! Every accepted connection runs all checks and gets a bare HTTP/1.1
//! response: `200 OK` when every check passes, otherwise
//! `503 Service Unavailable` with the first failure as the body. There is no
//! routing; any path works.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::StoreHandle;

/// Port the health endpoint listens on unless told otherwise.
pub const DEFAULT_HEALTH_PORT: u16 = 9999;

const CHECK_TIMEOUT: Duration = Duration::from_secs(2);
const IO_TIMEOUT: Duration = Duration::from_millis(100);
const RESPONSE_OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Errors from the health endpoint.
#[derive(Debug, Error)]
pub enum HealthError {
    /// The listen address could not be bound.
    #[error("Failed to bind health endpoint on {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The listener failed.
    #[error("Health endpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One readiness condition.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Returns an error describing why the process is not healthy.
    async fn check(&self) -> anyhow::Result<()>;

    /// Name used in logs and failure bodies.
    fn name(&self) -> &str;
}

#[async_trait]
impl HealthCheck for StoreHandle {
    async fn check(&self) -> anyhow::Result<()> {
        self.ping().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "store"
    }
}

/// Adapts a closure returning a future into a [`HealthCheck`].
pub struct FnCheck<F> {
    name: String,
    check: F,
}

impl<F> FnCheck<F> {
    /// Wraps `check` under `name`.
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

#[async_trait]
impl<F, Fut> HealthCheck for FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn check(&self) -> anyhow::Result<()> {
        (self.check)().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Binds `addr` and serves health probes until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns `HealthError::Bind` when the address cannot be bound.
pub async fn serve(
    addr: SocketAddr,
    checks: Vec<Arc<dyn HealthCheck>>,
    shutdown: CancellationToken,
) -> Result<(), HealthError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| HealthError::Bind { addr, source })?;
    serve_listener(listener, checks, shutdown).await
}

/// Serves health probes on an already-bound listener.
pub async fn serve_listener(
    listener: TcpListener,
    checks: Vec<Arc<dyn HealthCheck>>,
    shutdown: CancellationToken,
) -> Result<(), HealthError> {
    let local = listener.local_addr()?;
    info!(addr = %local, checks = checks.len(), "Health endpoint started");
    let checks: Arc<[Arc<dyn HealthCheck>]> = checks.into();

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Health endpoint failed to accept");
                    continue;
                }
            },
        };

        let checks = Arc::clone(&checks);
        tokio::spawn(async move {
            if let Err(e) = respond(stream, &checks).await {
                debug!(peer = %peer, error = %e, "Health probe connection failed");
            }
        });
    }

    info!(addr = %local, "Health endpoint stopped");
    Ok(())
}

/// Runs every check and returns the first failure.
pub async fn run_checks(checks: &[Arc<dyn HealthCheck>]) -> Result<(), String> {
    for check in checks {
        let name = check.name().to_string();
        let task = {
            let check = Arc::clone(check);
            tokio::spawn(async move { check.check().await })
        };

        let failure = match tokio::time::timeout(CHECK_TIMEOUT, task).await {
            Ok(Ok(Ok(()))) => continue,
            Ok(Ok(Err(e))) => format!("{}: {:#}", name, e),
            Ok(Err(e)) if e.is_panic() => format!("{}: panic during health check", name),
            Ok(Err(e)) => format!("{}: {}", name, e),
            Err(_) => format!("{}: timed out after {:?}", name, CHECK_TIMEOUT),
        };

        error!(check = %name, error = %failure, "Health check failed");
        return Err(failure);
    }
    Ok(())
}

async fn respond(mut stream: TcpStream, checks: &[Arc<dyn HealthCheck>]) -> std::io::Result<()> {
    // Drain the request line so closing the socket does not reset the peer.
    let mut request = [0u8; 1024];
    let _ = tokio::time::timeout(IO_TIMEOUT, stream.read(&mut request)).await;

    let response = match run_checks(checks).await {
        Ok(()) => RESPONSE_OK.to_vec(),
        Err(message) => format!(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            message.len(),
            message
        )
        .into_bytes(),
    };

    tokio::time::timeout(IO_TIMEOUT, stream.write_all(&response))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"))??;
    stream.shutdown().await
}
