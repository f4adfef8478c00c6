//! Remote worker agent for Artisan CI.
//!
//! The agent listens on TCP and serves a root worker to each client over the
//! length-prefixed JSON protocol in `artisan_core::protocol`. Each connection
//! has its own registry of commands and files; losing a connection only
//! drops that registry.

mod session;

use artisan_core::{Error, Result, Worker};
use artisan_worker::LocalWorker;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{info, warn};

use crate::session::Session;

/// Builds the root worker for a new connection.
pub type WorkerFactory = Arc<dyn Fn() -> Result<Arc<dyn Worker>> + Send + Sync>;

pub struct RemoteWorkerAgent {
    listener: TcpListener,
    worker_factory: WorkerFactory,
}

impl RemoteWorkerAgent {
    /// Bind to `address`. Connections are served by a fresh `LocalWorker`.
    pub async fn bind(address: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            worker_factory: Arc::new(|| Ok(Arc::new(LocalWorker::new()?) as Arc<dyn Worker>)),
        })
    }

    pub fn with_worker_factory(mut self, factory: WorkerFactory) -> Self {
        self.worker_factory = factory;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process is stopped.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes. Open connections are dropped then.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(address = %self.local_addr()?, "Agent listening");

        let mut connections: FuturesUnordered<BoxFuture<'static, (SocketAddr, Result<()>)>> =
            FuturesUnordered::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(open = connections.len(), "Agent shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => match (self.worker_factory)() {
                        Ok(worker) => {
                            info!(peer = %peer, "Client connected");
                            connections.push(serve(stream, peer, worker).boxed());
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Could not create worker"),
                    },
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                Some((peer, result)) = connections.next(), if !connections.is_empty() => {
                    match result {
                        Ok(()) => info!(peer = %peer, "Client disconnected"),
                        Err(e) => warn!(peer = %peer, error = %e, "Connection dropped"),
                    }
                }
            }
        }
        Ok(())
    }
}

async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    worker: Arc<dyn Worker>,
) -> (SocketAddr, Result<()>) {
    if let Err(e) = stream.set_nodelay(true) {
        return (peer, Err(Error::Io(e)));
    }
    (peer, Session::new(peer, worker).serve(stream).await)
}
