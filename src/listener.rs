//! TCP listener: accept loop, admission control, graceful shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pool::PoolManager;
use crate::session::Session;

pub struct Server {
    listener: TcpListener,
    config: ListenerConfig,
    pools: Arc<PoolManager>,
    metrics: Arc<Metrics>,
}

impl Server {
    /// Bind the configured listen address. Failure here is fatal at startup.
    pub async fn bind(
        config: ListenerConfig,
        pools: Arc<PoolManager>,
        metrics: Arc<Metrics>,
    ) -> Result<Server> {
        let address = config.listen_addr();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|err| Error::Config(format!("bind {address}: {err}")))?;
        info!(%address, "listener started");

        Ok(Server {
            listener,
            config,
            pools,
            metrics,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `shutdown` fires, then wait for the in-flight
    /// sessions to finish.
    ///
    /// Admission control: a semaphore permit is taken *before* accepting, so
    /// at most `max_connections` sessions run at once and the backlog waits
    /// in the kernel accept queue.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        let mut sessions = JoinSet::new();

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_closed) => break,
                },
                _ = shutdown.changed() => break,
            };

            let (stream, remote) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };
            let _ = stream.set_nodelay(true);
            debug!(%remote, "accepted client connection");

            let session = Session::new(
                stream,
                remote,
                Arc::clone(&self.pools),
                Arc::clone(&self.metrics),
                self.config.read_timeout,
                self.config.write_timeout,
            );
            let metrics = Arc::clone(&self.metrics);
            sessions.spawn(async move {
                metrics.client_connected();
                session.run().await;
                metrics.client_disconnected();
                drop(permit);
            });

            // Keep the set from accumulating finished sessions.
            while sessions.try_join_next().is_some() {}
        }

        info!("listener stopped accepting; draining sessions");
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}
