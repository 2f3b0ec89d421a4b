//! Connection pools for the upstream servers.
//!
//! A [`Pool`] keeps a bounded queue of idle TCP connections to one upstream
//! address. Checked-out connections are represented by [`PooledConn`], which
//! carries a handle to its owning pool and returns itself to that pool when
//! dropped. Capacity is enforced on return: `get` will open past capacity
//! rather than block, and the surplus is closed when it comes back.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout};
use tracing::{debug, trace};

use crate::error::{Error, Result};

mod manager;

pub use manager::PoolManager;

const REAP_INTERVAL: Duration = Duration::from_secs(30);
const LIVENESS_DEADLINE: Duration = Duration::from_millis(1);

/// A pool of connections to a single upstream address.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    address: String,
    idle_timeout: Duration,
    idle: ArrayQueue<IdleConn>,
    /// Open connections, idle and checked out together.
    size: AtomicU32,
    closed: AtomicBool,
}

struct IdleConn {
    stream: TcpStream,
    last_used: Instant,
}

impl Pool {
    /// Open a pool and pre-warm it with `capacity / 2` connections,
    /// best-effort. The idle reaper task is spawned here and lives until the
    /// pool is closed.
    pub async fn new(address: impl Into<String>, capacity: usize, idle_timeout: Duration) -> Pool {
        let shared = Arc::new(PoolShared {
            address: address.into(),
            idle_timeout,
            idle: ArrayQueue::new(capacity.max(1)),
            size: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });

        for _ in 0..capacity / 2 {
            match shared.connect().await {
                Ok(stream) => shared.park(stream),
                Err(err) => {
                    debug!(address = %shared.address, %err, "pool warm-up connection failed");
                }
            }
        }

        tokio::spawn(reap_idle(Arc::clone(&shared)));

        Pool { shared }
    }

    /// Check out a connection.
    ///
    /// An idle connection is probed for liveness first; a dead one is
    /// replaced by a fresh dial, at most once. With nothing idle, a fresh
    /// connection is opened even past capacity.
    pub async fn get(&self) -> Result<PooledConn> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        if let Some(idle) = self.shared.idle.pop() {
            if is_alive(&idle.stream).await {
                return Ok(PooledConn::new(idle.stream, &self.shared));
            }
            self.shared.size.fetch_sub(1, Ordering::AcqRel);
            trace!(address = %self.shared.address, "replacing dead idle connection");
        }

        let stream = self.shared.connect().await?;
        Ok(PooledConn::new(stream, &self.shared))
    }

    /// Close every idle connection and refuse further hand-outs. Checked-out
    /// connections are closed as they come back; the reaper exits on its
    /// next tick.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        while let Some(idle) = self.shared.idle.pop() {
            self.shared.size.fetch_sub(1, Ordering::AcqRel);
            drop(idle);
        }
    }

    /// Open connections, idle and checked out together.
    pub fn size(&self) -> u32 {
        self.shared.size.load(Ordering::Acquire)
    }

    /// Connections currently parked in the queue.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.len()
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Whether `other` is a handle to this same pool.
    pub fn same_pool(&self, conn: &PooledConn) -> bool {
        Arc::ptr_eq(&self.shared, &conn.pool)
    }
}

impl PoolShared {
    async fn connect(&self) -> Result<TcpStream> {
        let unreachable = |source| Error::UpstreamUnreachable {
            address: self.address.clone(),
            source,
        };

        let stream = TcpStream::connect(&self.address).await.map_err(unreachable)?;
        stream.set_nodelay(true).map_err(unreachable)?;

        self.size.fetch_add(1, Ordering::AcqRel);
        Ok(stream)
    }

    /// Return a stream to the idle queue; close it when the pool is full or
    /// shut down.
    fn park(&self, stream: TcpStream) {
        if self.closed.load(Ordering::Acquire) {
            self.size.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        let idle = IdleConn {
            stream,
            last_used: Instant::now(),
        };
        if self.idle.push(idle).is_err() {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A connection checked out from a [`Pool`].
///
/// Returned to the pool it came from on drop; [`PooledConn::close`] discards
/// it instead.
pub struct PooledConn {
    stream: Option<TcpStream>,
    pool: Arc<PoolShared>,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}

const DEREF_ERR: &str = "(bug) connection already released to pool";

impl PooledConn {
    fn new(stream: TcpStream, pool: &Arc<PoolShared>) -> PooledConn {
        PooledConn {
            stream: Some(stream),
            pool: Arc::clone(pool),
        }
    }

    /// Discard the connection without returning it to the pool. Used when
    /// the connection failed or was left in an unknown protocol state.
    pub fn close(mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.size.fetch_sub(1, Ordering::AcqRel);
            drop(stream);
        }
    }
}

impl Deref for PooledConn {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        self.stream.as_ref().expect(DEREF_ERR)
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect(DEREF_ERR)
    }
}

/// Returns the connection to the pool it was checked out from.
impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.park(stream);
        }
    }
}

/// Cheap "is the socket still open" probe.
///
/// A peek that sees nothing within the deadline means the socket is simply
/// quiet; EOF or an error means the peer is gone. This cannot catch a peer
/// that dropped without a trace, only an already-observable close.
async fn is_alive(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match timeout(LIVENESS_DEADLINE, stream.peek(&mut buf)).await {
        Err(_elapsed) => true,
        Ok(Ok(0)) => false,
        Ok(Ok(_)) => true,
        Ok(Err(_)) => false,
    }
}

async fn reap_idle(shared: Arc<PoolShared>) {
    let mut tick = interval(REAP_INTERVAL);
    loop {
        tick.tick().await;
        if shared.closed.load(Ordering::Acquire) {
            return;
        }

        // One pass over the connections idle right now; anything checked out
        // is untouched.
        for _ in 0..shared.idle.len() {
            let Some(idle) = shared.idle.pop() else {
                break;
            };
            if idle.last_used.elapsed() > shared.idle_timeout {
                shared.size.fetch_sub(1, Ordering::AcqRel);
                trace!(address = %shared.address, "reaped idle connection");
            } else if shared.idle.push(idle).is_err() {
                shared.size.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Accepts connections and holds them open, reporting each accept.
    async fn upstream() -> (String, Arc<AtomicUsize>, mpsc::UnboundedSender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (close_tx, mut close_rx) = mpsc::unbounded_channel::<()>();

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { return };
                        counter.fetch_add(1, Ordering::SeqCst);
                        held.push(stream);
                    }
                    closed = close_rx.recv() => {
                        if closed.is_none() {
                            return;
                        }
                        // Drop the server half of every held connection.
                        held.clear();
                    }
                }
            }
        });

        (address, accepted, close_tx)
    }

    #[tokio::test]
    async fn get_reuses_a_returned_connection() {
        let (address, accepted, _close) = upstream().await;
        let pool = Pool::new(address, 4, Duration::from_secs(60)).await;
        assert_eq!(pool.size(), 2); // warm-up

        let conn = pool.get().await.unwrap();
        drop(conn);
        let conn = pool.get().await.unwrap();
        drop(conn);

        // Let the accept task observe both warm-up dials.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn dead_idle_connection_is_replaced() {
        let (address, accepted, close) = upstream().await;
        let pool = Pool::new(address, 2, Duration::from_secs(60)).await;
        assert_eq!(pool.idle_count(), 1);

        // Kill the server half of the warmed-up connection and give the FIN
        // a moment to arrive.
        close.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut conn = pool.get().await.unwrap();
        conn.write_all(b"ping").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn return_past_capacity_closes_the_surplus() {
        let (address, _accepted, _close) = upstream().await;
        let pool = Pool::new(address, 1, Duration::from_secs(60)).await;

        let first = pool.get().await.unwrap();
        let second = pool.get().await.unwrap();
        assert_eq!(pool.size(), 2);

        drop(first);
        assert_eq!(pool.idle_count(), 1);

        drop(second);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn closed_pool_refuses_hand_outs() {
        let (address, _accepted, _close) = upstream().await;
        let pool = Pool::new(address, 2, Duration::from_secs(60)).await;

        pool.close();
        assert_eq!(pool.size(), 0);
        assert!(matches!(pool.get().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn return_after_close_discards_the_connection() {
        let (address, _accepted, _close) = upstream().await;
        let pool = Pool::new(address, 2, Duration::from_secs(60)).await;

        let conn = pool.get().await.unwrap();
        pool.close();
        drop(conn);

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn unreachable_upstream_fails_get() {
        // Nothing listens on port 1; warm-up failures are silent.
        let pool = Pool::new("127.0.0.1:1", 4, Duration::from_secs(60)).await;
        assert_eq!(pool.size(), 0);

        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, Error::UpstreamUnreachable { .. }));
    }

    #[tokio::test]
    async fn explicit_close_does_not_return_to_pool() {
        let (address, _accepted, _close) = upstream().await;
        let pool = Pool::new(address, 2, Duration::from_secs(60)).await;

        let conn = pool.get().await.unwrap();
        let open = pool.size();
        conn.close();

        assert_eq!(pool.size(), open - 1);
        assert_eq!(pool.idle_count(), 0);
    }
}
