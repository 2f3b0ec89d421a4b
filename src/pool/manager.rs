//! Pool selection across the primary and the replica set.

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::pool::{Pool, PooledConn};

/// Owns the primary pool and the ordered replica pools.
///
/// Replica checkout is round-robin; the cursor is advanced under a
/// short-held lock, before any I/O, so a failing replica still yields its
/// turn to the next one.
pub struct PoolManager {
    primary: Pool,
    replicas: Vec<Pool>,
    cursor: Mutex<usize>,
}

impl PoolManager {
    pub async fn new(
        primary_addr: &str,
        replica_addrs: &[String],
        primary_size: usize,
        replica_size: usize,
        idle_timeout: Duration,
    ) -> PoolManager {
        let primary = Pool::new(primary_addr, primary_size, idle_timeout).await;

        let mut replicas = Vec::with_capacity(replica_addrs.len());
        for addr in replica_addrs {
            replicas.push(Pool::new(addr.clone(), replica_size, idle_timeout).await);
        }

        PoolManager {
            primary,
            replicas,
            cursor: Mutex::new(0),
        }
    }

    /// A read/write connection from the primary pool.
    pub async fn get_rw(&self) -> Result<PooledConn> {
        self.primary.get().await
    }

    /// A read-only connection from the next replica in rotation.
    ///
    /// With no replicas configured this transparently falls back to the
    /// primary; the connection still knows which pool to return to.
    pub async fn get_ro(&self) -> Result<PooledConn> {
        if self.replicas.is_empty() {
            return self.primary.get().await;
        }

        let pool = {
            let mut cursor = self.cursor.lock();
            let index = *cursor;
            *cursor = (index + 1) % self.replicas.len();
            &self.replicas[index]
        };

        pool.get().await
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn primary(&self) -> &Pool {
        &self.primary
    }

    pub fn replicas(&self) -> &[Pool] {
        &self.replicas
    }

    /// Shut down every pool.
    pub fn close(&self) {
        self.primary.close();
        for replica in &self.replicas {
            replica.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    /// Accepts and holds connections open.
    async fn upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        address
    }

    #[tokio::test]
    async fn round_robin_visits_every_replica() {
        let primary = upstream().await;
        let replicas = vec![upstream().await, upstream().await, upstream().await];
        let manager = PoolManager::new(&primary, &replicas, 1, 1, Duration::from_secs(60)).await;

        // Hold all the checkouts so every call dials its own replica.
        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(manager.get_ro().await.unwrap());
        }

        for (i, conn) in held.iter().enumerate() {
            let pool = &manager.replicas()[i % replicas.len()];
            assert!(pool.same_pool(conn), "checkout {i} came from the wrong replica");
        }
    }

    #[tokio::test]
    async fn zero_replicas_falls_back_to_primary() {
        let primary = upstream().await;
        let manager = PoolManager::new(&primary, &[], 2, 2, Duration::from_secs(60)).await;

        let conn = manager.get_ro().await.unwrap();
        assert!(manager.primary().same_pool(&conn));

        // Returning it lands in the primary pool, not anywhere else.
        let idle_before = manager.primary().idle_count();
        drop(conn);
        assert_eq!(manager.primary().idle_count(), idle_before + 1);
    }

    #[tokio::test]
    async fn cursor_advances_past_a_failing_replica() {
        let primary = upstream().await;
        // First replica address refuses connections.
        let replicas = vec!["127.0.0.1:1".to_string(), upstream().await];
        let manager = PoolManager::new(&primary, &replicas, 1, 1, Duration::from_secs(60)).await;

        assert!(manager.get_ro().await.is_err());
        // The dead replica consumed its turn; the live one serves the next call.
        let conn = manager.get_ro().await.unwrap();
        assert!(manager.replicas()[1].same_pool(&conn));
    }

    #[tokio::test]
    async fn rw_comes_from_the_primary() {
        let primary = upstream().await;
        let replicas = vec![upstream().await];
        let manager = PoolManager::new(&primary, &replicas, 2, 2, Duration::from_secs(60)).await;

        let conn = manager.get_rw().await.unwrap();
        assert!(manager.primary().same_pool(&conn));
    }
}
