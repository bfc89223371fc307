//! Connection pooling with reserve/return semantics.
//!
//! The pool hands out exclusive reservations: a [`PooledConnection`] is a
//! move-only guard, and the connection it wraps is never shared for writes.
//! Dropping the guard returns the connection to the idle set, or closes it
//! when it was poisoned by an I/O failure. The cap is enforced with a
//! semaphore; `reserve` blocks up to a deadline when every slot is taken.

use super::connection::Connection;
use super::server::ReplyRouter;
use crate::error::{Error, Result};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    addr: String,
    nodelay: bool,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    router: Arc<ReplyRouter>,
    next_id: AtomicUsize,
}

impl ConnectionPool {
    pub(crate) fn new(
        addr: String,
        cap: usize,
        nodelay: bool,
        router: Arc<ReplyRouter>,
    ) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                addr,
                nodelay,
                semaphore: Arc::new(Semaphore::new(cap)),
                idle: Mutex::new(Vec::new()),
                router,
                next_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Reserve a connection: reuse an idle one or dial a new one up to the
    /// cap. Blocks until a slot frees up or the deadline expires.
    pub(crate) async fn reserve(&self, deadline: Duration) -> Result<PooledConnection> {
        let permit =
            match tokio::time::timeout(deadline, self.inner.semaphore.clone().acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(Error::NotYetConnected),
                Err(_) => return Err(Error::Timeout),
            };

        loop {
            let idle = self.inner.idle.lock().unwrap().pop();
            match idle {
                Some(connection) if connection.is_poisoned() => {
                    tracing::debug!(
                        connection = connection.id(),
                        "discarding broken idle connection"
                    );
                }
                Some(connection) => {
                    return Ok(PooledConnection {
                        connection: Some(connection),
                        pool: self.clone(),
                        _permit: permit,
                    });
                }
                None => break,
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let connection =
            Connection::open(&self.inner.addr, id, self.inner.nodelay, self.inner.router.clone())
                .await
                .map_err(Error::Io)?;
        Ok(PooledConnection {
            connection: Some(connection),
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Close every idle connection. Reservations still out return their
    /// connections to an empty pool as usual.
    pub(crate) fn clear(&self) {
        self.inner.idle.lock().unwrap().clear();
    }
}

/// Exclusive lease on one connection, valid until dropped.
pub struct PooledConnection {
    connection: Option<Connection>,
    pool: ConnectionPool,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection.as_ref().expect("reservation already returned")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection.as_mut().expect("reservation already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if connection.is_poisoned() {
                tracing::warn!(connection = connection.id(), "closing poisoned connection");
                return;
            }
            if let Ok(mut idle) = self.pool.inner.idle.lock() {
                idle.push(connection);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    fn test_pool(addr: String, cap: usize) -> ConnectionPool {
        ConnectionPool::new(addr, cap, true, Arc::new(ReplyRouter::new()))
    }

    #[tokio::test]
    async fn test_reserve_reuses_returned_connection() {
        let (_listener, addr) = listener().await;
        let pool = test_pool(addr, 2);

        let first = pool.reserve(Duration::from_secs(1)).await.unwrap();
        let id = first.id();
        drop(first);

        let second = pool.reserve(Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.id(), id);
    }

    #[tokio::test]
    async fn test_reserve_blocks_at_cap() {
        let (_listener, addr) = listener().await;
        let pool = test_pool(addr, 1);

        let held = pool.reserve(Duration::from_secs(1)).await.unwrap();
        let denied = pool.reserve(Duration::from_millis(50)).await;
        assert!(matches!(denied, Err(Error::Timeout)));

        drop(held);
        assert!(pool.reserve(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_poisoned_connection_is_discarded() {
        let (_listener, addr) = listener().await;
        let pool = test_pool(addr, 1);

        let mut held = pool.reserve(Duration::from_secs(1)).await.unwrap();
        let poisoned_id = held.id();
        held.connection.as_mut().unwrap().poison_for_test();
        drop(held);

        assert!(pool.inner.idle.lock().unwrap().is_empty());
        let fresh = pool.reserve(Duration::from_secs(1)).await.unwrap();
        assert_ne!(fresh.id(), poisoned_id);
    }
}
