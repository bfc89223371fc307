//! One logical peer: request dispatch and reply demultiplexing.
//!
//! A [`Server`] owns the connection pool, the monotonic request-id counter,
//! the cached handshake data, and the reply router. Callers write requests on
//! reserved connections; every reader task posts decoded replies into the one
//! router, which pairs them with waiting callers by the response-to id.
//!
//! ```text
//! caller --reserve--> pool --write frame--> socket
//!                                             |
//! caller <--oneshot-- router <--deliver-- reader task
//! ```

use super::pool::{ConnectionPool, PooledConnection};
use super::protocol::{Message, Reply};
use crate::client::Database;
use crate::error::{Error, Result};
use bson::{doc, Bson};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Maximum pooled connections
    pub max_connections: usize,

    /// Deadline applied to replies and reservations when the caller gives none
    pub default_timeout: Duration,

    /// Disable Nagle's algorithm on new sockets
    pub nodelay: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            default_timeout: Duration::from_secs(60),
            nodelay: true,
        }
    }
}

type Callback = Box<dyn FnOnce(&Reply) + Send>;

/// Shared reply-routing state. One mutex guards the waiter map, the callback
/// map, and the orphan inbox; it is held only for constant-time bookkeeping.
pub(crate) struct ReplyRouter {
    state: Mutex<RouterState>,
}

struct RouterState {
    waiters: HashMap<i32, oneshot::Sender<Reply>>,
    callbacks: HashMap<i32, Callback>,
    orphans: Vec<(i32, Reply, Instant)>,
    largest_timeout: Duration,
}

impl ReplyRouter {
    pub(crate) fn new() -> ReplyRouter {
        ReplyRouter {
            state: Mutex::new(RouterState {
                waiters: HashMap::new(),
                callbacks: HashMap::new(),
                orphans: Vec::new(),
                largest_timeout: Duration::from_secs(60),
            }),
        }
    }

    /// Route one reply: wake the waiter registered under its response-to id,
    /// then run the callback, then park anything unclaimed in the orphan
    /// inbox. Runs on the reader task, so callbacks must not block.
    pub(crate) fn deliver(&self, reply: Reply) {
        let id = reply.response_to;
        let (waiter, callback) = {
            let mut state = self.state.lock().unwrap();
            (state.waiters.remove(&id), state.callbacks.remove(&id))
        };

        let callback_copy = callback.as_ref().map(|_| reply.clone());

        // waiter wakeup strictly precedes the callback
        let unclaimed = match waiter {
            Some(sender) => sender.send(reply).err(),
            None => Some(reply),
        };

        if let (Some(callback), Some(reply)) = (callback, callback_copy) {
            callback(&reply);
        }

        if let Some(reply) = unclaimed {
            let mut state = self.state.lock().unwrap();
            tracing::debug!(response_to = id, "no waiter for reply, parking it");
            state.orphans.push((id, reply, Instant::now()));
            let watermark = state.largest_timeout * 5;
            state.orphans.retain(|(_, _, arrived)| arrived.elapsed() < watermark);
        }
    }

    /// Wait for the reply to `id`, checking the orphan inbox first so a reply
    /// that raced ahead of us is picked up immediately.
    async fn await_reply(&self, id: i32, timeout: Duration) -> Result<Reply> {
        let receiver = {
            let mut state = self.state.lock().unwrap();
            if let Some(at) = state.orphans.iter().position(|(orphan, _, _)| *orphan == id) {
                let (_, reply, _) = state.orphans.remove(at);
                return Ok(reply);
            }
            if timeout > state.largest_timeout {
                state.largest_timeout = timeout;
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.insert(id, sender);
            receiver
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Inconsistency(
                "reply slot closed without a reply".into(),
            )),
            Err(_) => {
                self.state.lock().unwrap().waiters.remove(&id);
                Err(Error::Timeout)
            }
        }
    }

    fn set_callback(&self, id: i32, callback: Callback) {
        self.state.lock().unwrap().callbacks.insert(id, callback);
    }

    #[cfg(test)]
    fn orphan_count(&self) -> usize {
        self.state.lock().unwrap().orphans.len()
    }

    #[cfg(test)]
    fn set_largest_timeout(&self, timeout: Duration) {
        self.state.lock().unwrap().largest_timeout = timeout;
    }
}

struct ServerInner {
    host: String,
    port: u16,
    options: ServerOptions,
    last_request_id: AtomicI32,
    connected: AtomicBool,
    max_wire_version: AtomicI32,
    router: Arc<ReplyRouter>,
    pool: ConnectionPool,
}

/// Handle to one logical peer. Cheap to clone; every clone shares the pool,
/// the id counter, and the router.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(host: impl Into<String>, port: u16, options: ServerOptions) -> Server {
        let host = host.into();
        let router = Arc::new(ReplyRouter::new());
        let pool = ConnectionPool::new(
            format!("{host}:{port}"),
            options.max_connections,
            options.nodelay,
            router.clone(),
        );
        Server {
            inner: Arc::new(ServerInner {
                host,
                port,
                options,
                last_request_id: AtomicI32::new(-1),
                connected: AtomicBool::new(false),
                max_wire_version: AtomicI32::new(0),
                router,
                pool,
            }),
        }
    }

    /// Connect and run the handshake that discovers the peer's wire version.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }
        match self.handshake().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.connected.store(false, Ordering::SeqCst);
                self.inner.pool.clear();
                Err(err)
            }
        }
    }

    /// Close the pooled sockets. Reader tasks observe the close and exit;
    /// callers still waiting fail on their own deadlines.
    pub fn disconnect(&self) -> Result<()> {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Err(Error::NotYetConnected);
        }
        self.inner.pool.clear();
        tracing::info!(host = %self.inner.host, port = self.inner.port, "disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Wire version advertised by the peer, 0 until discovered.
    pub fn max_wire_version(&self) -> i32 {
        self.inner.max_wire_version.load(Ordering::Acquire)
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.options.default_timeout
    }

    /// Next request id. Strictly increasing, starting at 0.
    pub fn next_message_id(&self) -> i32 {
        self.inner.last_request_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Scope handle for one database namespace.
    pub fn db(&self, name: &str) -> Database {
        Database::new(self.clone(), name)
    }

    /// Reserve a connection for one logical request.
    pub async fn reserve(&self) -> Result<PooledConnection> {
        if !self.is_connected() {
            return Err(Error::NotYetConnected);
        }
        self.inner.pool.reserve(self.inner.options.default_timeout).await
    }

    /// Write one message on the reserved connection and return its request id.
    pub async fn send(&self, message: &Message, connection: &mut PooledConnection) -> Result<i32> {
        if !self.is_connected() {
            return Err(Error::NotYetConnected);
        }
        let frame = message.encode()?;
        connection.write_frame(&frame).await?;
        tracing::trace!(
            request_id = message.request_id(),
            op_code = message.op_code(),
            bytes = frame.len(),
            "request sent"
        );
        Ok(message.request_id())
    }

    /// Wait for the reply correlated to `request_id`, up to `timeout`.
    pub async fn await_response(&self, request_id: i32, timeout: Duration) -> Result<Reply> {
        self.inner.router.await_reply(request_id, timeout).await
    }

    /// `send` composed with `await_response`.
    pub async fn send_and_await(
        &self,
        message: &Message,
        connection: &mut PooledConnection,
        timeout: Duration,
    ) -> Result<Reply> {
        let request_id = self.send(message, connection).await?;
        self.await_response(request_id, timeout).await
    }

    /// Register a callback run on the reader when the reply to `request_id`
    /// arrives. Callbacks run after waiter wakeup and must not block.
    pub fn on_response(&self, request_id: i32, callback: impl FnOnce(&Reply) + Send + 'static) {
        self.inner.router.set_callback(request_id, Box::new(callback));
    }

    /// Best-effort cursor reaping; the peer sends no reply.
    pub(crate) async fn kill_cursors(&self, cursor_ids: &[i64]) -> Result<()> {
        let message = Message::KillCursors {
            request_id: self.next_message_id(),
            cursor_ids: cursor_ids.to_vec(),
        };
        let mut connection = self.reserve().await?;
        self.send(&message, &mut connection).await?;
        tracing::debug!(cursors = cursor_ids.len(), "kill cursors sent");
        Ok(())
    }

    /// Names of every database on the peer.
    pub async fn database_names(&self) -> Result<Vec<String>> {
        let reply = self.db("admin").command(doc! {"listDatabases": 1}).await?;
        let databases = reply
            .get_array("databases")
            .map_err(|_| Error::InvalidReply("listDatabases reply had no databases".into()))?;
        let mut names = Vec::with_capacity(databases.len());
        for entry in databases {
            if let Some(name) = entry.as_document().and_then(|d| d.get_str("name").ok()) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    async fn handshake(&self) -> Result<()> {
        let reply = self
            .db("admin")
            .execute(doc! {"isMaster": 1}, self.inner.options.default_timeout)
            .await?;
        let first = reply
            .documents
            .first()
            .ok_or_else(|| Error::InvalidReply("handshake reply was empty".into()))?;
        let wire_version = match first.get("maxWireVersion") {
            Some(Bson::Int32(version)) => *version,
            Some(Bson::Int64(version)) => *version as i32,
            _ => 0,
        };
        self.inner
            .max_wire_version
            .store(wire_version, Ordering::Release);
        tracing::info!(
            host = %self.inner.host,
            port = self.inner.port,
            wire_version,
            "connected"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::sync::atomic::AtomicUsize;

    fn reply_to(id: i32) -> Reply {
        Reply {
            request_id: 900,
            response_to: id,
            flags: 0,
            cursor_id: 0,
            starting_from: 0,
            number_returned: 1,
            documents: vec![doc! {"ok": 1}],
        }
    }

    #[test]
    fn test_message_ids_are_monotone() {
        let server = Server::new("localhost", 27017, ServerOptions::default());
        assert_eq!(server.next_message_id(), 0);
        assert_eq!(server.next_message_id(), 1);
        assert_eq!(server.next_message_id(), 2);
    }

    #[tokio::test]
    async fn test_await_then_deliver() {
        let router = Arc::new(ReplyRouter::new());
        let waiting = router.clone();
        let task = tokio::spawn(async move {
            waiting.await_reply(7, Duration::from_secs(1)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.deliver(reply_to(7));
        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply.response_to, 7);
    }

    #[tokio::test]
    async fn test_deliver_then_await_hits_the_inbox() {
        let router = ReplyRouter::new();
        router.deliver(reply_to(3));
        assert_eq!(router.orphan_count(), 1);
        let reply = router.await_reply(3, Duration::from_millis(10)).await.unwrap();
        assert_eq!(reply.response_to, 3);
        assert_eq!(router.orphan_count(), 0);
    }

    #[tokio::test]
    async fn test_await_times_out_and_unregisters() {
        let router = ReplyRouter::new();
        let begun = Instant::now();
        let result = router.await_reply(9, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout)));
        let waited = begun.elapsed();
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(250));
        assert!(router.state.lock().unwrap().waiters.is_empty());
    }

    #[tokio::test]
    async fn test_callback_runs_on_delivery() {
        let router = ReplyRouter::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        router.set_callback(
            5,
            Box::new(move |reply| {
                assert_eq!(reply.response_to, 5);
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        router.deliver(reply_to(5));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // the reply is still parked for a late waiter
        assert_eq!(router.orphan_count(), 1);
    }

    #[tokio::test]
    async fn test_orphans_older_than_watermark_are_reaped() {
        let router = ReplyRouter::new();
        router.set_largest_timeout(Duration::from_millis(10));
        router.deliver(reply_to(1));
        assert_eq!(router.orphan_count(), 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        router.deliver(reply_to(2));
        assert_eq!(router.orphan_count(), 1);
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let server = Server::new("localhost", 27017, ServerOptions::default());
        assert!(matches!(server.reserve().await, Err(Error::NotYetConnected)));
        assert!(matches!(server.disconnect(), Err(Error::NotYetConnected)));
    }
}
