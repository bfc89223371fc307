//! Lazy forward iteration over result batches.
//!
//! A cursor starts from either a legacy reply or the `cursor` sub-document of
//! a command reply, and fetches follow-up batches on demand. Abandoning a
//! cursor that still has a live server-side id reaps it with a best-effort
//! `KillCursors` on drop.

use super::database::Database;
use crate::error::{Error, Result};
use crate::network::protocol::{Message, Reply};
use crate::network::Server;
use bson::{Bson, Document};
use std::collections::VecDeque;
use std::sync::Arc;

type Transform<T> = Arc<dyn Fn(Document) -> Option<T> + Send + Sync>;

/// Owns the server-side cursor id; id 0 means the server holds nothing.
struct CursorHandle {
    server: Server,
    id: i64,
}

impl Drop for CursorHandle {
    fn drop(&mut self) {
        if self.id == 0 {
            return;
        }
        let server = self.server.clone();
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = server.kill_cursors(&[id]).await {
                    tracing::debug!(cursor_id = id, error = %err, "failed to reap abandoned cursor");
                }
            });
        }
    }
}

/// Forward-only iterator over the documents of one result set.
pub struct Cursor<T = Document> {
    db: Database,
    namespace: String,
    handle: CursorHandle,
    buffer: VecDeque<Document>,
    chunk_size: i32,
    transform: Transform<T>,
}

impl Cursor<Document> {
    /// Build a cursor from a legacy reply frame.
    pub(crate) fn from_reply(
        db: Database,
        namespace: String,
        reply: Reply,
        chunk_size: i32,
    ) -> Cursor<Document> {
        let server = db.server().clone();
        Cursor {
            db,
            namespace,
            handle: CursorHandle {
                server,
                id: reply.cursor_id,
            },
            buffer: reply.documents.into(),
            chunk_size,
            transform: Arc::new(|document| Some(document)),
        }
    }

    /// Build a cursor from the `cursor` sub-document of a command reply.
    pub(crate) fn from_command_document(
        db: Database,
        default_namespace: &str,
        reply: &Document,
        chunk_size: i32,
    ) -> Result<Cursor<Document>> {
        let cursor = reply.get_document("cursor").map_err(|_| {
            Error::CursorInitialization("reply carried no cursor document".into())
        })?;
        let id = match cursor.get("id") {
            Some(Bson::Int64(id)) => *id,
            Some(Bson::Int32(id)) => *id as i64,
            _ => {
                return Err(Error::CursorInitialization("cursor id missing".into()));
            }
        };
        let namespace = cursor
            .get_str("ns")
            .unwrap_or(default_namespace)
            .to_string();
        let batch = cursor.get_array("firstBatch").map_err(|_| {
            Error::CursorInitialization("cursor document had no firstBatch".into())
        })?;
        let mut buffer = VecDeque::with_capacity(batch.len());
        for entry in batch {
            match entry {
                Bson::Document(document) => buffer.push_back(document.clone()),
                other => {
                    return Err(Error::CursorInitialization(format!(
                        "firstBatch held a non-document: {other}"
                    )));
                }
            }
        }
        let server = db.server().clone();
        Ok(Cursor {
            db,
            namespace,
            handle: CursorHandle { server, id },
            buffer,
            chunk_size,
            transform: Arc::new(|document| Some(document)),
        })
    }
}

impl<T: 'static> Cursor<T> {
    /// Derive a cursor whose items pass through `transform`; documents the
    /// transform maps to `None` are skipped.
    pub fn map<U>(
        self,
        transform: impl Fn(T) -> Option<U> + Send + Sync + 'static,
    ) -> Cursor<U> {
        let Cursor {
            db,
            namespace,
            handle,
            buffer,
            chunk_size,
            transform: inner,
        } = self;
        Cursor {
            db,
            namespace,
            handle,
            buffer,
            chunk_size,
            transform: Arc::new(move |document| (*inner)(document).and_then(&transform)),
        }
    }

    /// Next item, fetching another batch from the server when the pending one
    /// runs dry. `None` once the cursor is exhausted.
    pub async fn next(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(document) = self.buffer.pop_front() {
                match (*self.transform)(document) {
                    Some(item) => return Ok(Some(item)),
                    None => continue,
                }
            }
            if self.handle.id == 0 {
                return Ok(None);
            }
            self.fetch_more().await?;
        }
    }

    /// Drain the cursor into a vector.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cursor_id(&self) -> i64 {
        self.handle.id
    }

    async fn fetch_more(&mut self) -> Result<()> {
        let server = self.db.server().clone();
        let message = Message::GetMore {
            request_id: server.next_message_id(),
            namespace: self.namespace.clone(),
            number_to_return: self.chunk_size,
            cursor_id: self.handle.id,
        };
        let mut connection = server.reserve().await?;
        let reply = server
            .send_and_await(&message, &mut connection, server.default_timeout())
            .await?;
        if reply.is_cursor_not_found() {
            self.handle.id = 0;
            return Err(Error::InvalidReply(
                "cursor no longer exists on the server".into(),
            ));
        }
        self.handle.id = reply.cursor_id;
        self.buffer.extend(reply.documents);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Server, ServerOptions};
    use bson::doc;

    fn test_db() -> Database {
        Server::new("localhost", 27017, ServerOptions::default()).db("app")
    }

    fn drained_reply(documents: Vec<Document>) -> Reply {
        Reply {
            request_id: 1,
            response_to: 0,
            flags: 0,
            cursor_id: 0,
            starting_from: 0,
            number_returned: documents.len() as i32,
            documents,
        }
    }

    #[tokio::test]
    async fn test_exhausts_without_fetching() {
        let reply = drained_reply(vec![doc! {"n": 1}, doc! {"n": 2}]);
        let mut cursor = Cursor::from_reply(test_db(), "app.items".into(), reply, 10);
        assert_eq!(cursor.next().await.unwrap(), Some(doc! {"n": 1}));
        assert_eq!(cursor.next().await.unwrap(), Some(doc! {"n": 2}));
        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_map_skips_unmatched_documents() {
        let reply = drained_reply(vec![
            doc! {"name": "a"},
            doc! {"other": 1},
            doc! {"name": "b"},
        ]);
        let cursor = Cursor::from_reply(test_db(), "app.items".into(), reply, 10)
            .map(|document| document.get_str("name").ok().map(String::from));
        let names = cursor.collect().await.unwrap();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_command_cursor_construction() {
        let reply = doc! {
            "ok": 1,
            "cursor": {
                "id": 0i64,
                "ns": "app.items",
                "firstBatch": [{"n": 1}],
            },
        };
        let cursor =
            Cursor::from_command_document(test_db(), "app.items", &reply, 10).unwrap();
        assert_eq!(cursor.namespace(), "app.items");
        assert_eq!(cursor.cursor_id(), 0);
        let items = cursor.collect().await.unwrap();
        assert_eq!(items, vec![doc! {"n": 1}]);
    }

    #[tokio::test]
    async fn test_command_cursor_requires_cursor_document() {
        let result = Cursor::from_command_document(test_db(), "app.items", &doc! {"ok": 1}, 10);
        assert!(matches!(result, Err(Error::CursorInitialization(_))));
    }

    #[tokio::test]
    async fn test_command_cursor_rejects_malformed_batch() {
        let reply = doc! {
            "ok": 1,
            "cursor": {"id": 0i64, "ns": "app.items", "firstBatch": [7]},
        };
        let result = Cursor::from_command_document(test_db(), "app.items", &reply, 10);
        assert!(matches!(result, Err(Error::CursorInitialization(_))));
    }
}
