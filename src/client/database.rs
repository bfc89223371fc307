//! Database scope: command execution against `"<db>.$cmd"`.

use super::collection::Collection;
use super::reply_ok;
use crate::error::{Error, Result};
use crate::network::protocol::{Message, Reply};
use crate::network::Server;
use bson::{doc, Document};
use std::time::Duration;

/// One database namespace on a server.
#[derive(Clone)]
pub struct Database {
    server: Server,
    name: String,
}

impl Database {
    pub(crate) fn new(server: Server, name: &str) -> Database {
        Database {
            server,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.clone(), name)
    }

    /// Run a command document and hand back the raw reply. The command
    /// travels as a single-result query against the `$cmd` collection.
    pub async fn execute(&self, command: Document, timeout: Duration) -> Result<Reply> {
        let message = Message::Query {
            request_id: self.server.next_message_id(),
            flags: 0,
            namespace: format!("{}.$cmd", self.name),
            number_to_skip: 0,
            number_to_return: 1,
            query: command,
            projection: None,
        };
        let mut connection = self.server.reserve().await?;
        self.server
            .send_and_await(&message, &mut connection, timeout)
            .await
    }

    /// Run a command and return its first reply document, failing when the
    /// server did not acknowledge with `ok: 1`.
    pub async fn command(&self, command: Document) -> Result<Document> {
        let reply = self.execute(command, self.server.default_timeout()).await?;
        let first = reply
            .documents
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidReply("command reply was empty".into()))?;
        if !reply_ok(&first) {
            return Err(Error::CommandFailure { error: first });
        }
        Ok(first)
    }

    /// Clone a collection of this database into a new capped collection.
    pub async fn clone_collection_as_capped(
        &self,
        collection: &str,
        new_name: &str,
        cap: i64,
    ) -> Result<()> {
        self.command(doc! {
            "cloneCollectionAsCapped": collection,
            "toCollection": new_name,
            "size": cap,
        })
        .await
        .map(|_| ())
    }

    /// Drop the whole database.
    pub async fn drop_database(&self) -> Result<()> {
        self.command(doc! {"dropDatabase": 1}).await.map(|_| ())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ServerOptions;

    #[tokio::test]
    async fn test_execute_requires_connect() {
        let server = Server::new("localhost", 27017, ServerOptions::default());
        let database = server.db("app");
        let result = database
            .execute(doc! {"ping": 1}, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::NotYetConnected)));
    }

    #[test]
    fn test_collection_factory_scopes_names() {
        let server = Server::new("localhost", 27017, ServerOptions::default());
        let collection = server.db("app").collection("users");
        assert_eq!(collection.full_name(), "app.users");
    }
}
