//! Collection surface: CRUD, cursors, index management, administration.
//!
//! Every gated operation picks its dispatch from the wire version the peer
//! advertised during the handshake: servers new enough get database commands
//! (`insert`, `find`, `update`, `delete`, ...), older peers get the legacy
//! opcodes with the same semantics. Callers never see the difference.

use super::cursor::Cursor;
use super::database::Database;
use super::reply_ok;
use crate::error::{Error, Result};
use crate::network::protocol::{
    Message, DELETE_SINGLE_REMOVE, INSERT_CONTINUE_ON_ERROR, UPDATE_MULTI, UPDATE_UPSERT,
};
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use std::time::Duration;

/// Wire version that introduced the write commands (`insert`, `update`,
/// `delete`, `createIndexes`).
const WIRE_WRITE_COMMANDS: i32 = 2;

/// Wire version that introduced the `find` command and `listIndexes`.
const WIRE_FIND_COMMAND: i32 = 4;

/// Documents per batched insert command.
const INSERT_BATCH: usize = 1000;

/// One entry of a bulk update.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub filter: Document,
    pub update: Document,
    pub upsert: bool,
    pub multi: bool,
}

/// One entry of a bulk remove; `limit` 0 removes every match.
#[derive(Debug, Clone)]
pub struct RemoveRequest {
    pub filter: Document,
    pub limit: i32,
}

/// Knobs for `find`.
#[derive(Debug, Clone)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: Option<i32>,
    pub limit: Option<i32>,
    pub batch_size: i32,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            sort: None,
            projection: None,
            skip: None,
            limit: None,
            batch_size: 10,
        }
    }
}

/// Knobs for `aggregate`.
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub explain: Option<bool>,
    pub allow_disk_use: Option<bool>,
    pub cursor: Document,
    pub bypass_document_validation: Option<bool>,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            explain: None,
            allow_disk_use: None,
            cursor: doc! {"batchSize": 10},
            bypass_document_validation: None,
        }
    }
}

/// What `find_and_modify` does with the matched document.
#[derive(Debug, Clone)]
pub enum FindAndModify {
    Remove,
    Update {
        update: Document,
        return_new: bool,
        upsert: bool,
    },
}

/// One index to create.
#[derive(Debug, Clone)]
pub struct IndexModel {
    pub name: String,
    pub keys: Document,
    pub options: Document,
}

impl IndexModel {
    pub fn new(name: impl Into<String>, keys: Document) -> IndexModel {
        IndexModel {
            name: name.into(),
            keys,
            options: Document::new(),
        }
    }

    pub fn with_options(mut self, options: Document) -> IndexModel {
        self.options = options;
        self
    }
}

/// One named collection inside a database.
#[derive(Debug, Clone)]
pub struct Collection {
    db: Database,
    name: String,
}

impl Collection {
    pub(crate) fn new(db: Database, name: &str) -> Collection {
        Collection {
            db,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// `"<db>.<collection>"`, the namespace used by the legacy opcodes.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.db.name(), self.name)
    }

    fn wire_version(&self) -> i32 {
        self.db.server().max_wire_version()
    }

    // ---- insert ------------------------------------------------------------

    /// Insert documents in batches of up to 1,000, returning the `_id` of
    /// every input in order. Documents without an `_id` get a freshly
    /// generated ObjectId injected as their first field.
    pub async fn insert(
        &self,
        documents: Vec<Document>,
        ordered: Option<bool>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Bson>> {
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(60 + documents.len() as u64 / 50));
        let mut ids = Vec::with_capacity(documents.len());
        let use_command = self.wire_version() >= WIRE_WRITE_COMMANDS;

        if use_command {
            for chunk in documents.chunks(INSERT_BATCH) {
                let prepared: Vec<Document> = chunk.iter().map(|d| with_own_id(d, &mut ids)).collect();
                let mut command = doc! {"insert": self.name.as_str()};
                command.insert(
                    "documents",
                    prepared.iter().cloned().map(Bson::Document).collect::<Vec<_>>(),
                );
                if let Some(ordered) = ordered {
                    command.insert("ordered", ordered);
                }
                let reply = self.db.execute(command, timeout).await?;
                let first = reply
                    .documents
                    .first()
                    .ok_or_else(|| Error::InvalidReply("insert reply was empty".into()))?;
                if !reply_ok(first) {
                    return Err(Error::InsertFailure {
                        documents: prepared,
                        error: first.clone(),
                    });
                }
            }
        } else {
            let flags = if ordered == Some(false) {
                INSERT_CONTINUE_ON_ERROR
            } else {
                0
            };
            let server = self.db.server().clone();
            let mut connection = server.reserve().await?;
            for chunk in documents.chunks(INSERT_BATCH) {
                let prepared: Vec<Document> = chunk.iter().map(|d| with_own_id(d, &mut ids)).collect();
                let message = Message::Insert {
                    request_id: server.next_message_id(),
                    flags,
                    namespace: self.full_name(),
                    documents: prepared,
                };
                server.send(&message, &mut connection).await?;
            }
        }

        Ok(ids)
    }

    /// Insert one document and return its `_id`.
    pub async fn insert_one(&self, document: Document) -> Result<Bson> {
        let mut ids = self.insert(vec![document], None, None).await?;
        ids.pop()
            .ok_or_else(|| Error::Inconsistency("insert returned no id".into()))
    }

    // ---- queries -----------------------------------------------------------

    /// Issue a raw legacy query and wrap the reply in a cursor.
    pub async fn query(&self, filter: Document, flags: i32, batch_size: i32) -> Result<Cursor> {
        self.raw_query(filter, flags, 0, batch_size, None, batch_size)
            .await
    }

    /// `query` bounded to a single result.
    pub async fn query_one(&self, filter: Document, flags: i32) -> Result<Option<Document>> {
        let mut cursor = self.raw_query(filter, flags, 0, 1, None, 1).await?;
        cursor.next().await
    }

    /// Find matching documents. Speaks the `find` command where the peer
    /// supports it and falls back to a legacy query otherwise.
    pub async fn find(&self, filter: Option<Document>, options: FindOptions) -> Result<Cursor> {
        if self.wire_version() >= WIRE_FIND_COMMAND {
            let mut command = doc! {"find": self.name.as_str()};
            if let Some(filter) = filter {
                command.insert("filter", filter);
            }
            if let Some(sort) = options.sort {
                command.insert("sort", sort);
            }
            if let Some(projection) = options.projection {
                command.insert("projection", projection);
            }
            if let Some(skip) = options.skip {
                command.insert("skip", skip);
            }
            if let Some(limit) = options.limit {
                command.insert("limit", limit);
            }
            command.insert("batchSize", options.batch_size);

            let reply = self
                .db
                .execute(command, self.db.server().default_timeout())
                .await?;
            let first = reply
                .documents
                .first()
                .ok_or_else(|| Error::InvalidReply("find reply was empty".into()))?;
            if !reply_ok(first) {
                return Err(Error::CommandFailure {
                    error: first.clone(),
                });
            }
            if !first.contains_key("cursor") {
                return Err(Error::InvalidResponse);
            }
            Cursor::from_command_document(
                self.db.clone(),
                &self.full_name(),
                first,
                options.batch_size,
            )
        } else {
            let selector = match options.sort {
                Some(sort) => doc! {
                    "$query": filter.unwrap_or_default(),
                    "$orderby": sort,
                },
                None => filter.unwrap_or_default(),
            };
            let number_to_return = options.limit.unwrap_or(options.batch_size);
            self.raw_query(
                selector,
                0,
                options.skip.unwrap_or(0),
                number_to_return,
                options.projection,
                options.batch_size,
            )
            .await
        }
    }

    /// First matching document, if any.
    pub async fn find_one(
        &self,
        filter: Option<Document>,
        mut options: FindOptions,
    ) -> Result<Option<Document>> {
        options.limit = Some(1);
        let mut cursor = self.find(filter, options).await?;
        cursor.next().await
    }

    async fn raw_query(
        &self,
        query: Document,
        flags: i32,
        number_to_skip: i32,
        number_to_return: i32,
        projection: Option<Document>,
        chunk_size: i32,
    ) -> Result<Cursor> {
        let server = self.db.server().clone();
        let message = Message::Query {
            request_id: server.next_message_id(),
            flags,
            namespace: self.full_name(),
            number_to_skip,
            number_to_return,
            query,
            projection,
        };
        let mut connection = server.reserve().await?;
        let reply = server
            .send_and_await(&message, &mut connection, server.default_timeout())
            .await?;
        if reply.is_query_failure() {
            let error = reply
                .documents
                .into_iter()
                .next()
                .unwrap_or_else(Document::new);
            return Err(Error::CommandFailure { error });
        }
        Ok(Cursor::from_reply(
            self.db.clone(),
            self.full_name(),
            reply,
            chunk_size,
        ))
    }

    // ---- update / remove ---------------------------------------------------

    /// Apply a batch of updates, via the `update` command or one legacy
    /// opcode per entry.
    pub async fn update(&self, updates: Vec<UpdateRequest>, ordered: Option<bool>) -> Result<()> {
        if self.wire_version() >= WIRE_WRITE_COMMANDS {
            let mut command = doc! {"update": self.name.as_str()};
            command.insert(
                "updates",
                updates.iter().map(update_entry).collect::<Vec<_>>(),
            );
            if let Some(ordered) = ordered {
                command.insert("ordered", ordered);
            }
            let reply = self
                .db
                .execute(command, self.db.server().default_timeout())
                .await?;
            let first = reply
                .documents
                .first()
                .ok_or_else(|| Error::InvalidReply("update reply was empty".into()))?;
            if !reply_ok(first) {
                return Err(Error::UpdateFailure {
                    updates: updates.iter().map(update_entry).collect(),
                    error: first.clone(),
                });
            }
            Ok(())
        } else {
            let server = self.db.server().clone();
            let mut connection = server.reserve().await?;
            for entry in &updates {
                let mut flags = 0;
                if entry.upsert {
                    flags |= UPDATE_UPSERT;
                }
                if entry.multi {
                    flags |= UPDATE_MULTI;
                }
                let message = Message::Update {
                    request_id: server.next_message_id(),
                    namespace: self.full_name(),
                    flags,
                    selector: entry.filter.clone(),
                    update: entry.update.clone(),
                };
                server.send(&message, &mut connection).await?;
            }
            Ok(())
        }
    }

    /// Remove matching documents, via the `delete` command or legacy opcodes.
    /// A bounded legacy removal (`limit` > 0) is expressed as that many
    /// single-remove opcodes, which is the only bounded form old peers know.
    pub async fn remove(&self, removals: Vec<RemoveRequest>, ordered: Option<bool>) -> Result<()> {
        if self.wire_version() >= WIRE_WRITE_COMMANDS {
            let mut command = doc! {"delete": self.name.as_str()};
            command.insert(
                "deletes",
                removals.iter().map(remove_entry).collect::<Vec<_>>(),
            );
            if let Some(ordered) = ordered {
                command.insert("ordered", ordered);
            }
            let reply = self
                .db
                .execute(command, self.db.server().default_timeout())
                .await?;
            let first = reply
                .documents
                .first()
                .ok_or_else(|| Error::InvalidReply("delete reply was empty".into()))?;
            if !reply_ok(first) {
                return Err(Error::RemoveFailure {
                    removals: removals.iter().map(remove_entry).collect(),
                    error: first.clone(),
                });
            }
            Ok(())
        } else {
            let server = self.db.server().clone();
            let mut connection = server.reserve().await?;
            for entry in &removals {
                let (flags, repeats) = if entry.limit == 0 {
                    (0, 1)
                } else {
                    (DELETE_SINGLE_REMOVE, entry.limit)
                };
                for _ in 0..repeats {
                    let message = Message::Delete {
                        request_id: server.next_message_id(),
                        namespace: self.full_name(),
                        flags,
                        selector: entry.filter.clone(),
                    };
                    server.send(&message, &mut connection).await?;
                }
            }
            Ok(())
        }
    }

    // ---- commands ----------------------------------------------------------

    /// Count matching documents.
    pub async fn count(
        &self,
        filter: Option<Document>,
        limit: Option<i32>,
        skip: Option<i32>,
    ) -> Result<i64> {
        let mut command = doc! {"count": self.name.as_str()};
        if let Some(filter) = filter {
            command.insert("query", filter);
        }
        if let Some(skip) = skip {
            command.insert("skip", skip);
        }
        if let Some(limit) = limit {
            command.insert("limit", limit);
        }
        let reply = self.db.command(command).await?;
        match reply.get("n") {
            Some(Bson::Int32(n)) => Ok(*n as i64),
            Some(Bson::Int64(n)) => Ok(*n),
            Some(Bson::Double(n)) => Ok(*n as i64),
            _ => Err(Error::InvalidReply("count reply carried no n".into())),
        }
    }

    /// Distinct values of `key` across matching documents.
    pub async fn distinct(&self, key: &str, filter: Option<Document>) -> Result<Vec<Bson>> {
        let mut command = doc! {"distinct": self.name.as_str(), "key": key};
        if let Some(filter) = filter {
            command.insert("query", filter);
        }
        let reply = self.db.command(command).await?;
        reply
            .get_array("values")
            .map(|values| values.to_vec())
            .map_err(|_| Error::InvalidReply("distinct reply carried no values".into()))
    }

    /// Run an aggregation pipeline and iterate its results.
    pub async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
    ) -> Result<Cursor> {
        let chunk_size = options.cursor.get_i32("batchSize").unwrap_or(10);
        let mut command = doc! {"aggregate": self.name.as_str()};
        command.insert(
            "pipeline",
            pipeline.into_iter().map(Bson::Document).collect::<Vec<_>>(),
        );
        command.insert("cursor", options.cursor);
        if let Some(explain) = options.explain {
            command.insert("explain", explain);
        }
        if let Some(allow_disk_use) = options.allow_disk_use {
            command.insert("allowDiskUse", allow_disk_use);
        }
        if let Some(bypass) = options.bypass_document_validation {
            command.insert("bypassDocumentValidation", bypass);
        }
        let reply = self.db.command(command).await?;
        Cursor::from_command_document(self.db.clone(), &self.full_name(), &reply, chunk_size)
    }

    /// Atomically modify one document and return its `value` field.
    pub async fn find_and_modify(
        &self,
        filter: Option<Document>,
        sort: Option<Document>,
        action: FindAndModify,
        projection: Option<Document>,
    ) -> Result<Bson> {
        let mut command = doc! {"findAndModify": self.name.as_str()};
        if let Some(filter) = filter {
            command.insert("query", filter);
        }
        if let Some(sort) = sort {
            command.insert("sort", sort);
        }
        match action {
            FindAndModify::Remove => {
                command.insert("remove", true);
            }
            FindAndModify::Update {
                update,
                return_new,
                upsert,
            } => {
                command.insert("update", update);
                command.insert("new", return_new);
                command.insert("upsert", upsert);
            }
        }
        if let Some(projection) = projection {
            command.insert("fields", projection);
        }
        let reply = self.db.command(command).await?;
        Ok(reply.get("value").cloned().unwrap_or(Bson::Null))
    }

    // ---- indexes -----------------------------------------------------------

    /// Create the given indexes.
    pub async fn create_indexes(&self, indexes: Vec<IndexModel>) -> Result<()> {
        if self.wire_version() < WIRE_WRITE_COMMANDS {
            return Err(Error::UnsupportedOperation {
                operation: "createIndexes",
                wire_version: self.wire_version(),
            });
        }
        let mut command = doc! {"createIndexes": self.name.as_str()};
        command.insert(
            "indexes",
            indexes.into_iter().map(index_spec).collect::<Vec<_>>(),
        );
        self.db.command(command).await.map(|_| ())
    }

    pub async fn create_index(&self, index: IndexModel) -> Result<()> {
        self.create_indexes(vec![index]).await
    }

    /// Drop the index called `name`.
    pub async fn drop_index(&self, name: &str) -> Result<()> {
        self.db
            .command(doc! {"dropIndexes": self.name.as_str(), "index": name})
            .await
            .map(|_| ())
    }

    /// Iterate the collection's index descriptions.
    pub async fn list_indexes(&self) -> Result<Cursor> {
        if self.wire_version() <= 3 {
            return Err(Error::UnsupportedOperation {
                operation: "listIndexes",
                wire_version: self.wire_version(),
            });
        }
        let reply = self
            .db
            .command(doc! {"listIndexes": self.name.as_str()})
            .await?;
        Cursor::from_command_document(self.db.clone(), &self.full_name(), &reply, 10)
    }

    // ---- administration ----------------------------------------------------

    /// Drop the collection.
    pub async fn drop(&self) -> Result<()> {
        self.db
            .command(doc! {"drop": self.name.as_str()})
            .await
            .map(|_| ())
    }

    /// Rename within the same database.
    pub async fn rename(&mut self, new_name: &str) -> Result<()> {
        let database = self.db.name().to_string();
        self.relocate(&database, new_name, None).await
    }

    /// Move to another database, optionally under a new name.
    pub async fn move_to(
        &mut self,
        database: &str,
        new_name: Option<&str>,
        drop_target: Option<bool>,
    ) -> Result<()> {
        let target = new_name.unwrap_or(&self.name).to_string();
        self.relocate(database, &target, drop_target).await
    }

    async fn relocate(
        &mut self,
        database: &str,
        new_name: &str,
        drop_target: Option<bool>,
    ) -> Result<()> {
        let mut command = doc! {
            "renameCollection": self.full_name(),
            "to": format!("{database}.{new_name}"),
        };
        if let Some(drop_target) = drop_target {
            command.insert("dropTarget", drop_target);
        }
        self.db.server().db("admin").command(command).await?;
        self.db = self.db.server().db(database);
        self.name = new_name.to_string();
        Ok(())
    }

    /// Load the collection's data and/or indexes into memory.
    pub async fn touch(&self, data: bool, index: bool) -> Result<()> {
        self.db
            .command(doc! {"touch": self.name.as_str(), "data": data, "index": index})
            .await
            .map(|_| ())
    }

    /// Convert into a capped collection of `size` bytes.
    pub async fn convert_to_capped(&self, size: i64) -> Result<()> {
        self.db
            .command(doc! {"convertToCapped": self.name.as_str(), "size": size})
            .await
            .map(|_| ())
    }

    /// Rebuild all indexes.
    pub async fn re_index(&self) -> Result<()> {
        self.db
            .command(doc! {"reIndex": self.name.as_str()})
            .await
            .map(|_| ())
    }

    /// Defragment the collection's storage.
    pub async fn compact(&self, force: Option<bool>) -> Result<()> {
        let mut command = doc! {"compact": self.name.as_str()};
        if let Some(force) = force {
            command.insert("force", force);
        }
        self.db.command(command).await.map(|_| ())
    }

    /// Change collection flags via `collMod`. The flags document supplies the
    /// modifications only; it must not name the command itself.
    pub async fn modify(&self, flags: Document) -> Result<()> {
        if flags.contains_key("collMod") {
            return Err(Error::Command(
                "flags must not carry their own collMod key".into(),
            ));
        }
        let mut command = doc! {"collMod": self.name.as_str()};
        for (key, value) in flags.iter() {
            command.insert(key.clone(), value.clone());
        }
        self.db.command(command).await.map(|_| ())
    }
}

/// Shallow-copy `document`, injecting a fresh ObjectId `_id` as the first
/// field when none is present, and record the effective id in `ids`.
fn with_own_id(document: &Document, ids: &mut Vec<Bson>) -> Document {
    if let Some(id) = document.get("_id") {
        ids.push(id.clone());
        return document.clone();
    }
    let id = ObjectId::new();
    let mut copy = Document::new();
    copy.insert("_id", id);
    for (key, value) in document.iter() {
        copy.insert(key.clone(), value.clone());
    }
    ids.push(Bson::ObjectId(id));
    copy
}

fn update_entry(entry: &UpdateRequest) -> Document {
    doc! {
        "q": entry.filter.clone(),
        "u": entry.update.clone(),
        "upsert": entry.upsert,
        "multi": entry.multi,
    }
}

fn remove_entry(entry: &RemoveRequest) -> Document {
    doc! {"q": entry.filter.clone(), "limit": entry.limit}
}

fn index_spec(index: IndexModel) -> Document {
    let mut spec = doc! {"name": index.name, "key": index.keys};
    for (key, value) in index.options.iter() {
        spec.insert(key.clone(), value.clone());
    }
    spec
}
