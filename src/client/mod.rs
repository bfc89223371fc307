//! Operation layer: databases, collections, and cursors.
//!
//! Command documents are assembled here and shipped through the network
//! layer. The command name is always the first field of the document, which
//! the ordered `Document` type preserves. Operations that exist both as
//! database commands and as legacy opcodes pick their dispatch from the
//! peer's advertised wire version, cached at connect time.

pub mod collection;
pub mod cursor;
pub mod database;

pub use collection::{
    AggregateOptions, Collection, FindAndModify, FindOptions, IndexModel, RemoveRequest,
    UpdateRequest,
};
pub use cursor::Cursor;
pub use database::Database;

use bson::{Bson, Document};

/// True when a command reply carries `ok: 1` in any numeric spelling.
pub(crate) fn reply_ok(document: &Document) -> bool {
    match document.get("ok") {
        Some(Bson::Double(value)) => *value == 1.0,
        Some(Bson::Int32(value)) => *value == 1,
        Some(Bson::Int64(value)) => *value == 1,
        Some(Bson::Boolean(value)) => *value,
        _ => false,
    }
}
