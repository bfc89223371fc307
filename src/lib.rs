// Photon driver - Rust client for document databases
// speaking the MongoDB-compatible binary wire protocol

#![warn(rust_2018_idioms)]

pub mod client;
pub mod network;

// Re-exports for convenience
pub use bson;
pub use bson::{doc, Bson, Document};
pub use client::{
    AggregateOptions, Collection, Cursor, Database, FindAndModify, FindOptions, IndexModel,
    RemoveRequest, UpdateRequest,
};
pub use network::{Server, ServerOptions};

/// Driver error types
pub mod error {
    use bson::Document;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("not connected to a server")]
        NotYetConnected,

        #[error("already connected to a server")]
        AlreadyConnected,

        #[error("no reply arrived within the deadline")]
        Timeout,

        #[error("wire parse error: {0}")]
        Parse(String),

        #[error("reply was missing required fields: {0}")]
        InvalidReply(String),

        #[error("frame carried a non-reply opcode where a reply was required")]
        IncorrectReply,

        #[error("insert was rejected by the server")]
        InsertFailure {
            documents: Vec<Document>,
            error: Document,
        },

        #[error("update was rejected by the server")]
        UpdateFailure {
            updates: Vec<Document>,
            error: Document,
        },

        #[error("remove was rejected by the server")]
        RemoveFailure {
            removals: Vec<Document>,
            error: Document,
        },

        #[error("command was rejected by the server")]
        CommandFailure { error: Document },

        #[error("invalid command: {0}")]
        Command(String),

        #[error("the peer (wire version {wire_version}) does not support {operation}")]
        UnsupportedOperation {
            operation: &'static str,
            wire_version: i32,
        },

        #[error("expected a cursor-shaped reply")]
        InvalidResponse,

        #[error("could not initialize cursor: {0}")]
        CursorInitialization(String),

        #[error("internal inconsistency: {0}")]
        Inconsistency(String),

        #[error("i/o error: {0}")]
        Io(#[from] std::io::Error),
    }

    impl From<bson::ser::Error> for Error {
        fn from(err: bson::ser::Error) -> Error {
            Error::Parse(err.to_string())
        }
    }

    impl From<bson::de::Error> for Error {
        fn from(err: bson::de::Error) -> Error {
            Error::Parse(err.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
