//! Wire layer: framed JSON-RPC transport and the typed server connection.

pub mod codec;
pub mod connection;
pub mod transport;
pub mod types;

pub use connection::{Connection, RequestError, TokenHolder};
pub use transport::{Transport, TransportClosed};
pub use types::{
    ContentChange, FileChangeType, FileEvent, InitializeResult, Position, Range,
    ServerCapabilities, TextDocumentSync, TextDocumentSyncOptions, TextEdit,
};
