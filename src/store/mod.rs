//! Thread persistence — one record per source email.

pub mod libsql_backend;
pub mod locks;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use locks::KeyedLocks;
pub use traits::{
    ChatRole, ChatTurn, EmailThread, NewThread, ReplyHeaders, ThreadStatus, ThreadStore,
};
