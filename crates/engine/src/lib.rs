//! Dispatch of stored snippets onto the isolate pool, plus the SQLite
//! persistence and runtime configuration behind it.

pub mod builtin;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod store;

pub use config::{ConfigError, RuntimeConfig};
pub use dispatch::{
    AuthPolicy, Credentials, DispatchError, Dispatcher, InboundRequest, ResetOutcome,
    ResponseBody, TransportResponse,
};
pub use engine::{EngineError, RuntimeEngine};
pub use store::SqliteStore;
