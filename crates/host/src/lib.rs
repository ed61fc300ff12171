//! Guest-facing host API.
//!
//! Everything a guest script can reach goes through the ops registered by
//! [`extension`] and the per-invocation [`Capabilities`] stored in the
//! isolate's op state. The bootstrap shim in `js/bootstrap.js` adapts those
//! ops into the `context` object handed to the handler.

pub mod assets;
pub mod backend;
pub mod bridge;
pub mod capabilities;
pub mod config_lookup;
pub mod context;
pub mod http_proxy;
mod ops;
pub mod outcome;
pub mod value;

pub use bridge::Bridge;
pub use capabilities::{Capabilities, HostFault, HostServices, Interrupt, InterruptSlot};
pub use context::{InvocationContext, MultiValue, ResponseMeta, Snippet, SnippetProjection};
pub use ops::extension;
pub use outcome::{Envelope, GuestFailure};
pub use value::GuestValue;

/// Guest-side bootstrap, evaluated before the compiled module on every call.
pub const BOOTSTRAP_JS: &str = include_str!("../js/bootstrap.js");

/// Ambient declarations for the guest API, served to editors.
pub const TYPE_DECLARATIONS: &str = include_str!("../js/types.d.ts");
