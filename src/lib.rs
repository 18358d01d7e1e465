//! A streaming protocol decoder runtime: push chunks of sampled digital
//! signal data through a configurable stack of protocol decoders, written
//! in an embedded scripting language, and receive structured annotations
//! and higher-level protocol events back out.
//!
//! [`Runtime`] owns the decoder registry and the set of live sessions. A
//! [`Session`] holds a forest of decoder instance roots plus host
//! callbacks; feeding it contiguous sample chunks with [`Session::send`]
//! drives every root's `decode` entrypoint, whose outputs the session
//! routes to host callbacks or to stacked consumer decoders.

pub mod condition;
pub mod decoder;
pub mod error;
pub mod instance;
pub mod registry;
pub mod runtime;
pub mod sample_view;
pub mod session;
pub mod value;
pub mod vm;

pub use decoder::{ApiVersion, Decoder};
pub use error::{Error, Result, VmFailure};
pub use instance::{Instance, InstanceId, OutputType};
pub use runtime::{Runtime, SessionId};
pub use session::Session;
pub use value::Value;
