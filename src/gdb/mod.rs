//! GDB (GNU Debugger) MI Session Module

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod parser;
pub mod reader;
pub mod router;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use config::{GdbConfig, LocalTarget, RemoteTarget, RemoteTargetConfig, SessionSetup};
pub use error::{GdbError, ParseError};
pub use router::{BreakpointLookup, Collaborators, Navigator};
pub use session::GdbSession;
pub use types::*;
