//! Debugger session over the GDB machine interface
//!
//! `gdb` launches GDB in MI mode and exposes a blocking, typed command API
//! with background output reading and event fan-out. `bridge` serves that
//! session to a host process as JSON-RPC over stdio.

pub mod bridge;
pub mod gdb;
