//! JSON-RPC Bridge Module
//!
//! Lets a host process drive a debug session over stdio.

pub mod protocol;
pub mod server;

pub use server::BridgeServer;
