//! IPC: wire protocol, length-prefixed framing, and the Unix socket server.

pub mod framing;
pub mod protocol;
pub mod server;
