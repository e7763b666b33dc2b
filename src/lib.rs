//! trapline - a remote source-level debugger for native executables.
//!
//! A controller (terminal or editor client) connects over WebSocket, asks for
//! a binary to be launched under tracing, arms breakpoints by source file and
//! line, and receives asynchronous events when the target halts. One session
//! owns one tracing engine; many controllers may share a session.

pub mod config;
pub mod debugger;
pub mod ws;
