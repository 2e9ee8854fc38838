//! Parley core library — stream classification, round and execution-row
//! reconciliation, and cross-context send coordination for the console CLI.

pub mod backend;
pub mod config;
pub mod console;
pub mod coordination;
pub mod execution;
pub mod init;
pub mod notify;
pub mod rounds;
pub mod stream;
