//! Change-stream capture service: drives native replication on the
//! primary (logical replication with wal2json on Postgres, the binlog
//! protocol on MySQL), runs the WAITING / ACCUMULATING / STREAMING state
//! machine, persists every decoded change to the ordered buffer, and
//! fans changes out over the streaming RPC.

pub mod capture;
pub mod machine;
pub mod rpc;
pub mod service;

pub use machine::{StreamStateMachine, Transition};
pub use service::{ChangeStreamServer, ServerOptions};
