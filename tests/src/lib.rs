//! Cross-crate scenario tests. Everything runs against the in-memory
//! buffer and mock replica writer; no database or Redis is required.

pub mod support;

#[cfg(test)]
mod applier;
#[cfg(test)]
mod pipeline;
#[cfg(test)]
mod stream_rpc;
