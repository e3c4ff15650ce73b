//! The translicator: consumes the ordered buffer, applies declarative
//! per-column transforms, renders flavor-correct SQL, and writes to the
//! replica with a monotonic durable checkpoint. A single apply task
//! serializes all replica writes.

pub mod applier;
pub mod render;
pub mod replica;
pub mod transform;

pub use applier::{ApplierOptions, Translicator};
pub use transform::TransformEngine;
