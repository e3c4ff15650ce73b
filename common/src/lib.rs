pub mod change;
pub mod config;
pub mod err;
pub mod log;
pub mod position;

pub mod cancel;
pub mod retry;

/// Reserved object-name prefix for Kasho's own primary-side artifacts
/// (trigger log table, helper functions). Objects carrying it are never
/// replicated and never appear in bootstrap output.
pub const KASHO_PREFIX: &str = "kasho_";

/// Primary-side trigger log table. Inserts into it are folded into DDL
/// changes by the capture service.
pub const DDL_LOG_TABLE: &str = "kasho_ddl_log";
