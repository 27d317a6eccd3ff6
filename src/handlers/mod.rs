//! # Statement Handlers
//!
//! Bus handlers backed by the store. A [`StatementHandler`] binds one bus
//! address to one statement: reads are cache-eligible, writes invalidate the
//! cached reads they affect.

pub mod statement_handler;

pub use statement_handler::{ResultShape, StatementHandler};
