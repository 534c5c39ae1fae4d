//! Output to the parent agent
//!
//! - [`ApiWriter`] formats CHART/DIMENSION/VARIABLE/BEGIN/SET/END lines
//! - [`Emitter`] owns the shared pipe and writes whole blocks

mod api;
mod emitter;

pub use api::{ApiWriter, JobIdentity};
pub use emitter::Emitter;

#[cfg(test)]
pub(crate) use emitter::testing;
