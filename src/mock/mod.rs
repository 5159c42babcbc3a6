//! Mock collaborators
//!
//! In-process stand-ins for the pieces the cache talks to, used by unit and
//! integration tests.
//!
//! - [`MockCompiler`]: resolves `#include`-style dependencies over a search
//!   path on the real filesystem and writes deterministic outputs
//! - [`RecordingSink`]: keeps every diagnostic for later assertions

mod compiler;
mod sink;

pub use compiler::MockCompiler;
pub use sink::RecordingSink;
