//! The compiler seam.
//!
//! The engine never compiles anything itself; it hands a set of sources to a
//! [`Compiler`] and gets back an immutable [`Code`] artifact. Which language
//! the compiler speaks is none of the engine's business.

use crate::{artifacts::Code, error::CompileError, resolver::ClassResolver, sources::Source};
use std::sync::Arc;

/// Compiles a set of sources into a single [`Code`] artifact.
///
/// `parent` is the resolver the compiled code may link against, e.g. classes
/// from already-published layers. Implementations must be deterministic with
/// respect to source ids: the returned [`Code`] must carry a
/// [`CompiledSourceInfo`](crate::CompiledSourceInfo) for every source it was
/// given, stamped with the source's modification stamp at compile time.
pub trait Compiler: Send + Sync + 'static {
    fn compile(
        &self,
        parent: &dyn ClassResolver,
        sources: &[Arc<dyn Source>],
    ) -> Result<Code, CompileError>;
}
