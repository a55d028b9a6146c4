//! Shared test helpers.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use strata_engine::{
    Bytecode, ClassResolver, Code, CompileError, CompiledSourceInfo, Compiler, MemorySource,
    Source,
};

/// Installs the fmt subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn src(id: &str, text: &str) -> Arc<dyn Source> {
    Arc::new(MemorySource::new(id, text).unwrap())
}

pub fn bytes_of(class: &strata_engine::LoadedClass) -> String {
    String::from_utf8(class.bytecode().bytes().to_vec()).unwrap()
}

/// Compiles sources whose text is a whitespace-separated list of class
/// names; the first name is the main class. A `!fail` token fails the
/// compilation. Bytes encode the source id, class name and stamp so tests
/// can tell definitions (and compilation rounds) apart.
///
/// Clones share the invocation counter.
#[derive(Clone, Debug, Default)]
pub struct ScriptCompiler {
    calls: Arc<AtomicUsize>,
}

impl ScriptCompiler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Compiler for ScriptCompiler {
    fn compile(
        &self,
        _parent: &dyn ClassResolver,
        sources: &[Arc<dyn Source>],
    ) -> Result<Code, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut infos = Vec::new();
        let mut bytecodes = Vec::new();
        let mut ids = Vec::new();
        for source in sources {
            let text = source
                .text()
                .ok_or_else(|| CompileError::new(source.id(), "source has no text"))?;
            let classes: Vec<&str> = text.split_whitespace().collect();
            if classes.is_empty() {
                return Err(CompileError::new(source.id(), "no classes declared"));
            }
            if classes.contains(&"!fail") {
                return Err(CompileError::new(source.id(), "scripted failure"));
            }
            let stamp = source.modification_stamp();
            for class in &classes {
                bytecodes.push(
                    Bytecode::new(*class, format!("{}/{class}@{stamp}", source.id()).into_bytes())
                        .map_err(|e| CompileError::new(source.id(), e.to_string()))?,
                );
            }
            infos.push(
                CompiledSourceInfo::new(source.id(), classes[0], classes.clone(), stamp)
                    .map_err(|e| CompileError::new(source.id(), e.to_string()))?,
            );
            ids.push(source.id().to_owned());
        }
        let name = ids.join("+");
        Code::new(name.as_str(), infos, bytecodes)
            .map_err(|e| CompileError::new(name.as_str(), e.to_string()))
    }
}
