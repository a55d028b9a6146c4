//! Compilation artifacts: bytecode blobs and the immutable [`Code`] bundles
//! that group them, per compiled source set.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

/// A single compiled class: its name and its raw bytes.
///
/// Constructed once, never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bytecode {
    class_name: String,
    bytes: Vec<u8>,
}

impl Bytecode {
    /// Errors if the class name or the byte blob is empty.
    pub fn new(class_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let class_name = class_name.into();
        let bytes = bytes.into();
        if class_name.is_empty() {
            return Err(EngineError::invalid_argument("bytecode requires a class name"));
        }
        if bytes.is_empty() {
            return Err(EngineError::invalid_argument(format!(
                "bytecode for class \"{class_name}\" requires bytes"
            )));
        }
        Ok(Self { class_name, bytes })
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Compile-time metadata for a single source within a [`Code`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledSourceInfo {
    source_id: String,
    main_class_name: String,
    class_names: BTreeSet<String>,
    last_modified_at_compile_time: u64,
}

impl CompiledSourceInfo {
    /// Errors if the source id or the main class name is empty, or if the
    /// main class is not among the declared class names.
    pub fn new(
        source_id: impl Into<String>,
        main_class_name: impl Into<String>,
        class_names: impl IntoIterator<Item = impl Into<String>>,
        last_modified_at_compile_time: u64,
    ) -> Result<Self> {
        let source_id = source_id.into();
        let main_class_name = main_class_name.into();
        if source_id.is_empty() {
            return Err(EngineError::invalid_argument("compiled source info requires a source id"));
        }
        if main_class_name.is_empty() {
            return Err(EngineError::invalid_argument(format!(
                "compiled source info for \"{source_id}\" requires a main class name"
            )));
        }
        let class_names: BTreeSet<String> = class_names.into_iter().map(Into::into).collect();
        if !class_names.contains(&main_class_name) {
            return Err(EngineError::invalid_argument(format!(
                "main class \"{main_class_name}\" is not among the classes declared by \"{source_id}\""
            )));
        }
        Ok(Self { source_id, main_class_name, class_names, last_modified_at_compile_time })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn main_class_name(&self) -> &str {
        &self.main_class_name
    }

    /// Every class name produced from this source.
    pub fn class_names(&self) -> &BTreeSet<String> {
        &self.class_names
    }

    /// The source's modification stamp captured when it was compiled.
    pub fn last_modified_at_compile_time(&self) -> u64 {
        self.last_modified_at_compile_time
    }
}

/// Immutable output of compiling one set of sources together.
///
/// Lookups are O(1) via two internal indices: source id to
/// [`CompiledSourceInfo`] and class name to [`Bytecode`]. A `Code` is frozen
/// at construction; no operation mutates it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    sources_name: String,
    sources: HashMap<String, CompiledSourceInfo>,
    bytecodes: HashMap<String, Arc<Bytecode>>,
}

impl Code {
    /// Builds a `Code` from per-source metadata and bytecode blobs.
    ///
    /// Validates that source ids and class names are unique and that every
    /// class name declared by a source has a corresponding bytecode.
    pub fn new(
        sources_name: impl Into<String>,
        infos: impl IntoIterator<Item = CompiledSourceInfo>,
        bytecodes: impl IntoIterator<Item = Bytecode>,
    ) -> Result<Self> {
        let sources_name = sources_name.into();
        if sources_name.is_empty() {
            return Err(EngineError::invalid_argument("code requires a sources name"));
        }

        let mut bytecode_index = HashMap::new();
        for bytecode in bytecodes {
            let class_name = bytecode.class_name().to_owned();
            if bytecode_index.insert(class_name.clone(), Arc::new(bytecode)).is_some() {
                return Err(EngineError::invalid_argument(format!(
                    "duplicate class name \"{class_name}\" in code \"{sources_name}\""
                )));
            }
        }

        let mut source_index = HashMap::new();
        for info in infos {
            for class_name in info.class_names() {
                if !bytecode_index.contains_key(class_name) {
                    return Err(EngineError::invalid_argument(format!(
                        "class \"{class_name}\" declared by source \"{}\" has no bytecode in code \"{sources_name}\"",
                        info.source_id()
                    )));
                }
            }
            let source_id = info.source_id().to_owned();
            if source_index.insert(source_id.clone(), info).is_some() {
                return Err(EngineError::invalid_argument(format!(
                    "duplicate source id \"{source_id}\" in code \"{sources_name}\""
                )));
            }
        }

        Ok(Self { sources_name, sources: source_index, bytecodes: bytecode_index })
    }

    /// Human-readable name for the compiled source set.
    pub fn sources_name(&self) -> &str {
        &self.sources_name
    }

    /// Ids of the sources compiled into this code, in no particular order.
    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn contains_source(&self, source_id: &str) -> bool {
        self.sources.contains_key(source_id)
    }

    pub fn source_info(&self, source_id: &str) -> Option<&CompiledSourceInfo> {
        self.sources.get(source_id)
    }

    /// The entry-point class for the given source.
    pub fn main_class_name_for(&self, source_id: &str) -> Option<&str> {
        self.sources.get(source_id).map(CompiledSourceInfo::main_class_name)
    }

    /// Every class name produced from the given source.
    pub fn class_names_for(&self, source_id: &str) -> Option<&BTreeSet<String>> {
        self.sources.get(source_id).map(CompiledSourceInfo::class_names)
    }

    /// Every class name this code defines, in no particular order.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.bytecodes.keys().map(String::as_str)
    }

    pub fn bytecode_for(&self, class_name: &str) -> Option<&Arc<Bytecode>> {
        self.bytecodes.get(class_name)
    }

    /// The modification stamp the given source had when it was compiled.
    pub fn last_modified_at_compile_time_for(&self, source_id: &str) -> Option<u64> {
        self.sources.get(source_id).map(CompiledSourceInfo::last_modified_at_compile_time)
    }
}
