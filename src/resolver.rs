//! Class-name resolution across the parent resolver, the code layers and
//! the top code cache.

use crate::{
    artifacts::{Bytecode, Code},
    cache::TopCodeCache,
    error::{LoadError, Result},
    sources::Source,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};

/// Resolution order between the external parent and the engine-managed
/// view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadMode {
    /// Ask the parent first; consult the engine-managed view only on a
    /// miss.
    ParentFirst,
    /// Consult the engine-managed view first; fall back to the parent.
    CurrentFirst,
}

/// A successfully resolved class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedClass {
    bytecode: Arc<Bytecode>,
}

impl LoadedClass {
    pub fn new(bytecode: Arc<Bytecode>) -> Self {
        Self { bytecode }
    }

    pub fn class_name(&self) -> &str {
        self.bytecode.class_name()
    }

    pub fn bytecode(&self) -> &Arc<Bytecode> {
        &self.bytecode
    }
}

/// External class lookup the engine delegates to.
///
/// Absence must be cheap. Implementations never fail; a name they cannot
/// resolve is simply `None`.
pub trait ClassResolver: Send + Sync {
    fn resolve(&self, class_name: &str) -> Option<LoadedClass>;
}

/// A parent that defines nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyResolver;

impl ClassResolver for EmptyResolver {
    fn resolve(&self, _class_name: &str) -> Option<LoadedClass> {
        None
    }
}

/// Map-backed resolver, for hosts that expose a fixed set of classes.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    classes: HashMap<String, Arc<Bytecode>>,
}

impl StaticResolver {
    pub fn new(classes: impl IntoIterator<Item = Bytecode>) -> Self {
        Self {
            classes: classes
                .into_iter()
                .map(|bytecode| (bytecode.class_name().to_owned(), Arc::new(bytecode)))
                .collect(),
        }
    }

    /// Adds or replaces a class definition.
    pub fn define(&mut self, bytecode: Bytecode) {
        self.classes.insert(bytecode.class_name().to_owned(), Arc::new(bytecode));
    }
}

impl ClassResolver for StaticResolver {
    fn resolve(&self, class_name: &str) -> Option<LoadedClass> {
        self.classes.get(class_name).cloned().map(LoadedClass::new)
    }
}

/// Name-resolution walker over a parent resolver, an immutable stack of
/// code layers and, optionally, a [`TopCodeCache`] for ad-hoc sources.
///
/// The layer stack is shared by reference between clones; it never changes
/// after construction. Attached loaders get a fresh resolver whenever the
/// engine publishes new layers.
#[derive(Clone)]
pub struct LayeredResolver {
    parent: Arc<dyn ClassResolver>,
    layers: Arc<[Arc<Code>]>,
    /// Source id to the index of the topmost layer containing it.
    source_layers: HashMap<String, usize>,
    top_cache: Option<Arc<TopCodeCache>>,
    layer_mode: LoadMode,
    top_mode: LoadMode,
}

impl LayeredResolver {
    pub(crate) fn new(
        parent: Arc<dyn ClassResolver>,
        layers: Arc<[Arc<Code>]>,
        top_cache: Option<Arc<TopCodeCache>>,
        layer_mode: LoadMode,
        top_mode: LoadMode,
    ) -> Self {
        let mut source_layers = HashMap::new();
        for (index, code) in layers.iter().enumerate() {
            for source_id in code.source_ids() {
                // Later inserts win, so each id maps to its topmost layer.
                source_layers.insert(source_id.to_owned(), index);
            }
        }
        Self { parent, layers, source_layers, top_cache, layer_mode, top_mode }
    }

    pub fn layer_mode(&self) -> LoadMode {
        self.layer_mode
    }

    pub fn top_mode(&self) -> LoadMode {
        self.top_mode
    }

    /// The shared, immutable layer stack, bottom to top.
    pub fn layers(&self) -> &Arc<[Arc<Code>]> {
        &self.layers
    }

    /// The top code cache this resolver consults for ad-hoc sources.
    pub fn top_cache(&self) -> Option<&Arc<TopCodeCache>> {
        self.top_cache.as_ref()
    }

    /// Resolves a class by name across the parent and the layers, honoring
    /// the layer mode. The top cache only speaks when a source is in hand,
    /// so it is not consulted here.
    pub fn load_class(&self, class_name: &str) -> Result<LoadedClass> {
        let found = match self.layer_mode {
            LoadMode::ParentFirst => {
                self.parent.resolve(class_name).or_else(|| self.find_in_layers(class_name))
            }
            LoadMode::CurrentFirst => {
                self.find_in_layers(class_name).or_else(|| self.parent.resolve(class_name))
            }
        };
        found.ok_or_else(|| LoadError::ClassNotFound(class_name.to_owned()).into())
    }

    /// Loads the entry-point class of the given source.
    pub fn load_main_class(&self, source: &Arc<dyn Source>) -> Result<LoadedClass> {
        self.load_from_source(source, None)
    }

    /// Loads a class the given source declares.
    pub fn load_class_from_source(
        &self,
        source: &Arc<dyn Source>,
        class_name: &str,
    ) -> Result<LoadedClass> {
        self.load_from_source(source, Some(class_name))
    }

    /// New resolver over the same layers, sharing the same top cache.
    pub fn clone_shared(&self) -> Self {
        self.clone()
    }

    /// New resolver over the same layers with a freshly forked, empty top
    /// cache. Parent and mode flags are preserved.
    pub fn clone_with_separate_top_cache(&self) -> Self {
        Self {
            top_cache: self.top_cache.as_ref().map(|cache| Arc::new(cache.fork())),
            ..self.clone()
        }
    }

    fn find_in_layers(&self, class_name: &str) -> Option<LoadedClass> {
        // Top of the stack wins.
        self.layers
            .iter()
            .rev()
            .find_map(|code| code.bytecode_for(class_name))
            .cloned()
            .map(LoadedClass::new)
    }

    fn load_from_source(
        &self,
        source: &Arc<dyn Source>,
        class_name: Option<&str>,
    ) -> Result<LoadedClass> {
        let source_id = source.id();
        let in_layers = self.source_layers.contains_key(source_id);

        match self.top_mode {
            LoadMode::ParentFirst => {
                if in_layers {
                    match self.load_via_layers(source_id, class_name) {
                        Ok(class) => return Ok(class),
                        // The targeted class is not actually defined by the
                        // layered source; let the top cache have a go.
                        Err(error) if self.top_cache.is_some() => {
                            trace!(source = source_id, %error, "layered load missed, trying top cache");
                        }
                        Err(error) => return Err(error),
                    }
                }
                self.load_via_top_cache(source, class_name)
            }
            LoadMode::CurrentFirst => {
                // A source held by the top cache resolves there even if a
                // layer also claims its id; such an overlap is a caller
                // convention violation and is not hidden.
                if self.top_cache.as_ref().is_some_and(|cache| cache.contains(source_id)) {
                    return self.load_via_top_cache(source, class_name);
                }
                if in_layers {
                    return self.load_via_layers(source_id, class_name);
                }
                self.load_via_top_cache(source, class_name)
            }
        }
    }

    fn load_via_layers(&self, source_id: &str, class_name: Option<&str>) -> Result<LoadedClass> {
        let index = self
            .source_layers
            .get(source_id)
            .ok_or_else(|| LoadError::SourceNotFound(source_id.to_owned()))?;
        let info = self.layers[*index]
            .source_info(source_id)
            .ok_or_else(|| LoadError::SourceNotFound(source_id.to_owned()))?;
        let target = match class_name {
            None => info.main_class_name(),
            Some(name) if info.class_names().contains(name) => name,
            Some(name) => {
                return Err(LoadError::ClassNotInSource {
                    class_name: name.to_owned(),
                    source_id: source_id.to_owned(),
                }
                .into())
            }
        };
        self.load_class(target)
    }

    fn load_via_top_cache(
        &self,
        source: &Arc<dyn Source>,
        class_name: Option<&str>,
    ) -> Result<LoadedClass> {
        let source_id = source.id();
        let Some(cache) = &self.top_cache else {
            return Err(LoadError::SourceNotFound(source_id.to_owned()).into());
        };
        let code = cache.get_up_to_date(source)?;
        let info = code
            .source_info(source_id)
            .ok_or_else(|| LoadError::SourceNotFound(source_id.to_owned()))?;
        let target = match class_name {
            None => info.main_class_name(),
            Some(name) if info.class_names().contains(name) => name,
            Some(name) => {
                return Err(LoadError::ClassNotInSource {
                    class_name: name.to_owned(),
                    source_id: source_id.to_owned(),
                }
                .into())
            }
        };
        let bytecode = code
            .bytecode_for(target)
            .cloned()
            .ok_or_else(|| LoadError::ClassNotFound(target.to_owned()))?;
        Ok(LoadedClass::new(bytecode))
    }
}

impl ClassResolver for LayeredResolver {
    /// Name-only resolution, so a `LayeredResolver` can itself serve as the
    /// parent of a top code cache.
    fn resolve(&self, class_name: &str) -> Option<LoadedClass> {
        self.load_class(class_name).ok()
    }
}

impl fmt::Debug for LayeredResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredResolver")
            .field("layers", &self.layers.len())
            .field("layer_mode", &self.layer_mode)
            .field("top_mode", &self.top_mode)
            .field("top_cache", &self.top_cache.is_some())
            .finish_non_exhaustive()
    }
}
