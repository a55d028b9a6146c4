#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{CompileError, EngineError, LoadError, Result};

pub mod artifacts;
pub use artifacts::{Bytecode, Code, CompiledSourceInfo};

pub mod sources;
pub use sources::{MemorySource, Source};

pub mod compilers;
pub use compilers::Compiler;

pub mod conflict;
pub use conflict::{ClassNameConflict, ConflictMap};

pub mod cache;
pub use cache::{TopCodeCache, TopCodeCacheBuilder};

pub mod resolver;
pub use resolver::{
    ClassResolver, EmptyResolver, LayeredResolver, LoadMode, LoadedClass, StaticResolver,
};

mod loader;
pub use loader::Loader;

use crate::loader::LoaderInner;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

/// The default parent resolver: defines nothing.
static DEFAULT_PARENT: Lazy<Arc<dyn ClassResolver>> = Lazy::new(|| Arc::new(EmptyResolver));

/// Engine ids double as capability tags on loaders, so they are unique for
/// the life of the process.
static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(0);

/// Orchestrates loader lifecycles and atomic layer replacement.
///
/// The engine hands out [`Loader`]s, keeps every *attached* loader's
/// resolver in step with the current layer stack, and leaves *detached*
/// loaders pinned to the stack they were created over. A single
/// readers-writer lock sequences layer updates against in-flight loads:
/// loads run under the read lock against a snapshot resolver, and once
/// [`set_code_layers`](Self::set_code_layers) returns, every subsequent
/// load on an attached loader observes the new stack.
pub struct LayeredEngine {
    id: u64,
    parent: Arc<dyn ClassResolver>,
    layer_mode: LoadMode,
    top_mode: LoadMode,
    allow_same_names_across_layers: bool,
    allow_same_names_in_parent_and_layers: bool,
    compiler: Arc<dyn Compiler>,
    top_cache: Option<Arc<TopCodeCache>>,
    default_loader: Loader,
    state: RwLock<EngineState>,
}

struct EngineState {
    layers: Arc<[Arc<Code>]>,
    /// Weakly-held attached loaders, the default loader included. Swept on
    /// writer operations.
    attached: Vec<Weak<LoaderInner>>,
    next_loader_number: u64,
}

impl EngineState {
    fn sweep(&mut self) {
        self.attached.retain(|weak| weak.strong_count() > 0);
    }
}

impl LayeredEngine {
    /// Convenience function to call `EngineBuilder::default()`.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// The engine's always-attached default loader (number 0). Its identity
    /// never changes over the engine's life.
    pub fn default_loader(&self) -> Loader {
        self.default_loader.clone()
    }

    pub fn layer_mode(&self) -> LoadMode {
        self.layer_mode
    }

    pub fn top_mode(&self) -> LoadMode {
        self.top_mode
    }

    /// The shared top code cache, if one was enabled at build time.
    pub fn top_cache(&self) -> Option<&Arc<TopCodeCache>> {
        self.top_cache.as_ref()
    }

    pub fn layer_count(&self) -> usize {
        self.state.read().layers.len()
    }

    /// A new loader that will receive future
    /// [`set_code_layers`](Self::set_code_layers) updates. It shares the
    /// engine's top code cache.
    pub fn new_attached_loader(&self) -> Loader {
        let mut state = self.state.write();
        state.sweep();
        let number = state.next_loader_number;
        state.next_loader_number += 1;
        let loader = Loader::new(self.id, number, true, self.default_loader.resolver());
        state.attached.push(loader.downgrade());
        debug!(engine = self.id, loader = number, "created attached loader");
        loader
    }

    /// A new loader pinned to the current layer stack, with its own empty
    /// top code cache. Future layer updates will not touch it.
    pub fn new_detached_loader(&self) -> Loader {
        let mut state = self.state.write();
        state.sweep();
        let number = state.next_loader_number;
        state.next_loader_number += 1;
        let resolver =
            Arc::new(self.default_loader.resolver().clone_with_separate_top_cache());
        debug!(engine = self.id, loader = number, "created detached loader");
        Loader::new(self.id, number, false, resolver)
    }

    /// Resolves a class by name through the given loader.
    pub fn load_class(&self, loader: &Loader, class_name: &str) -> Result<LoadedClass> {
        self.check_loader(loader)?;
        let _guard = self.state.read();
        loader.resolver().load_class(class_name)
    }

    /// Loads the entry-point class of the given source through the given
    /// loader, compiling through the top cache if the source is not part of
    /// any layer.
    pub fn load_main_class(&self, loader: &Loader, source: &Arc<dyn Source>) -> Result<LoadedClass> {
        self.check_loader(loader)?;
        let _guard = self.state.read();
        loader.resolver().load_main_class(source)
    }

    /// Loads a class declared by the given source through the given loader.
    pub fn load_class_from_source(
        &self,
        loader: &Loader,
        source: &Arc<dyn Source>,
        class_name: &str,
    ) -> Result<LoadedClass> {
        self.check_loader(loader)?;
        let _guard = self.state.read();
        loader.resolver().load_class_from_source(source, class_name)
    }

    /// Atomically replaces the layer stack.
    ///
    /// Conflict checks run before any mutation, so a failure leaves the
    /// engine exactly as it was. On success every attached loader gets a
    /// resolver over the new stack, and the top cache's parent is repointed
    /// at the default loader's new resolver.
    #[instrument(skip_all, name = "engine::set_code_layers", fields(engine = self.id, layers = layers.len()))]
    pub fn set_code_layers(&self, layers: Vec<Code>) -> Result<()> {
        let layers: Vec<Arc<Code>> = layers.into_iter().map(Arc::new).collect();

        let mut state = self.state.write();

        let across_layers = (!self.allow_same_names_across_layers)
            .then(|| conflict::same_names_across_layers(&layers));
        let parent_and_layers = (!self.allow_same_names_in_parent_and_layers)
            .then(|| conflict::same_names_in_parent_and_layers(&*self.parent, &layers));
        let conflict = ClassNameConflict::new(across_layers, parent_and_layers);
        if conflict.across_layers().is_some() || conflict.parent_and_layers().is_some() {
            debug!(%conflict, "rejecting code layers");
            return Err(conflict.into());
        }

        let layers: Arc<[Arc<Code>]> = layers.into();
        let resolver = Arc::new(LayeredResolver::new(
            self.parent.clone(),
            layers.clone(),
            self.top_cache.clone(),
            self.layer_mode,
            self.top_mode,
        ));

        state.layers = layers;
        state.sweep();
        for inner in state.attached.iter().filter_map(Weak::upgrade) {
            inner.set_resolver(resolver.clone());
        }
        if let Some(cache) = &self.top_cache {
            cache.set_parent(resolver);
        }
        debug!("published new code layers");
        Ok(())
    }

    /// Compiles each source bundle into one layer (bottom to top) and
    /// publishes the result via [`set_code_layers`](Self::set_code_layers).
    ///
    /// Bundles compile in parallel against the engine parent. A compile
    /// failure propagates and leaves the engine unchanged.
    pub fn set_code_layers_by_source(&self, bundles: Vec<Vec<Arc<dyn Source>>>) -> Result<()> {
        if bundles.iter().any(Vec::is_empty) {
            return Err(EngineError::invalid_argument(
                "code layer source bundles must not be empty",
            ));
        }
        let codes = bundles
            .par_iter()
            .map(|bundle| self.compiler.compile(&*self.parent, bundle))
            .collect::<std::result::Result<Vec<_>, CompileError>>()?;
        self.set_code_layers(codes)
    }

    fn check_loader(&self, loader: &Loader) -> Result<()> {
        if loader.engine_id() != self.id {
            return Err(EngineError::invalid_state(format!(
                "loader {} was not created by this engine",
                loader.number()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for LayeredEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredEngine")
            .field("id", &self.id)
            .field("layer_mode", &self.layer_mode)
            .field("top_mode", &self.top_mode)
            .field("layers", &self.layer_count())
            .field("top_cache", &self.top_cache.is_some())
            .finish_non_exhaustive()
    }
}

/// Configures a [`LayeredEngine`].
///
/// Setters take the builder by value and [`build`](Self::build) consumes
/// it, so a committed builder cannot be reused.
///
/// Defaults: no parent (nothing resolves outside the engine),
/// `layer_mode = CurrentFirst`, `top_mode = ParentFirst`, top cache
/// enabled, duplicate class names allowed.
pub struct EngineBuilder {
    parent: Option<Arc<dyn ClassResolver>>,
    layer_mode: LoadMode,
    top_mode: LoadMode,
    with_top_cache: bool,
    allow_same_names_across_layers: bool,
    allow_same_names_in_parent_and_layers: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            parent: None,
            layer_mode: LoadMode::CurrentFirst,
            top_mode: LoadMode::ParentFirst,
            with_top_cache: true,
            allow_same_names_across_layers: true,
            allow_same_names_in_parent_and_layers: true,
        }
    }
}

impl EngineBuilder {
    /// The parent resolver every loader delegates to.
    #[must_use]
    pub fn parent(mut self, parent: Arc<dyn ClassResolver>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Resolution order between the parent and the layer stack.
    #[must_use]
    pub fn layer_mode(mut self, layer_mode: LoadMode) -> Self {
        self.layer_mode = layer_mode;
        self
    }

    /// Resolution order between the combined parent-plus-layers view and
    /// the top code cache.
    #[must_use]
    pub fn top_mode(mut self, top_mode: LoadMode) -> Self {
        self.top_mode = top_mode;
        self
    }

    /// Whether the engine serves ad-hoc sources through a top code cache.
    #[must_use]
    pub fn with_top_cache(mut self, with_top_cache: bool) -> Self {
        self.with_top_cache = with_top_cache;
        self
    }

    #[must_use]
    pub fn allow_same_names_across_layers(mut self, allow: bool) -> Self {
        self.allow_same_names_across_layers = allow;
        self
    }

    #[must_use]
    pub fn allow_same_names_in_parent_and_layers(mut self, allow: bool) -> Self {
        self.allow_same_names_in_parent_and_layers = allow;
        self
    }

    pub fn build<C: Compiler>(self, compiler: C) -> Result<LayeredEngine> {
        let compiler: Arc<dyn Compiler> = Arc::new(compiler);
        let parent = self.parent.unwrap_or_else(|| DEFAULT_PARENT.clone());
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);

        let top_cache = self
            .with_top_cache
            .then(|| Arc::new(TopCodeCache::builder().build(compiler.clone())));

        let layers: Arc<[Arc<Code>]> = Vec::new().into();
        let resolver = Arc::new(LayeredResolver::new(
            parent.clone(),
            layers.clone(),
            top_cache.clone(),
            self.layer_mode,
            self.top_mode,
        ));
        let default_loader = Loader::new(id, 0, true, resolver.clone());
        if let Some(cache) = &top_cache {
            cache.set_parent(resolver);
        }

        debug!(engine = id, "built layered engine");
        Ok(LayeredEngine {
            id,
            parent,
            layer_mode: self.layer_mode,
            top_mode: self.top_mode,
            allow_same_names_across_layers: self.allow_same_names_across_layers,
            allow_same_names_in_parent_and_layers: self.allow_same_names_in_parent_and_layers,
            compiler,
            top_cache,
            state: RwLock::new(EngineState {
                layers,
                attached: vec![default_loader.downgrade()],
                next_loader_number: 1,
            }),
            default_loader,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Treats source text as a whitespace-separated class list; the first
    /// name is the main class.
    #[derive(Clone, Debug, Default)]
    struct ListCompiler;

    impl Compiler for ListCompiler {
        fn compile(
            &self,
            _parent: &dyn ClassResolver,
            sources: &[Arc<dyn Source>],
        ) -> std::result::Result<Code, CompileError> {
            let mut infos = Vec::new();
            let mut bytecodes = Vec::new();
            let mut ids = Vec::new();
            for source in sources {
                let text = source.text().unwrap_or_default();
                let classes: Vec<&str> = text.split_whitespace().collect();
                if classes.is_empty() {
                    return Err(CompileError::new(source.id(), "no classes declared"));
                }
                let stamp = source.modification_stamp();
                for class in &classes {
                    bytecodes.push(
                        Bytecode::new(*class, format!("{}/{class}", source.id()).into_bytes())
                            .map_err(|e| CompileError::new(source.id(), e.to_string()))?,
                    );
                }
                infos.push(
                    CompiledSourceInfo::new(source.id(), classes[0], classes.clone(), stamp)
                        .map_err(|e| CompileError::new(source.id(), e.to_string()))?,
                );
                ids.push(source.id().to_owned());
            }
            Code::new(ids.join("+"), infos, bytecodes)
                .map_err(|e| CompileError::new(ids.join("+"), e.to_string()))
        }
    }

    fn engine() -> LayeredEngine {
        LayeredEngine::builder().build(ListCompiler).unwrap()
    }

    fn src(id: &str, text: &str) -> Arc<dyn Source> {
        Arc::new(MemorySource::new(id, text).unwrap())
    }

    fn bytes_of(class: &LoadedClass) -> &str {
        std::str::from_utf8(class.bytecode().bytes()).unwrap()
    }

    #[test]
    fn builder_applies_documented_defaults() {
        let engine = engine();
        assert_eq!(engine.layer_mode(), LoadMode::CurrentFirst);
        assert_eq!(engine.top_mode(), LoadMode::ParentFirst);
        assert!(engine.top_cache().is_some());
        assert_eq!(engine.layer_count(), 0);
        assert_eq!(engine.default_loader().number(), 0);
        assert!(engine.default_loader().is_attached());
    }

    #[test]
    fn attached_loaders_observe_published_layers() {
        let engine = engine();
        let before = engine.new_attached_loader();

        engine
            .set_code_layers_by_source(vec![vec![src("s0", "A")], vec![src("s1", "B")]])
            .unwrap();
        let after = engine.new_attached_loader();

        for loader in [&engine.default_loader(), &before, &after] {
            assert_eq!(bytes_of(&engine.load_class(loader, "A").unwrap()), "s0/A");
            assert_eq!(bytes_of(&engine.load_class(loader, "B").unwrap()), "s1/B");
        }
        assert_eq!(engine.layer_count(), 2);
    }

    #[test]
    fn conflicting_layers_are_rejected_without_side_effects() {
        let engine = LayeredEngine::builder()
            .allow_same_names_across_layers(false)
            .build(ListCompiler)
            .unwrap();
        engine.set_code_layers_by_source(vec![vec![src("s0", "X")]]).unwrap();

        let err = engine
            .set_code_layers_by_source(vec![vec![src("s1", "A B")], vec![src("s2", "A C")]])
            .unwrap_err();
        let EngineError::NameConflict(conflict) = err else {
            panic!("expected a name conflict, got {err:?}");
        };
        let across = conflict.across_layers().unwrap();
        assert_eq!(across.get("A"), Some(&vec![0, 1]));
        assert_eq!(conflict.parent_and_layers(), None);

        // The previous stack is still in place.
        let loader = engine.default_loader();
        assert!(engine.load_class(&loader, "X").is_ok());
        assert!(engine.load_class(&loader, "A").is_err());
        assert_eq!(engine.layer_count(), 1);
    }

    #[test]
    fn parent_conflicts_are_rejected_when_disallowed() {
        let parent = StaticResolver::new([Bytecode::new("A", b"host".to_vec()).unwrap()]);
        let engine = LayeredEngine::builder()
            .parent(Arc::new(parent))
            .allow_same_names_in_parent_and_layers(false)
            .build(ListCompiler)
            .unwrap();

        let err = engine.set_code_layers_by_source(vec![vec![src("s0", "A")]]).unwrap_err();
        let EngineError::NameConflict(conflict) = err else {
            panic!("expected a name conflict, got {err:?}");
        };
        assert_eq!(conflict.across_layers(), None);
        assert_eq!(conflict.parent_and_layers().unwrap().get("A"), Some(&vec![0]));
    }

    #[test]
    fn detached_loaders_are_pinned_to_their_stack() {
        let engine = engine();
        engine.set_code_layers_by_source(vec![vec![src("s0", "X")]]).unwrap();

        let detached = engine.new_detached_loader();
        assert!(!detached.is_attached());

        engine.set_code_layers_by_source(vec![vec![src("s1", "X")]]).unwrap();

        assert_eq!(bytes_of(&engine.load_class(&detached, "X").unwrap()), "s0/X");
        assert_eq!(
            bytes_of(&engine.load_class(&engine.default_loader(), "X").unwrap()),
            "s1/X"
        );
    }

    #[test]
    fn loaders_from_another_engine_are_refused() {
        let first = engine();
        let second = engine();
        let foreign = first.default_loader();

        let err = second.load_class(&foreign, "A").unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert!(err.to_string().contains("not created by this engine"));
    }

    #[test]
    fn empty_source_bundles_are_invalid() {
        let engine = engine();
        let err = engine.set_code_layers_by_source(vec![Vec::new()]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn without_a_top_cache_ad_hoc_sources_fail() {
        let engine =
            LayeredEngine::builder().with_top_cache(false).build(ListCompiler).unwrap();
        let loader = engine.default_loader();

        let err = engine.load_main_class(&loader, &src("adhoc", "A")).unwrap_err();
        assert!(matches!(err, EngineError::Load(LoadError::SourceNotFound(_))));
    }

    #[test]
    fn ad_hoc_sources_resolve_through_the_top_cache() {
        let engine = engine();
        let loader = engine.default_loader();
        let script = src("adhoc", "A B");

        let main = engine.load_main_class(&loader, &script).unwrap();
        assert_eq!(main.class_name(), "A");

        let named = engine.load_class_from_source(&loader, &script, "B").unwrap();
        assert_eq!(named.class_name(), "B");

        let err = engine.load_class_from_source(&loader, &script, "C").unwrap_err();
        assert!(matches!(err, EngineError::Load(LoadError::ClassNotInSource { .. })));
    }

    #[test]
    fn dropped_attached_loaders_are_swept() {
        let engine = engine();
        let kept = engine.new_attached_loader();
        for _ in 0..4 {
            let _ = engine.new_attached_loader();
        }

        // The write path sweeps dead weak references; the default loader
        // and `kept` survive.
        engine.set_code_layers_by_source(vec![vec![src("s0", "A")]]).unwrap();
        assert_eq!(engine.state.read().attached.len(), 2);
        assert!(engine.load_class(&kept, "A").is_ok());
    }
}
