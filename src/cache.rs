//! On-demand compilation cache for sources outside the layer stack.

use crate::{
    artifacts::Code,
    compilers::Compiler,
    error::{CompileError, Result},
    resolver::{ClassResolver, EmptyResolver},
    sources::Source,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::{collections::HashMap, fmt, sync::Arc};

/// Compile-on-demand cache for ad-hoc sources that are not part of any code
/// layer.
///
/// Entries are keyed by source id and stamped with the source's modification
/// stamp at compile time; a stamp mismatch on lookup triggers a recompile
/// that replaces the entry. Concurrent lookups for the same source id
/// compile at most once: the first caller performs the compilation while the
/// others wait for its outcome and share it, errors included. Lookups for
/// different ids compile in parallel. The cache never evicts on its own;
/// [`clear`](Self::clear) drops everything.
pub struct TopCodeCache {
    compiler: Arc<dyn Compiler>,
    parent: RwLock<Arc<dyn ClassResolver>>,
    entries: Mutex<HashMap<String, Entry>>,
}

enum Entry {
    /// A compilation for this source id is in progress.
    InFlight(Arc<Flight>),
    /// A finished compilation, valid while the stamp matches.
    Ready { stamp: u64, code: Arc<Code> },
}

type CompileOutcome = std::result::Result<Arc<Code>, CompileError>;

/// Single-flight slot: the compiling caller publishes the outcome, everyone
/// else blocks on it.
#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<CompileOutcome>>,
    done: Condvar,
}

impl Flight {
    fn wait(&self) -> CompileOutcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut outcome);
        }
    }

    fn complete(&self, result: CompileOutcome) {
        *self.outcome.lock() = Some(result);
        self.done.notify_all();
    }
}

impl TopCodeCache {
    pub fn builder() -> TopCodeCacheBuilder {
        TopCodeCacheBuilder::default()
    }

    /// Returns a [`Code`] whose compile-time stamp equals the source's
    /// current modification stamp, compiling on demand.
    ///
    /// A compile failure caches nothing; the next call retries.
    pub fn get_up_to_date(&self, source: &Arc<dyn Source>) -> Result<Arc<Code>> {
        let id = source.id();
        let stamp = source.modification_stamp();

        enum Step {
            Hit(Arc<Code>),
            Await(Arc<Flight>),
            Compile(Arc<Flight>),
        }

        let step = {
            let mut entries = self.entries.lock();
            match entries.get(id) {
                Some(Entry::Ready { stamp: cached, code }) if *cached == stamp => {
                    Step::Hit(code.clone())
                }
                Some(Entry::InFlight(flight)) => Step::Await(flight.clone()),
                _ => {
                    let flight = Arc::new(Flight::default());
                    entries.insert(id.to_owned(), Entry::InFlight(flight.clone()));
                    Step::Compile(flight)
                }
            }
        };

        match step {
            Step::Hit(code) => {
                trace!(source = id, "top code cache hit");
                Ok(code)
            }
            Step::Await(flight) => {
                trace!(source = id, "awaiting in-flight compilation");
                flight.wait().map_err(Into::into)
            }
            Step::Compile(flight) => self.compile(source, stamp, &flight),
        }
    }

    fn compile(&self, source: &Arc<dyn Source>, stamp: u64, flight: &Flight) -> Result<Arc<Code>> {
        debug!(source = source.id(), stamp, "compiling ad-hoc source");
        let parent = self.parent.read().clone();
        let result = self.compiler.compile(&*parent, std::slice::from_ref(source)).map(Arc::new);

        {
            let mut entries = self.entries.lock();
            match &result {
                Ok(code) => {
                    entries.insert(
                        source.id().to_owned(),
                        Entry::Ready { stamp, code: code.clone() },
                    );
                }
                Err(error) => {
                    // Nothing negative is cached; the next call retries.
                    debug!(source = source.id(), %error, "ad-hoc compilation failed");
                    entries.remove(source.id());
                }
            }
        }

        flight.complete(result.clone());
        result.map_err(Into::into)
    }

    /// Whether the cache currently holds an entry (ready or in flight) for
    /// the given source id.
    pub fn contains(&self, source_id: &str) -> bool {
        self.entries.lock().contains_key(source_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops every cached entry. In-flight compilations still complete and
    /// re-enter the cache as fresh results.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Swaps the parent resolver used by subsequent compilations.
    ///
    /// Compilations already in flight may finish against the old parent.
    pub fn set_parent(&self, parent: Arc<dyn ClassResolver>) {
        *self.parent.write() = parent;
    }

    /// A new, empty cache sharing this one's compiler and current parent.
    pub fn fork(&self) -> Self {
        Self {
            compiler: self.compiler.clone(),
            parent: RwLock::new(self.parent.read().clone()),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl fmt::Debug for TopCodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopCodeCache").field("entries", &self.len()).finish_non_exhaustive()
    }
}

/// Configures a [`TopCodeCache`].
///
/// The builder is committed by [`build`](Self::build), which takes it by
/// value; a committed builder cannot be touched again.
#[derive(Default)]
pub struct TopCodeCacheBuilder {
    parent: Option<Arc<dyn ClassResolver>>,
}

impl TopCodeCacheBuilder {
    /// Parent resolver handed to compilations. Defaults to a resolver that
    /// defines nothing.
    #[must_use]
    pub fn parent(mut self, parent: Arc<dyn ClassResolver>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn build(self, compiler: Arc<dyn Compiler>) -> TopCodeCache {
        TopCodeCache {
            compiler,
            parent: RwLock::new(self.parent.unwrap_or_else(|| Arc::new(EmptyResolver))),
            entries: Mutex::new(HashMap::new()),
        }
    }
}
