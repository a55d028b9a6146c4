//! Duplicate class-name detection across code layers and the parent
//! resolver.

use crate::{artifacts::Code, resolver::ClassResolver};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Class name to the ordered (bottom-to-top) indices of the layers that
/// define it.
pub type ConflictMap = BTreeMap<String, Vec<usize>>;

/// Class names defined by two or more of the given layers.
pub fn same_names_across_layers(layers: &[Arc<Code>]) -> ConflictMap {
    let mut defining: ConflictMap = BTreeMap::new();
    for (index, code) in layers.iter().enumerate() {
        for class_name in code.class_names() {
            defining.entry(class_name.to_owned()).or_default().push(index);
        }
    }
    defining.retain(|_, layers| layers.len() >= 2);
    defining
}

/// Class names that both the parent resolver and at least one layer define.
///
/// The parent is probed once per distinct class name; a `Some` from
/// [`ClassResolver::resolve`] means the parent defines the name.
pub fn same_names_in_parent_and_layers(
    parent: &dyn ClassResolver,
    layers: &[Arc<Code>],
) -> ConflictMap {
    let mut defining: ConflictMap = BTreeMap::new();
    for (index, code) in layers.iter().enumerate() {
        for class_name in code.class_names() {
            defining.entry(class_name.to_owned()).or_default().push(index);
        }
    }
    defining.retain(|class_name, _| parent.resolve(class_name).is_some());
    defining
}

/// Forbidden duplicate class names found while validating a layer stack.
///
/// Carries the cross-layer map and the parent-vs-layers map; either may be
/// absent, depending on which checks were enabled and which found
/// duplicates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassNameConflict {
    across_layers: Option<ConflictMap>,
    parent_and_layers: Option<ConflictMap>,
}

impl ClassNameConflict {
    /// Empty maps are normalized to `None`.
    pub(crate) fn new(
        across_layers: Option<ConflictMap>,
        parent_and_layers: Option<ConflictMap>,
    ) -> Self {
        Self {
            across_layers: across_layers.filter(|map| !map.is_empty()),
            parent_and_layers: parent_and_layers.filter(|map| !map.is_empty()),
        }
    }

    /// Class names defined by two or more layers.
    pub fn across_layers(&self) -> Option<&ConflictMap> {
        self.across_layers.as_ref()
    }

    /// Class names defined by both the parent and at least one layer.
    pub fn parent_and_layers(&self) -> Option<&ConflictMap> {
        self.parent_and_layers.as_ref()
    }
}

impl fmt::Display for ClassNameConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_map(f: &mut fmt::Formatter<'_>, map: &ConflictMap) -> fmt::Result {
            let mut first = true;
            for (class_name, layers) in map {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                write!(f, "\"{class_name}\" (layers ")?;
                for (i, layer) in layers.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{layer}")?;
                }
                write!(f, ")")?;
            }
            Ok(())
        }

        match (&self.across_layers, &self.parent_and_layers) {
            (None, None) => write!(f, "no class name conflicts"),
            (across, parent) => {
                if let Some(map) = across {
                    write!(f, "duplicate class names across code layers: ")?;
                    write_map(f, map)?;
                }
                if let Some(map) = parent {
                    if self.across_layers.is_some() {
                        write!(f, "; ")?;
                    }
                    write!(f, "class names defined by both the parent and code layers: ")?;
                    write_map(f, map)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ClassNameConflict {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifacts::{Bytecode, CompiledSourceInfo},
        resolver::{EmptyResolver, StaticResolver},
    };
    use pretty_assertions::assert_eq;

    fn layer(source_id: &str, classes: &[&str]) -> Arc<Code> {
        let info =
            CompiledSourceInfo::new(source_id, classes[0], classes.iter().copied(), 0).unwrap();
        let bytecodes = classes
            .iter()
            .map(|c| Bytecode::new(*c, format!("{source_id}/{c}").into_bytes()).unwrap());
        Arc::new(Code::new(source_id, [info], bytecodes).unwrap())
    }

    #[test]
    fn finds_exactly_the_names_defined_by_two_or_more_layers() {
        let layers =
            [layer("s0", &["A", "B"]), layer("s1", &["B", "C"]), layer("s2", &["B", "A"])];
        let map = same_names_across_layers(&layers);

        let expected: ConflictMap =
            [("A".to_owned(), vec![0, 2]), ("B".to_owned(), vec![0, 1, 2])].into_iter().collect();
        assert_eq!(map, expected);
    }

    #[test]
    fn no_duplicates_means_empty_map() {
        let layers = [layer("s0", &["A"]), layer("s1", &["B"])];
        assert!(same_names_across_layers(&layers).is_empty());
        assert!(same_names_across_layers(&[]).is_empty());
    }

    #[test]
    fn parent_conflicts_are_restricted_to_names_the_parent_defines() {
        let parent = StaticResolver::new([
            Bytecode::new("B", b"host".to_vec()).unwrap(),
            Bytecode::new("Z", b"host".to_vec()).unwrap(),
        ]);
        let layers = [layer("s0", &["A", "B"]), layer("s1", &["B"])];

        let map = same_names_in_parent_and_layers(&parent, &layers);
        let expected: ConflictMap = [("B".to_owned(), vec![0, 1])].into_iter().collect();
        assert_eq!(map, expected);

        assert!(same_names_in_parent_and_layers(&EmptyResolver, &layers).is_empty());
    }

    #[test]
    fn conflict_display_lists_names_and_layers() {
        let across: ConflictMap = [("Util".to_owned(), vec![0, 1])].into_iter().collect();
        let conflict = ClassNameConflict::new(Some(across), Some(BTreeMap::new()));

        assert_eq!(conflict.parent_and_layers(), None);
        assert_eq!(
            conflict.to_string(),
            "duplicate class names across code layers: \"Util\" (layers 0, 1)"
        );
    }
}
