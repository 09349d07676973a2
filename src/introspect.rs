//! Capability introspection of the native library.
//!
//! At startup the library's self-description is classified into adapter
//! kinds: one per exposed class, plus the free functions and the enum
//! definition table. Classification is data driven (ancestry markers in the
//! descriptor), never reflective, and a class that matches zero or multiple
//! kinds is a startup-fatal configuration error rather than a runtime fault.

use std::collections::BTreeMap;

use crate::error::{RpcError, RpcResult};
use crate::native::{ClassDescriptor, LibraryDescriptor};

/// Library members never exposed to remote clients: internal base classes,
/// deprecated hooks, and frontend/licensing setters.
pub const EXCLUDED_LIBRARY_MEMBERS: &[&str] = &[
    "TimeTaggerBase",
    "IteratorBase",
    "Iterator",
    "FlimAbstract",
    "TimeTaggerVirtual",
    "createTimeTaggerVirtual",
    "CustomMeasurement",
    "CustomMeasurementBase",
    "CustomMeasurementBase_stop_all_custom_measurements",
    "TimeTagStream",
    "FileReader",
    "TimeTagStreamBuffer",
    "setLogger",
    "setCustomBitFileName",
    "hasTimeTaggerVirtualLicense",
    "setFrontend",
    "setLanguageInfo",
    "flashLicense",
];

/// Measurement members that must not be forwarded (blocking waits would pin
/// a serving thread).
pub const EXCLUDED_ITERATOR_ATTRIBUTES: &[&str] = &["waitUntilFinished"];

/// Tagger members that must not be forwarded.
pub const EXCLUDED_TAGGER_ATTRIBUTES: &[&str] = &["factoryAccess"];

/// Pre-enum SDK classes exposing their variants as public attributes. They
/// classify as enums with a bounded-integer representation.
pub const LEGACY_ENUM_CLASSES: &[&str] = &["Resolution", "CoincidenceTimestamp", "ChannelEdge"];

/// Ancestry marker of measurement/virtual-channel classes.
pub const ITERATOR_BASE: &str = "IteratorBase";
/// Ancestry marker of device-handle classes.
pub const TAGGER_BASE: &str = "TimeTaggerBase";
/// Exact name of the synchronized-measurement coordinator class.
pub const SYNCHRONIZED_GROUP: &str = "SynchronizedMeasurements";
/// Ancestry marker of measurement snapshot classes.
pub const DATA_OBJECT_BASE: &str = "DataObjectBase";

/// Representation assigned to legacy attribute-style enums.
const LEGACY_ENUM_REPRESENTATION: &str = "IntEnum";

/// Root members defined by the bridge itself; free functions with these
/// names are never forwarded.
const ROOT_RESERVED: &[&str] = &["freeTimeTagger", "enum_definitions"];

/// The adapter kind discovered for a native class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Tagger,
    Iterator,
    SynchronizedGroup,
    DataObject,
    Enum,
}

impl AdapterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AdapterKind::Tagger => "Tagger",
            AdapterKind::Iterator => "Iterator",
            AdapterKind::SynchronizedGroup => "SynchronizedGroup",
            AdapterKind::DataObject => "DataObject",
            AdapterKind::Enum => "Enum",
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enumeration definition served to clients so they can reconstruct the
/// type locally. Immutable once computed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumDef {
    /// Underlying representation kind, e.g. "IntEnum".
    pub representation: String,
    /// Ordered (label, value) pairs.
    pub variants: Vec<(String, i64)>,
}

/// The classified API surface consumed by the adapter factory.
#[derive(Debug, Default)]
pub struct ApiSurface {
    pub taggers: Vec<ClassDescriptor>,
    pub iterators: Vec<ClassDescriptor>,
    pub groups: Vec<ClassDescriptor>,
    pub data_objects: Vec<ClassDescriptor>,
    pub functions: Vec<String>,
    pub enums: BTreeMap<String, EnumDef>,
}

/// True for members that must never be exposed: denylisted names and
/// anything private by convention.
fn excluded(name: &str) -> bool {
    name.starts_with('_') || EXCLUDED_LIBRARY_MEMBERS.contains(&name)
}

/// Enum ancestry check; returns the representation kind on a match.
fn enum_representation(class: &ClassDescriptor) -> Option<&str> {
    class
        .bases
        .iter()
        .find(|base| base.as_str() == "Enum" || base.ends_with("Enum") || base.as_str() == "Flag")
        .map(String::as_str)
}

/// Classifies every exported class and function of the native library.
///
/// Rules, in priority order: denylist/underscore exclusion; ancestry markers
/// (one kind each for iterator, tagger, group, data object, enum); the
/// legacy enum compatibility list. A surviving class that matches zero or
/// more than one kind is a configuration error.
pub fn classify(lib: &LibraryDescriptor) -> RpcResult<ApiSurface> {
    let mut surface = ApiSurface::default();

    for class in &lib.classes {
        if excluded(&class.name) {
            tracing::debug!(class = %class.name, "skipping excluded class");
            continue;
        }

        let mut matches: Vec<AdapterKind> = Vec::new();
        if class.bases.iter().any(|b| b == ITERATOR_BASE) {
            matches.push(AdapterKind::Iterator);
        }
        if class.bases.iter().any(|b| b == TAGGER_BASE) {
            matches.push(AdapterKind::Tagger);
        }
        if class.name == SYNCHRONIZED_GROUP {
            matches.push(AdapterKind::SynchronizedGroup);
        }
        if class.bases.iter().any(|b| b == DATA_OBJECT_BASE) {
            matches.push(AdapterKind::DataObject);
        }
        let representation = enum_representation(class);
        if representation.is_some() {
            matches.push(AdapterKind::Enum);
        }

        match matches.as_slice() {
            [AdapterKind::Iterator] => surface.iterators.push(class.clone()),
            [AdapterKind::Tagger] => surface.taggers.push(class.clone()),
            [AdapterKind::SynchronizedGroup] => surface.groups.push(class.clone()),
            [AdapterKind::DataObject] => surface.data_objects.push(class.clone()),
            [AdapterKind::Enum] => {
                if !class.enum_variants.is_empty() {
                    surface.enums.insert(
                        class.name.clone(),
                        EnumDef {
                            representation: representation.unwrap_or_default().to_string(),
                            variants: class.enum_variants.clone(),
                        },
                    );
                }
            }
            [] if LEGACY_ENUM_CLASSES.contains(&class.name.as_str()) => {
                let variants: Vec<(String, i64)> = class
                    .enum_variants
                    .iter()
                    .filter(|(label, _)| !label.starts_with('_'))
                    .cloned()
                    .collect();
                if !variants.is_empty() && !surface.enums.contains_key(&class.name) {
                    surface.enums.insert(
                        class.name.clone(),
                        EnumDef {
                            representation: LEGACY_ENUM_REPRESENTATION.to_string(),
                            variants,
                        },
                    );
                }
            }
            [] => {
                return Err(RpcError::Classification(format!(
                    "class '{}' matches no adapter kind",
                    class.name
                )))
            }
            many => {
                let kinds: Vec<&str> = many.iter().map(|k| k.as_str()).collect();
                return Err(RpcError::Classification(format!(
                    "class '{}' matches multiple adapter kinds: {}",
                    class.name,
                    kinds.join(", ")
                )));
            }
        }
    }

    // Factory functions are claimed by the tagger constructors; reserved
    // names collide with members the root adapter defines itself.
    let claimed: Vec<String> = surface
        .taggers
        .iter()
        .map(|t| format!("create{}", t.name))
        .collect();
    for function in &lib.functions {
        if excluded(function)
            || ROOT_RESERVED.contains(&function.as_str())
            || claimed.contains(function)
        {
            tracing::debug!(function = %function, "skipping excluded function");
            continue;
        }
        surface.functions.push(function.clone());
    }

    tracing::info!(
        taggers = surface.taggers.len(),
        iterators = surface.iterators.len(),
        groups = surface.groups.len(),
        data_objects = surface.data_objects.len(),
        functions = surface.functions.len(),
        enums = surface.enums.len(),
        "classified native library surface"
    );
    Ok(surface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::sim::SimLibrary;
    use crate::native::NativeLibrary;

    #[test]
    fn test_classify_sim_library() {
        let surface = classify(&SimLibrary::new().descriptor()).unwrap();

        let tagger_names: Vec<&str> = surface.taggers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(tagger_names, ["TimeTagger"], "denylisted taggers skipped");

        let iterator_names: Vec<&str> =
            surface.iterators.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(iterator_names, ["Countrate", "Correlation", "DelayedChannel"]);

        assert_eq!(surface.groups.len(), 1);
        assert_eq!(surface.data_objects.len(), 2);
    }

    #[test]
    fn test_classify_skips_denylisted_and_claimed_functions() {
        let surface = classify(&SimLibrary::new().descriptor()).unwrap();
        assert_eq!(surface.functions, ["scanTimeTagger", "getVersion"]);
    }

    #[test]
    fn test_classify_enums_including_legacy() {
        let surface = classify(&SimLibrary::new().descriptor()).unwrap();
        let edge = &surface.enums["ChannelEdge"];
        assert_eq!(edge.representation, "IntEnum");
        assert_eq!(edge.variants[0], ("Rising".to_string(), 0));

        let resolution = &surface.enums["Resolution"];
        assert_eq!(resolution.representation, "IntEnum");
        assert_eq!(resolution.variants.len(), 4);
        assert!(surface.enums.contains_key("CoincidenceTimestamp"));
    }

    #[test]
    fn test_ambiguous_class_is_fatal() {
        let lib = LibraryDescriptor {
            classes: vec![ClassDescriptor::new(
                "Chimera",
                &[ITERATOR_BASE, TAGGER_BASE],
            )],
            functions: vec![],
        };
        let err = classify(&lib).unwrap_err();
        assert!(matches!(err, RpcError::Classification(_)));
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_unmatched_class_is_fatal() {
        let lib = LibraryDescriptor {
            classes: vec![ClassDescriptor::new("Orphan", &[])],
            functions: vec![],
        };
        let err = classify(&lib).unwrap_err();
        assert!(err.to_string().contains("no adapter kind"));
    }

    #[test]
    fn test_empty_enum_is_skipped() {
        let lib = LibraryDescriptor {
            classes: vec![ClassDescriptor::new("Hollow", &["IntEnum"])],
            functions: vec![],
        };
        let surface = classify(&lib).unwrap();
        assert!(surface.enums.is_empty());
    }
}
