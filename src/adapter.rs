//! Forwarding adapters over native objects.
//!
//! One [`Adapter`] wraps one exclusively-owned native handle and gives it a
//! remote identity. There is no generated type per native class: an adapter
//! carries its [`AdapterKind`] tag plus a [`ClassSpec`] member table built at
//! startup, and [`LibraryAdapter`] dispatches members against that table.
//!
//! [`LibraryAdapter`] is also the root object clients talk to first: it owns
//! the constructors for every discovered tagger/iterator class, the
//! synchronized-group constructor, the pass-through free functions, the enum
//! definition table, and the explicit `freeTimeTagger` teardown entry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{RpcError, RpcResult};
use crate::introspect::{
    AdapterKind, ApiSurface, EnumDef, EXCLUDED_ITERATOR_ATTRIBUTES, EXCLUDED_TAGGER_ATTRIBUTES,
};
use crate::native::{ClassDescriptor, NativeHandle, NativeLibrary};
use crate::registry::Registry;
use crate::value::{ObjectRef, Value};

/// Well-known identity of the root library object.
pub const ROOT_OBJECT_ID: &str = "TimeTagger";

/// The members of one native class that are exposed remotely, fixed at
/// startup by the adapter factory.
#[derive(Debug)]
pub struct ClassSpec {
    pub name: String,
    pub methods: BTreeSet<String>,
    pub properties: BTreeSet<String>,
    /// Snapshot spec for iterator classes exposing `getDataObject`.
    pub data_object: Option<Arc<ClassSpec>>,
}

fn member_exposed(name: &str, excluded: &[&str]) -> bool {
    // `this*` filters the binding-generator artifacts on snapshot classes.
    !name.starts_with('_') && !name.starts_with("this") && !excluded.contains(&name)
}

fn build_spec(
    class: &ClassDescriptor,
    excluded: &[&str],
    data_object: Option<Arc<ClassSpec>>,
) -> Arc<ClassSpec> {
    Arc::new(ClassSpec {
        name: class.name.clone(),
        methods: class
            .methods
            .iter()
            .filter(|m| member_exposed(m, excluded))
            .cloned()
            .collect(),
        properties: class
            .properties
            .iter()
            .filter(|p| member_exposed(p, excluded))
            .cloned()
            .collect(),
        data_object,
    })
}

/// A server-tracked wrapper giving one native object a remote identity.
///
/// The handle is `Some` from construction until `close`, then permanently
/// `None`. Member calls lock the handle for the duration of the native call,
/// so access to one remote object is serialized as a side effect of
/// exclusive ownership; the native library's own thread-safety contract for
/// anything beyond that is not this layer's concern.
#[derive(Debug)]
pub struct Adapter {
    id: String,
    kind: AdapterKind,
    spec: Arc<ClassSpec>,
    /// Session that created this adapter; `None` only for unowned roots.
    owner: Option<String>,
    handle: Mutex<Option<NativeHandle>>,
    /// SynchronizedGroup only: the one derived tagger view ever handed out.
    derived_tagger: Mutex<Option<ObjectRef>>,
}

impl Adapter {
    pub(crate) fn new(
        id: String,
        kind: AdapterKind,
        spec: Arc<ClassSpec>,
        owner: Option<String>,
        handle: NativeHandle,
    ) -> Self {
        Self {
            id,
            kind,
            spec,
            owner,
            handle: Mutex::new(Some(handle)),
            derived_tagger: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> AdapterKind {
        self.kind
    }

    pub fn spec(&self) -> &ClassSpec {
        &self.spec
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    fn data_object_spec(&self) -> Option<Arc<ClassSpec>> {
        self.spec.data_object.clone()
    }

    /// Runs `f` with the live handle, or fails if the adapter is closed.
    pub fn with_handle<R>(
        &self,
        f: impl FnOnce(&NativeHandle) -> RpcResult<R>,
    ) -> RpcResult<R> {
        let guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(handle) => f(handle),
            None => Err(RpcError::AlreadyClosed(self.id.clone())),
        }
    }

    /// Takes ownership of the handle for release. `None` means another close
    /// already won.
    pub(crate) fn take_handle(&self) -> Option<NativeHandle> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn derived_tagger_slot(&self) -> MutexGuard<'_, Option<ObjectRef>> {
        self.derived_tagger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The root library adapter plus the member dispatch for every adapter kind.
pub struct LibraryAdapter {
    native: Arc<dyn NativeLibrary>,
    registry: Arc<Registry>,
    /// Tagger class name -> spec; constructor member is `create<Name>`.
    taggers: BTreeMap<String, Arc<ClassSpec>>,
    /// Iterator class name -> spec; constructor member is the class name.
    iterators: BTreeMap<String, Arc<ClassSpec>>,
    group: Option<Arc<ClassSpec>>,
    functions: BTreeSet<String>,
    enums: BTreeMap<String, EnumDef>,
}

impl LibraryAdapter {
    pub fn new(
        native: Arc<dyn NativeLibrary>,
        registry: Arc<Registry>,
        surface: ApiSurface,
    ) -> RpcResult<Self> {
        let snapshots: BTreeMap<String, Arc<ClassSpec>> = surface
            .data_objects
            .iter()
            .map(|class| (class.name.clone(), build_spec(class, &[], None)))
            .collect();

        let mut iterators = BTreeMap::new();
        for class in &surface.iterators {
            let data_object = if class.methods.iter().any(|m| m == "getDataObject") {
                let snapshot_name = format!("{}Data", class.name);
                let spec = snapshots.get(&snapshot_name).cloned().ok_or_else(|| {
                    RpcError::Classification(format!(
                        "iterator '{}' exposes getDataObject but the library has no '{}' class",
                        class.name, snapshot_name
                    ))
                })?;
                Some(spec)
            } else {
                None
            };
            iterators.insert(
                class.name.clone(),
                build_spec(class, EXCLUDED_ITERATOR_ATTRIBUTES, data_object),
            );
        }

        let taggers: BTreeMap<String, Arc<ClassSpec>> = surface
            .taggers
            .iter()
            .map(|class| {
                (
                    class.name.clone(),
                    build_spec(class, EXCLUDED_TAGGER_ATTRIBUTES, None),
                )
            })
            .collect();

        if surface.groups.len() > 1 {
            return Err(RpcError::Classification(format!(
                "expected at most one synchronized group class, found {}",
                surface.groups.len()
            )));
        }
        let group = surface
            .groups
            .first()
            .map(|class| build_spec(class, EXCLUDED_ITERATOR_ATTRIBUTES, None));

        Ok(Self {
            native,
            registry,
            taggers,
            iterators,
            group,
            functions: surface.functions.into_iter().collect(),
            enums: surface.enums,
        })
    }

    /// Enum definitions computed at startup; read-only from here on.
    pub fn enums(&self) -> &BTreeMap<String, EnumDef> {
        &self.enums
    }

    /// Constructor members exposed on the root object.
    pub fn constructors(&self) -> Vec<(String, AdapterKind)> {
        let mut out: Vec<(String, AdapterKind)> = Vec::new();
        for name in self.taggers.keys() {
            out.push((format!("create{}", name), AdapterKind::Tagger));
        }
        for name in self.iterators.keys() {
            out.push((name.clone(), AdapterKind::Iterator));
        }
        if let Some(group) = &self.group {
            out.push((group.name.clone(), AdapterKind::SynchronizedGroup));
        }
        out
    }

    /// Pass-through free functions exposed on the root object.
    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(String::as_str)
    }

    fn register_new(
        &self,
        kind: AdapterKind,
        spec: &Arc<ClassSpec>,
        handle: NativeHandle,
        session: &str,
    ) -> RpcResult<Value> {
        let adapter = self.registry.register(kind, Arc::clone(spec), handle, session)?;
        tracing::debug!(id = %adapter.id(), kind = %kind, "registered adapter");
        Ok(Value::Ref(ObjectRef {
            id: adapter.id().to_string(),
            kind: kind.as_str().to_string(),
        }))
    }

    /// Dispatches a member call on the root library object.
    pub fn call_root(&self, session: &str, member: &str, args: &[Value]) -> RpcResult<Value> {
        if member == "freeTimeTagger" {
            let (reference, _) = expect_ref(args, member)?;
            let adapter = self.registry.resolve(&reference.id)?;
            if adapter.kind() != AdapterKind::Tagger {
                return Err(RpcError::InvalidArguments(format!(
                    "freeTimeTagger expects a tagger reference, got {}",
                    adapter.kind()
                )));
            }
            self.registry.close(&adapter)?;
            return Ok(Value::Null);
        }

        if let Some(class) = member.strip_prefix("create") {
            if let Some(spec) = self.taggers.get(class) {
                let handle = self.native.create_tagger(class, args)?;
                return self.register_new(AdapterKind::Tagger, spec, handle, session);
            }
        }

        if let Some(spec) = self.iterators.get(member) {
            let (tagger_ref, rest) = expect_ref(args, member)?;
            let tagger = self.registry.resolve(&tagger_ref.id)?;
            let handle =
                tagger.with_handle(|h| Ok(self.native.create_iterator(member, h, rest)?))?;
            return self.register_new(AdapterKind::Iterator, spec, handle, session);
        }

        if let Some(spec) = &self.group {
            if member == spec.name {
                let (tagger_ref, _) = expect_ref(args, member)?;
                let tagger = self.registry.resolve(&tagger_ref.id)?;
                let handle = tagger.with_handle(|h| Ok(self.native.create_synchronized(h)?))?;
                return self.register_new(AdapterKind::SynchronizedGroup, spec, handle, session);
            }
        }

        if self.functions.contains(member) {
            return Ok(self.native.call_function(member, args)?);
        }

        Err(RpcError::UnknownMember {
            target: ROOT_OBJECT_ID.to_string(),
            member: member.to_string(),
        })
    }

    /// Dispatches a member call on a live adapter.
    pub fn call_member(
        &self,
        session: &str,
        adapter: &Arc<Adapter>,
        member: &str,
        args: &[Value],
    ) -> RpcResult<Value> {
        match (adapter.kind(), member) {
            // Explicit release; `discard` is the snapshot-flavored alias.
            (_, "close") | (AdapterKind::DataObject, "discard") => {
                self.registry.close(adapter)?;
                Ok(Value::Null)
            }

            (AdapterKind::Iterator, "getDataObject")
                if adapter.spec().methods.contains("getDataObject") =>
            {
                let spec = adapter.data_object_spec().ok_or_else(|| {
                    RpcError::Internal(format!(
                        "iterator '{}' has no snapshot spec",
                        adapter.spec().name
                    ))
                })?;
                let (class, handle) =
                    adapter.with_handle(|h| Ok(self.native.data_object(h)?))?;
                if class != spec.name {
                    tracing::warn!(
                        expected = %spec.name,
                        actual = %class,
                        "snapshot class differs from the startup classification"
                    );
                }
                self.register_new(AdapterKind::DataObject, &spec, handle, session)
            }

            (AdapterKind::SynchronizedGroup, "registerMeasurement")
            | (AdapterKind::SynchronizedGroup, "unregisterMeasurement") => {
                let (reference, _) = expect_ref(args, member)?;
                let measurement = self.registry.resolve(&reference.id)?;
                if measurement.kind() != AdapterKind::Iterator {
                    return Err(RpcError::InvalidArguments(format!(
                        "{} expects a measurement reference, got {}",
                        member,
                        measurement.kind()
                    )));
                }
                // The native call sees both raw handles; the adapters keep
                // ownership so cleanup still frees each exactly once.
                adapter.with_handle(|group| {
                    measurement.with_handle(|meas| {
                        if member == "registerMeasurement" {
                            Ok(self.native.register_measurement(group, meas)?)
                        } else {
                            Ok(self.native.unregister_measurement(group, meas)?)
                        }
                    })
                })?;
                Ok(Value::Null)
            }

            (AdapterKind::SynchronizedGroup, "getTagger") => {
                let mut cached = adapter.derived_tagger_slot();
                if let Some(reference) = cached.as_ref() {
                    if self.registry.resolve(&reference.id).is_ok() {
                        return Ok(Value::Ref(reference.clone()));
                    }
                    // The cached view was explicitly released; wrap a fresh
                    // one instead of handing out a dead identity forever.
                    *cached = None;
                }
                let (class, handle) =
                    adapter.with_handle(|g| Ok(self.native.group_tagger(g)?))?;
                let spec = self.taggers.get(&class).ok_or_else(|| {
                    RpcError::Internal(format!(
                        "group returned unknown tagger class '{}'",
                        class
                    ))
                })?;
                let value = self.register_new(AdapterKind::Tagger, spec, handle, session)?;
                if let Value::Ref(reference) = &value {
                    *cached = Some(reference.clone());
                }
                Ok(value)
            }

            _ if adapter.spec().methods.contains(member) => {
                adapter.with_handle(|h| Ok(self.native.call_method(h, member, args)?))
            }

            _ => Err(RpcError::UnknownMember {
                target: adapter.spec().name.clone(),
                member: member.to_string(),
            }),
        }
    }

    pub fn get_property(&self, adapter: &Adapter, name: &str) -> RpcResult<Value> {
        self.check_property(adapter, name)?;
        adapter.with_handle(|h| Ok(self.native.get_property(h, name)?))
    }

    pub fn set_property(&self, adapter: &Adapter, name: &str, value: Value) -> RpcResult<Value> {
        self.check_property(adapter, name)?;
        adapter.with_handle(|h| {
            self.native.set_property(h, name, value)?;
            Ok(Value::Null)
        })
    }

    pub fn delete_property(&self, adapter: &Adapter, name: &str) -> RpcResult<Value> {
        self.check_property(adapter, name)?;
        adapter.with_handle(|h| {
            self.native.delete_property(h, name)?;
            Ok(Value::Null)
        })
    }

    fn check_property(&self, adapter: &Adapter, name: &str) -> RpcResult<()> {
        if adapter.spec().properties.contains(name) {
            Ok(())
        } else {
            Err(RpcError::UnknownMember {
                target: adapter.spec().name.clone(),
                member: name.to_string(),
            })
        }
    }
}

/// Splits off a leading object reference argument.
fn expect_ref<'a>(args: &'a [Value], member: &str) -> RpcResult<(&'a ObjectRef, &'a [Value])> {
    match args.split_first() {
        Some((Value::Ref(reference), rest)) => Ok((reference, rest)),
        _ => Err(RpcError::InvalidArguments(format!(
            "'{}' expects an object reference as its first argument",
            member
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::classify;
    use crate::native::sim::SimLibrary;

    fn library() -> (Arc<Registry>, LibraryAdapter, String) {
        let native: Arc<dyn NativeLibrary> = Arc::new(SimLibrary::new());
        let surface = classify(&native.descriptor()).unwrap();
        let registry = Registry::new(Arc::clone(&native));
        let library = LibraryAdapter::new(native, Arc::clone(&registry), surface).unwrap();
        let session = registry.open_session();
        (registry, library, session)
    }

    fn make_tagger(library: &LibraryAdapter, session: &str) -> ObjectRef {
        let value = library.call_root(session, "createTimeTagger", &[]).unwrap();
        value.as_object_ref().cloned().unwrap()
    }

    #[test]
    fn test_create_tagger_registers_adapter() {
        let (registry, library, session) = library();
        let tagger = make_tagger(&library, &session);
        assert_eq!(tagger.kind, "Tagger");
        assert!(tagger.id.starts_with("TimeTagger-"));
        assert!(registry.resolve(&tagger.id).is_ok());
    }

    #[test]
    fn test_iterator_constructor_requires_tagger_ref() {
        let (_registry, library, session) = library();
        let err = library
            .call_root(&session, "Countrate", &[Value::Int(1)])
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidArguments(_)));
    }

    #[test]
    fn test_excluded_members_are_not_callable() {
        let (registry, library, session) = library();
        let tagger = make_tagger(&library, &session);
        let adapter = registry.resolve(&tagger.id).unwrap();

        let err = library
            .call_member(&session, &adapter, "factoryAccess", &[])
            .unwrap_err();
        assert!(matches!(err, RpcError::UnknownMember { .. }));

        let countrate = library
            .call_root(
                &session,
                "Countrate",
                &[Value::Ref(tagger), Value::Int(1)],
            )
            .unwrap();
        let countrate = registry
            .resolve(&countrate.as_object_ref().unwrap().id)
            .unwrap();
        let err = library
            .call_member(&session, &countrate, "waitUntilFinished", &[])
            .unwrap_err();
        assert!(matches!(err, RpcError::UnknownMember { .. }));
    }

    #[test]
    fn test_get_data_object_wraps_snapshot() {
        let (registry, library, session) = library();
        let tagger = make_tagger(&library, &session);
        let countrate = library
            .call_root(
                &session,
                "Countrate",
                &[Value::Ref(tagger.clone()), Value::Int(1)],
            )
            .unwrap();
        let countrate = registry
            .resolve(&countrate.as_object_ref().unwrap().id)
            .unwrap();

        let snapshot = library
            .call_member(&session, &countrate, "getDataObject", &[])
            .unwrap();
        let snapshot_ref = snapshot.as_object_ref().unwrap();
        assert_eq!(snapshot_ref.kind, "DataObject");
        assert!(snapshot_ref.id.starts_with("CountrateData-"));

        // Snapshot is independently closable; iterator and tagger survive.
        let snapshot_adapter = registry.resolve(&snapshot_ref.id).unwrap();
        library
            .call_member(&session, &snapshot_adapter, "discard", &[])
            .unwrap();
        assert!(matches!(
            registry.resolve(&snapshot_ref.id),
            Err(RpcError::StaleReference(_))
        ));
        assert!(registry.resolve(countrate.id()).is_ok());
        assert!(registry.resolve(&tagger.id).is_ok());
    }

    #[test]
    fn test_get_tagger_is_cached_per_group() {
        let (registry, library, session) = library();
        let tagger = make_tagger(&library, &session);
        let group = library
            .call_root(
                &session,
                "SynchronizedMeasurements",
                &[Value::Ref(tagger)],
            )
            .unwrap();
        let group = registry
            .resolve(&group.as_object_ref().unwrap().id)
            .unwrap();

        let first = library
            .call_member(&session, &group, "getTagger", &[])
            .unwrap();
        let second = library
            .call_member(&session, &group, "getTagger", &[])
            .unwrap();
        assert_eq!(
            first.as_object_ref().unwrap().id,
            second.as_object_ref().unwrap().id,
            "getTagger must never wrap the same handle twice"
        );
    }

    #[test]
    fn test_get_tagger_recovers_after_derived_view_is_closed() {
        let (registry, library, session) = library();
        let tagger = make_tagger(&library, &session);
        let group = library
            .call_root(
                &session,
                "SynchronizedMeasurements",
                &[Value::Ref(tagger)],
            )
            .unwrap();
        let group = registry
            .resolve(&group.as_object_ref().unwrap().id)
            .unwrap();

        let first = library
            .call_member(&session, &group, "getTagger", &[])
            .unwrap();
        let first_id = first.as_object_ref().unwrap().id.clone();
        let derived = registry.resolve(&first_id).unwrap();
        registry.close(&derived).unwrap();

        // The stale cached identity must not be handed out again.
        let second = library
            .call_member(&session, &group, "getTagger", &[])
            .unwrap();
        let second_id = &second.as_object_ref().unwrap().id;
        assert_ne!(&first_id, second_id);
        assert!(registry.resolve(second_id).is_ok());

        // And the replacement is cached like the original.
        let third = library
            .call_member(&session, &group, "getTagger", &[])
            .unwrap();
        assert_eq!(second_id, &third.as_object_ref().unwrap().id);
    }

    #[test]
    fn test_register_measurement_resolves_reference() {
        let (registry, library, session) = library();
        let tagger = make_tagger(&library, &session);
        let countrate = library
            .call_root(
                &session,
                "Countrate",
                &[Value::Ref(tagger.clone()), Value::Int(1)],
            )
            .unwrap();
        let group = library
            .call_root(&session, "SynchronizedMeasurements", &[Value::Ref(tagger)])
            .unwrap();
        let group = registry
            .resolve(&group.as_object_ref().unwrap().id)
            .unwrap();

        library
            .call_member(&session, &group, "registerMeasurement", &[countrate.clone()])
            .unwrap();
        library
            .call_member(&session, &group, "unregisterMeasurement", &[countrate])
            .unwrap();

        // A non-iterator reference is rejected before any native call.
        let other = make_tagger(&library, &session);
        let err = library
            .call_member(&session, &group, "registerMeasurement", &[Value::Ref(other)])
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidArguments(_)));
    }

    #[test]
    fn test_free_time_tagger_goes_through_close_path() {
        let (registry, library, session) = library();
        let tagger = make_tagger(&library, &session);
        library
            .call_root(&session, "freeTimeTagger", &[Value::Ref(tagger.clone())])
            .unwrap();
        assert!(matches!(
            registry.resolve(&tagger.id),
            Err(RpcError::StaleReference(_))
        ));
        // Freeing an already-freed reference reports a stale handle.
        let err = library
            .call_root(&session, "freeTimeTagger", &[Value::Ref(tagger)])
            .unwrap_err();
        assert!(matches!(err, RpcError::StaleReference(_)));
    }

    #[test]
    fn test_calls_after_close_fail_but_close_is_idempotent() {
        let (registry, library, session) = library();
        let tagger = make_tagger(&library, &session);
        let adapter = registry.resolve(&tagger.id).unwrap();

        library.call_member(&session, &adapter, "close", &[]).unwrap();
        // Second close: silent no-op.
        library.call_member(&session, &adapter, "close", &[]).unwrap();
        // Any other member: an error, not a no-op.
        let err = library
            .call_member(&session, &adapter, "getSerial", &[])
            .unwrap_err();
        assert!(matches!(err, RpcError::AlreadyClosed(_)));
    }

    #[test]
    fn test_property_forwarding() {
        let (registry, library, session) = library();
        let tagger = make_tagger(&library, &session);
        let adapter = registry.resolve(&tagger.id).unwrap();

        let model = library.get_property(&adapter, "model").unwrap();
        assert_eq!(model.as_str(), Some("Time Tagger Ultra (simulated)"));

        let err = library
            .set_property(&adapter, "model", Value::Str("x".into()))
            .unwrap_err();
        assert!(matches!(err, RpcError::Native(_)));

        let err = library.get_property(&adapter, "nope").unwrap_err();
        assert!(matches!(err, RpcError::UnknownMember { .. }));
    }

    #[test]
    fn test_pass_through_function_and_unknown_member() {
        let (_registry, library, session) = library();
        let version = library.call_root(&session, "getVersion", &[]).unwrap();
        assert_eq!(version.as_str(), Some("2.17.4-sim"));

        let err = library.call_root(&session, "setLogger", &[]).unwrap_err();
        assert!(matches!(err, RpcError::UnknownMember { .. }));
    }
}
