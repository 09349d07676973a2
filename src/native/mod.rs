//! Boundary to the native time-tagger control library.
//!
//! The adapter layer never links the vendor SDK directly. It consumes it
//! through [`NativeLibrary`], a capability seam that provides three things:
//! a self-description of the API surface ([`LibraryDescriptor`]), dynamic
//! construction/invocation against opaque [`NativeHandle`]s, and the
//! explicit release entry points. A software implementation lives in
//! [`sim`]; a vendor-backed implementation would wrap the real SDK behind
//! the same trait.

pub mod sim;

use thiserror::Error;

use crate::value::Value;

/// Opaque reference to an object instance inside the native library.
///
/// Deliberately neither `Clone` nor `Copy`: a handle is exclusively owned by
/// exactly one adapter, and release consumes it. Forwarding calls borrow it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct NativeHandle(u64);

impl NativeHandle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Failure raised by the native library. Messages are forwarded to remote
/// callers unchanged.
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("unknown class '{0}'")]
    UnknownClass(String),

    /// The object does not expose the requested attribute. During tagger
    /// teardown this is swallowed (the device is presumed already released);
    /// everywhere else it propagates.
    #[error("no such attribute '{0}'")]
    MissingAttribute(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A handle that does not name a live native object.
    #[error("dangling native handle {0}")]
    DanglingHandle(u64),

    /// Any other failure from the native call.
    #[error("{0}")]
    Call(String),
}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Description of one class exported by the native library.
///
/// `bases` carries the ancestry marker names the introspector classifies on;
/// `enum_variants` is populated for enumeration classes and for legacy
/// attribute-style enums (label/value pairs harvested from public class
/// attributes).
#[derive(Clone, Debug, PartialEq)]
pub struct ClassDescriptor {
    pub name: String,
    pub bases: Vec<String>,
    pub methods: Vec<String>,
    pub properties: Vec<String>,
    pub enum_variants: Vec<(String, i64)>,
}

impl ClassDescriptor {
    pub fn new(name: &str, bases: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            bases: bases.iter().map(|b| b.to_string()).collect(),
            methods: Vec::new(),
            properties: Vec::new(),
            enum_variants: Vec::new(),
        }
    }

    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_properties(mut self, properties: &[&str]) -> Self {
        self.properties = properties.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_enum_variants(mut self, variants: &[(&str, i64)]) -> Self {
        self.enum_variants = variants
            .iter()
            .map(|(label, value)| (label.to_string(), *value))
            .collect();
        self
    }
}

/// Everything the native library exports at module level.
#[derive(Clone, Debug, Default)]
pub struct LibraryDescriptor {
    pub classes: Vec<ClassDescriptor>,
    pub functions: Vec<String>,
}

/// The native SDK as consumed by the adapter layer.
///
/// All calls are synchronous and block for the duration of the native call.
/// The library's own thread-safety contract for concurrent calls against the
/// same handle is out of scope here; the adapter layer serializes per-object
/// access as a side effect of exclusive handle ownership.
pub trait NativeLibrary: Send + Sync {
    /// Describes the exported classes and free functions. Called once at
    /// startup by the introspector.
    fn descriptor(&self) -> LibraryDescriptor;

    /// Invokes a module-level free function.
    fn call_function(&self, name: &str, args: &[Value]) -> NativeResult<Value>;

    /// Invokes the `create<Class>` factory for a tagger class.
    fn create_tagger(&self, class: &str, args: &[Value]) -> NativeResult<NativeHandle>;

    /// Constructs a measurement/virtual-channel object bound to a tagger.
    fn create_iterator(
        &self,
        class: &str,
        tagger: &NativeHandle,
        args: &[Value],
    ) -> NativeResult<NativeHandle>;

    /// Constructs a synchronized-measurement coordinator over a tagger.
    fn create_synchronized(&self, tagger: &NativeHandle) -> NativeResult<NativeHandle>;

    /// Invokes a plain forwarded method.
    fn call_method(&self, handle: &NativeHandle, method: &str, args: &[Value])
        -> NativeResult<Value>;

    fn get_property(&self, handle: &NativeHandle, name: &str) -> NativeResult<Value>;

    fn set_property(&self, handle: &NativeHandle, name: &str, value: Value) -> NativeResult<()>;

    fn delete_property(&self, handle: &NativeHandle, name: &str) -> NativeResult<()>;

    /// Takes an immutable snapshot of a running measurement. Returns the
    /// snapshot's class name together with its handle.
    fn data_object(&self, iterator: &NativeHandle) -> NativeResult<(String, NativeHandle)>;

    /// Adds a measurement to a synchronized group. Both handles stay owned
    /// by their adapters; the native call only borrows them.
    fn register_measurement(
        &self,
        group: &NativeHandle,
        measurement: &NativeHandle,
    ) -> NativeResult<()>;

    fn unregister_measurement(
        &self,
        group: &NativeHandle,
        measurement: &NativeHandle,
    ) -> NativeResult<()>;

    /// Returns the group's derived tagger view (class name plus handle).
    fn group_tagger(&self, group: &NativeHandle) -> NativeResult<(String, NativeHandle)>;

    /// Releases a tagger device. Device handles require this explicit
    /// hardware teardown entry, never the generic destructor.
    fn free_tagger(&self, handle: NativeHandle) -> NativeResult<()>;

    /// Generic destructor for measurements, groups, and snapshots.
    fn release(&self, handle: NativeHandle);
}
