use std::{borrow::Cow, fmt};

/// Extracts identity and resume information from an object
///
/// This is the only thing the informer needs to know about the objects it caches.
/// It is implemented for every `kube::Resource` when the `client` feature is enabled.
pub trait Lookup {
    /// The stable identity of the object
    fn to_object_ref(&self) -> ObjectRef;

    /// The version token of this snapshot of the object, if it carries one
    fn resource_version(&self) -> Option<Cow<'_, str>>;
}

/// A namespaced (if relevant) reference to an object
///
/// Two objects with equal `ObjectRef`s are the same logical object, at possibly
/// different versions.
///
/// ```
/// use kube_informer::reflector::ObjectRef;
/// assert_ne!(ObjectRef::new("foo"), ObjectRef::new("foo").within("bar"));
/// assert_eq!(ObjectRef::new("foo").within("bar").to_string(), "bar/foo");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub struct ObjectRef {
    /// The name of the object
    pub name: String,
    /// The namespace of the object
    ///
    /// May only be `None` if the kind is cluster-scoped (not located in a namespace).
    /// Note that it *is* acceptable for an `ObjectRef` to a cluster-scoped resource to
    /// have a namespace. These are, however, not considered equal.
    pub namespace: Option<String>,
}

impl ObjectRef {
    /// Reference to a cluster-scoped object
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Scope the reference to `namespace`
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Creates an `ObjectRef` from anything implementing [`Lookup`]
    #[must_use]
    pub fn from_obj<K: Lookup + ?Sized>(obj: &K) -> Self {
        obj.to_object_ref()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}/")?;
        }
        write!(f, "{}", self.name)
    }
}
