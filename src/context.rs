//! Request-scoped values.
//!
//! Every [`Request`](crate::Request) carries a [`Context`]: an immutable chain
//! of typed values attached by middleware and read back further down the call
//! chain. Attaching never mutates an existing context, it returns a new one
//! whose head points at the old chain, so a context handed to a spawned task
//! keeps seeing exactly what was attached when it was cloned.
//!
//! ```rust
//! use toolkit::context::{Context, Key};
//!
//! static USER_ID: Key<u64> = Key::new("user_id");
//!
//! let ctx = Context::new().with_value(USER_ID, 42);
//! assert_eq!(ctx.value(USER_ID), Some(&42));
//! assert_eq!(Context::new().value(USER_ID), None);
//! ```

use std::any::{Any, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;

/// A typed context key.
///
/// Keys are identified by name. Declare them as `static` items next to the
/// code that owns the value.
pub struct Key<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

// Manual impls: deriving would require `T: Clone`.
impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key<{}>", self.name)
    }
}

/// Why a [`Context::lookup`] failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("no value for {key:?} in context")]
    Missing { key: &'static str },

    #[error("value for {key:?} in context is not a {expected}")]
    WrongType { key: &'static str, expected: &'static str },
}

struct Node {
    key: &'static str,
    value: Box<dyn Any + Send + Sync>,
    parent: Option<Arc<Node>>,
}

/// An immutable chain of request-scoped values.
#[derive(Clone, Default)]
pub struct Context {
    head: Option<Arc<Node>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a derived context carrying `value` under `key`.
    ///
    /// A later binding for the same key shadows earlier ones.
    pub fn with_value<T>(&self, key: Key<T>, value: T) -> Context
    where
        T: Send + Sync + 'static,
    {
        Context {
            head: Some(Arc::new(Node {
                key: key.name,
                value: Box::new(value),
                parent: self.head.clone(),
            })),
        }
    }

    /// Finds the nearest binding for `key`.
    pub fn lookup<T: 'static>(&self, key: Key<T>) -> Result<&T, ContextError> {
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            if n.key == key.name {
                return n.value.downcast_ref::<T>().ok_or(ContextError::WrongType {
                    key: key.name,
                    expected: type_name::<T>(),
                });
            }
            node = n.parent.as_deref();
        }
        Err(ContextError::Missing { key: key.name })
    }

    /// Like [`lookup`](Context::lookup), folding both failures into `None`.
    pub fn value<T: 'static>(&self, key: Key<T>) -> Option<&T> {
        self.lookup(key).ok()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = Vec::new();
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            keys.push(n.key);
            node = n.parent.as_deref();
        }
        f.debug_struct("Context").field("keys", &keys).finish()
    }
}
