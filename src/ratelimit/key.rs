//! Window key resolution.

use std::fmt;
use std::sync::Arc;

use crate::error::{LimiterError, Result};

/// Resolves the store key a call operates on.
///
/// A limiter either guards one fixed key or derives a key per call from a
/// caller-supplied identifier, for example a user id or a remote address.
pub enum KeyResolver<I: ?Sized = ()> {
    /// Every call uses the same key
    Fixed(String),
    /// The key is computed from the call's identifier
    Derived(Arc<dyn Fn(&I) -> String + Send + Sync>),
}

impl<I: ?Sized> KeyResolver<I> {
    /// A resolver that always yields `key`.
    pub fn fixed(key: impl Into<String>) -> Self {
        KeyResolver::Fixed(key.into())
    }

    /// A resolver that computes the key from an identifier.
    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&I) -> String + Send + Sync + 'static,
    {
        KeyResolver::Derived(Arc::new(f))
    }

    /// Resolve the key for one call.
    pub fn resolve(&self, id: &I) -> Result<String> {
        match self {
            KeyResolver::Fixed(key) => Ok(key.clone()),
            KeyResolver::Derived(f) => {
                let key = f(id);
                if key.is_empty() {
                    return Err(LimiterError::Config(
                        "key resolver returned an empty key".to_string(),
                    ));
                }
                Ok(key)
            }
        }
    }
}

impl<I: ?Sized> Clone for KeyResolver<I> {
    fn clone(&self) -> Self {
        match self {
            KeyResolver::Fixed(key) => KeyResolver::Fixed(key.clone()),
            KeyResolver::Derived(f) => KeyResolver::Derived(Arc::clone(f)),
        }
    }
}

impl<I: ?Sized> fmt::Debug for KeyResolver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyResolver::Fixed(key) => f.debug_tuple("Fixed").field(key).finish(),
            KeyResolver::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

impl<I: ?Sized> From<&str> for KeyResolver<I> {
    fn from(key: &str) -> Self {
        KeyResolver::fixed(key)
    }
}

impl<I: ?Sized> From<String> for KeyResolver<I> {
    fn from(key: String) -> Self {
        KeyResolver::Fixed(key)
    }
}
