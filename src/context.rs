//! Per-invocation, type-indexed attribute store.
//!
//! Attributes are keyed by a `(name, TypeId)` pair, so two collaborators that
//! happen to pick the same name for differently typed values never observe each
//! other's data: a lookup with the wrong type simply finds nothing.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

/// Typed handle for one attribute slot.
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AttributeKey")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

trait AttributeValue: Any + Send + Sync {
    fn clone_boxed(&self) -> Box<dyn AttributeValue>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T> AttributeValue for T
where
    T: Clone + Send + Sync + 'static,
{
    fn clone_boxed(&self) -> Box<dyn AttributeValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

type SlotId = (&'static str, TypeId);

#[derive(Default)]
pub struct Attributes {
    values: HashMap<SlotId, Box<dyn AttributeValue>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot<T: 'static>(key: &AttributeKey<T>) -> SlotId {
        (key.name, TypeId::of::<T>())
    }

    pub fn get<T>(&self, key: &AttributeKey<T>) -> Option<&T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.values
            .get(&Self::slot(key))
            .and_then(|value| value.as_ref().as_any().downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self, key: &AttributeKey<T>) -> Option<&mut T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.values
            .get_mut(&Self::slot(key))
            .and_then(|value| value.as_mut().as_any_mut().downcast_mut::<T>())
    }

    /// Stores `value`, returning whatever the slot previously held.
    pub fn set<T>(&mut self, key: &AttributeKey<T>, value: T) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.values
            .insert(Self::slot(key), Box::new(value))
            .and_then(|previous| previous.into_any().downcast::<T>().ok())
            .map(|previous| *previous)
    }

    pub fn remove<T>(&mut self, key: &AttributeKey<T>) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.values
            .remove(&Self::slot(key))
            .and_then(|previous| previous.into_any().downcast::<T>().ok())
            .map(|previous| *previous)
    }

    pub fn contains<T>(&self, key: &AttributeKey<T>) -> bool
    where
        T: Clone + Send + Sync + 'static,
    {
        self.values.contains_key(&Self::slot(key))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Clone for Attributes {
    fn clone(&self) -> Self {
        Self {
            values: self
                .values
                .iter()
                .map(|(slot, value)| (*slot, value.as_ref().clone_boxed()))
                .collect(),
        }
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.values.keys().map(|(name, _)| *name).collect();
        names.sort_unstable();
        formatter
            .debug_struct("Attributes")
            .field("names", &names)
            .finish()
    }
}

/// State threaded through every phase of one operation invocation.
///
/// A context belongs to exactly one invocation. Constructs that issue repeated
/// invocations (pagination, waiters) derive an independently owned copy with
/// [`Context::derive`].
#[derive(Clone, Debug, Default)]
pub struct Context {
    attributes: Attributes,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_operation(service: impl Into<String>, operation: impl Into<String>) -> Self {
        let mut context = Self::new();
        context.set(&keys::SERVICE_NAME, service.into());
        context.set(&keys::OPERATION_NAME, operation.into());
        context
    }

    /// Copy of this context for another, independent invocation.
    ///
    /// Per-attempt bookkeeping (attempt counters, invocation id) is dropped so
    /// the derived invocation starts fresh.
    pub fn derive(&self) -> Self {
        let mut derived = self.clone();
        derived.remove(&keys::ATTEMPT);
        derived.remove(&keys::MAX_ATTEMPTS);
        derived.remove(&keys::INVOCATION_ID);
        derived
    }

    pub fn get<T>(&self, key: &AttributeKey<T>) -> Option<&T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attributes.get(key)
    }

    pub fn get_mut<T>(&mut self, key: &AttributeKey<T>) -> Option<&mut T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attributes.get_mut(key)
    }

    pub fn set<T>(&mut self, key: &AttributeKey<T>, value: T) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attributes.set(key, value)
    }

    pub fn remove<T>(&mut self, key: &AttributeKey<T>) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attributes.remove(key)
    }

    pub fn contains<T>(&self, key: &AttributeKey<T>) -> bool
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attributes.contains(key)
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn operation_name(&self) -> &str {
        self.get(&keys::OPERATION_NAME)
            .map(String::as_str)
            .unwrap_or("unknown")
    }

    pub fn service_name(&self) -> &str {
        self.get(&keys::SERVICE_NAME)
            .map(String::as_str)
            .unwrap_or("unknown")
    }

    /// One-based attempt number of the attempt currently running, if any.
    pub fn attempt(&self) -> Option<usize> {
        self.get(&keys::ATTEMPT).copied()
    }
}

/// Well-known attribute keys shared between the runtime and its collaborators.
pub mod keys {
    use super::AttributeKey;
    use crate::auth::SelectedAuthScheme;
    use crate::middleware::Endpoint;
    use crate::observe::Telemetry;

    pub const SERVICE_NAME: AttributeKey<String> = AttributeKey::new("sdk.service_name");
    pub const OPERATION_NAME: AttributeKey<String> = AttributeKey::new("sdk.operation_name");
    pub const ATTEMPT: AttributeKey<usize> = AttributeKey::new("sdk.attempt");
    pub const MAX_ATTEMPTS: AttributeKey<usize> = AttributeKey::new("sdk.max_attempts");
    pub const INVOCATION_ID: AttributeKey<String> = AttributeKey::new("sdk.invocation_id");
    pub const ENDPOINT: AttributeKey<Endpoint> = AttributeKey::new("sdk.endpoint");
    pub const SELECTED_AUTH_SCHEME: AttributeKey<SelectedAuthScheme> =
        AttributeKey::new("sdk.selected_auth_scheme");
    pub const TELEMETRY: AttributeKey<Telemetry> = AttributeKey::new("sdk.telemetry");
}
