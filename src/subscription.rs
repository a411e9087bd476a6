// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! Maps payload kinds to handler sets and resolves the handler set for an
//! arriving message's runtime kind. Hierarchy subscriptions also receive
//! messages whose lineage contains the subscribed kind; resolution walks the
//! lineage nearest ancestor first and breaks ties by registration order.
//!
//! The registry is shared read-mostly: registration and removal take the write
//! lock, resolution takes a snapshot under the read lock. A dispatch that
//! already resolved its handler set is unaffected by later removals.

use crate::errors::BusError;
use crate::handler::Processor;
use crate::message::Payload;
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

/// Identity of one registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type-erased handler stored in the registry. Each typed registration wraps
/// its own decode step so base-kind handlers can read subtype payloads.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn call(&self, ctx: &Context, body: &Value) -> Result<Option<Value>, BusError>;

    /// Stable identity for duplicate detection; zero means identity-free.
    fn identity(&self) -> usize {
        0
    }

    /// Whether this handler's payload type can decode the body. Used to type
    /// messages that arrive without a declared kind.
    fn probe(&self, body: &Value) -> bool;
}

struct CallbackHandler<T, F> {
    callback: F,
    _payload: PhantomData<fn(T)>,
}

#[async_trait]
impl<T, F> ErasedHandler for CallbackHandler<T, F>
where
    T: Payload,
    F: Fn(T) + Send + Sync + 'static,
{
    async fn call(&self, _ctx: &Context, body: &Value) -> Result<Option<Value>, BusError> {
        let payload: T =
            serde_json::from_value(body.clone()).map_err(|e| BusError::Decode(e.to_string()))?;
        (self.callback)(payload);
        Ok(None)
    }

    fn probe(&self, body: &Value) -> bool {
        serde_json::from_value::<T>(body.clone()).is_ok()
    }
}

struct ProcessorHandler<T> {
    processor: Arc<dyn Processor<T>>,
}

#[async_trait]
impl<T: Payload> ErasedHandler for ProcessorHandler<T> {
    async fn call(&self, ctx: &Context, body: &Value) -> Result<Option<Value>, BusError> {
        let payload: T =
            serde_json::from_value(body.clone()).map_err(|e| BusError::Decode(e.to_string()))?;
        self.processor.process(ctx, payload).await
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.processor) as *const () as usize
    }

    fn probe(&self, body: &Value) -> bool {
        serde_json::from_value::<T>(body.clone()).is_ok()
    }
}

struct RawHandler<F> {
    callback: F,
}

#[async_trait]
impl<F> ErasedHandler for RawHandler<F>
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    async fn call(&self, _ctx: &Context, body: &Value) -> Result<Option<Value>, BusError> {
        (self.callback)(body);
        Ok(None)
    }

    // Raw registrations name their kind explicitly and take no part in
    // probing untyped messages.
    fn probe(&self, _body: &Value) -> bool {
        false
    }
}

struct Entry {
    id: SubscriptionId,
    kind: String,
    lineage: Vec<String>,
    hierarchy: bool,
    handler: Arc<dyn ErasedHandler>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    next_id: u64,
}

/// Registry of payload-kind subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plain callback for payloads of kind `T::KIND`.
    ///
    /// With `hierarchy` set the callback also receives payloads whose lineage
    /// contains `T::KIND`.
    pub fn register_callback<T, F>(
        &self,
        hierarchy: bool,
        callback: F,
    ) -> Result<SubscriptionId, BusError>
    where
        T: Payload,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register_entry(
            T::KIND.to_owned(),
            lineage_of::<T>(),
            hierarchy,
            Arc::new(CallbackHandler::<T, F> {
                callback,
                _payload: PhantomData,
            }),
        )
    }

    /// Registers a processor for payloads of kind `T::KIND`.
    ///
    /// # Errors
    /// Fails with `BusError::DuplicateSubscription` when the same processor is
    /// already registered for this kind; unregister it first to re-register.
    pub fn register_processor<T: Payload>(
        &self,
        hierarchy: bool,
        processor: Arc<dyn Processor<T>>,
    ) -> Result<SubscriptionId, BusError> {
        self.register_entry(
            T::KIND.to_owned(),
            lineage_of::<T>(),
            hierarchy,
            Arc::new(ProcessorHandler { processor }),
        )
    }

    /// Registers an untyped callback for an explicit kind tag. Raw
    /// subscriptions never match subtypes.
    pub fn register_raw<F>(&self, kind: &str, callback: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register_entry(kind.to_owned(), vec![], false, Arc::new(RawHandler { callback }))
    }

    fn register_entry(
        &self,
        kind: String,
        lineage: Vec<String>,
        hierarchy: bool,
        handler: Arc<dyn ErasedHandler>,
    ) -> Result<SubscriptionId, BusError> {
        let mut inner = self.inner.write().expect("subscription registry poisoned");

        let identity = handler.identity();
        if identity != 0
            && inner
                .entries
                .iter()
                .any(|e| e.kind == kind && e.handler.identity() == identity)
        {
            return Err(BusError::DuplicateSubscription(kind));
        }

        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.entries.push(Entry {
            id,
            kind,
            lineage,
            hierarchy,
            handler,
        });

        Ok(id)
    }

    /// Removes one subscription. Returns whether it was present. A dispatch
    /// whose handler set was already resolved still runs the removed handler.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.write().expect("subscription registry poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|e| e.id != id);
        inner.entries.len() != before
    }

    /// Removes every subscription.
    pub fn clear(&self) {
        self.inner
            .write()
            .expect("subscription registry poisoned")
            .entries
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("subscription registry poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves the ordered handler set for a runtime kind.
    ///
    /// Exact matches come first in registration order, then hierarchy
    /// subscriptions for each ancestor in lineage order, each group again in
    /// registration order. Non-hierarchy subscriptions never match through the
    /// lineage.
    pub(crate) fn resolve(
        &self,
        kind: &str,
        lineage: &[String],
    ) -> Vec<(SubscriptionId, Arc<dyn ErasedHandler>)> {
        let inner = self.inner.read().expect("subscription registry poisoned");
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();

        for entry in inner.entries.iter().filter(|e| e.kind == kind) {
            seen.insert(entry.id);
            resolved.push((entry.id, entry.handler.clone()));
        }

        for ancestor in lineage {
            for entry in inner
                .entries
                .iter()
                .filter(|e| e.hierarchy && e.kind == *ancestor)
            {
                if seen.insert(entry.id) {
                    resolved.push((entry.id, entry.handler.clone()));
                }
            }
        }

        resolved
    }

    /// Lineage declared by a locally registered payload type, used when a
    /// message carries a kind but no lineage header.
    pub(crate) fn known_lineage(&self, kind: &str) -> Option<Vec<String>> {
        let inner = self.inner.read().expect("subscription registry poisoned");
        inner
            .entries
            .iter()
            .find(|e| e.kind == kind)
            .map(|e| e.lineage.clone())
    }

    /// Types a kindless message by probing registered payload types in
    /// registration order.
    pub(crate) fn probe_kind(&self, body: &Value) -> Option<(String, Vec<String>)> {
        let inner = self.inner.read().expect("subscription registry poisoned");
        inner
            .entries
            .iter()
            .find(|e| e.handler.probe(body))
            .map(|e| (e.kind.clone(), e.lineage.clone()))
    }
}

fn lineage_of<T: Payload>() -> Vec<String> {
    T::lineage().iter().map(|kind| (*kind).to_owned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Data {
        id: i32,
        name: String,
    }

    impl Payload for Data {
        const KIND: &'static str = "Data";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ExtraData {
        id: i32,
        name: String,
        age: i32,
    }

    impl Payload for ExtraData {
        const KIND: &'static str = "ExtraData";

        fn lineage() -> &'static [&'static str] {
            &["Data"]
        }
    }

    struct NullProcessor;

    #[async_trait]
    impl Processor<Data> for NullProcessor {
        async fn process(&self, _ctx: &Context, _payload: Data) -> Result<Option<Value>, BusError> {
            Ok(None)
        }
    }

    fn lineage(kinds: &[&str]) -> Vec<String> {
        kinds.iter().map(|k| (*k).to_owned()).collect()
    }

    #[test]
    fn hierarchy_subscription_matches_descendant_kinds() {
        let registry = SubscriptionRegistry::new();
        let id = registry
            .register_callback::<Data, _>(true, |_data| {})
            .unwrap();

        let resolved = registry.resolve("ExtraData", &lineage(&["Data"]));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].0, id);
    }

    #[test]
    fn exact_subscription_never_matches_descendant_kinds() {
        let registry = SubscriptionRegistry::new();
        registry
            .register_callback::<Data, _>(false, |_data| {})
            .unwrap();

        assert!(registry.resolve("ExtraData", &lineage(&["Data"])).is_empty());
        assert_eq!(registry.resolve("Data", &[]).len(), 1);
    }

    #[test]
    fn resolution_orders_exact_then_nearest_ancestor() {
        let registry = SubscriptionRegistry::new();
        let far = registry.register_raw_hierarchy_for_test("Base");
        let near = registry.register_raw_hierarchy_for_test("Mid");
        let exact = registry
            .register_callback::<ExtraData, _>(false, |_data| {})
            .unwrap();

        let resolved = registry.resolve("ExtraData", &lineage(&["Mid", "Base"]));
        let ids: Vec<SubscriptionId> = resolved.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![exact, near, far]);
    }

    #[test]
    fn registration_order_breaks_ties_within_an_ancestor() {
        let registry = SubscriptionRegistry::new();
        let first = registry
            .register_callback::<Data, _>(true, |_data| {})
            .unwrap();
        let second = registry
            .register_callback::<Data, _>(true, |_data| {})
            .unwrap();

        let resolved = registry.resolve("ExtraData", &lineage(&["Data"]));
        let ids: Vec<SubscriptionId> = resolved.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn duplicate_processor_registration_is_rejected() {
        let registry = SubscriptionRegistry::new();
        let processor: Arc<dyn Processor<Data>> = Arc::new(NullProcessor);

        let id = registry
            .register_processor::<Data>(false, processor.clone())
            .unwrap();
        let err = registry
            .register_processor::<Data>(false, processor.clone())
            .unwrap_err();
        assert_eq!(err, BusError::DuplicateSubscription("Data".to_owned()));

        assert!(registry.unregister(id));
        registry
            .register_processor::<Data>(false, processor)
            .expect("re-registration after unregister");
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let id = registry
            .register_callback::<Data, _>(false, |_data| {})
            .unwrap();

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn resolved_set_is_a_snapshot() {
        let registry = SubscriptionRegistry::new();
        let id = registry
            .register_callback::<Data, _>(false, |_data| {})
            .unwrap();

        let resolved = registry.resolve("Data", &[]);
        registry.unregister(id);

        assert_eq!(resolved.len(), 1);
        assert!(registry.resolve("Data", &[]).is_empty());
    }

    #[test]
    fn known_lineage_comes_from_registered_types() {
        let registry = SubscriptionRegistry::new();
        registry
            .register_callback::<ExtraData, _>(false, |_data| {})
            .unwrap();

        assert_eq!(registry.known_lineage("ExtraData"), Some(lineage(&["Data"])));
        assert_eq!(registry.known_lineage("Data"), None);
    }

    #[test]
    fn probing_types_a_kindless_body_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        registry
            .register_callback::<ExtraData, _>(false, |_data| {})
            .unwrap();
        registry
            .register_callback::<Data, _>(false, |_data| {})
            .unwrap();

        let full = json!({"id": 1, "name": "Rabbit", "age": 5});
        assert_eq!(
            registry.probe_kind(&full),
            Some(("ExtraData".to_owned(), lineage(&["Data"])))
        );

        let unknown = json!({"weight": 3});
        assert_eq!(registry.probe_kind(&unknown), None);
    }

    impl SubscriptionRegistry {
        // Registers a hierarchy marker on an arbitrary kind without needing a
        // payload type for it.
        fn register_raw_hierarchy_for_test(&self, kind: &str) -> SubscriptionId {
            self.register_entry(
                kind.to_owned(),
                vec![],
                true,
                Arc::new(RawHandler {
                    callback: |_body: &Value| {},
                }),
            )
            .unwrap()
        }
    }
}
