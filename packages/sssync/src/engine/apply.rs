//! Event application: validate a raw event, run its materializer, apply the
//! resulting actions and derive the durable keys it touched.
//!
//! All lookups and validation happen before any table mutation; a failing
//! event never leaves a partial write behind.

use smol_str::SmolStr;

use crate::engine::tables::TableStore;
use crate::engine::types::{
    EventDefinition, EventEnvelope, FastMap, KeyList, Materializer, MaterializerAction,
    MaterializerContext, RawEvent,
};
use crate::error::{SyncError, SyncResult};
use crate::schema::ValidationError;

/// Declared events and their materializers.
#[derive(Default)]
pub struct EventRegistry {
    definitions: FastMap<SmolStr, EventDefinition>,
    materializers: FastMap<SmolStr, Materializer>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, definition: EventDefinition) {
        self.definitions.insert(definition.name.clone(), definition);
    }

    pub fn on<F>(&mut self, name: impl Into<SmolStr>, materializer: F)
    where
        F: Fn(&serde_json::Value, &MaterializerContext<'_>) -> Vec<MaterializerAction>
            + Send
            + Sync
            + 'static,
    {
        self.materializers.insert(name.into(), Box::new(materializer));
    }

    pub fn definition(&self, name: &str) -> Option<&EventDefinition> {
        self.definitions.get(name)
    }

    pub fn materializer(&self, name: &str) -> Option<&Materializer> {
        self.materializers.get(name)
    }
}

/// Full result of one applied event.
#[derive(Debug)]
pub struct AppliedEvent {
    pub envelope: EventEnvelope,
    pub actions: Vec<MaterializerAction>,
    pub touched_keys: KeyList,
}

/// Runs one raw event through lookup, validation, materialization and table
/// application.
pub fn apply_event(
    registry: &EventRegistry,
    store: &mut dyn TableStore,
    raw: &RawEvent,
) -> SyncResult<AppliedEvent> {
    let definition = registry
        .definition(&raw.name)
        .ok_or_else(|| SyncError::UnknownEvent(raw.name.to_string()))?;
    let payload = definition.schema.validate(&raw.payload)?;
    let materializer = registry
        .materializer(&raw.name)
        .ok_or_else(|| SyncError::MissingMaterializer(raw.name.to_string()))?;

    let envelope = EventEnvelope {
        id: raw.id.clone(),
        name: raw.name.clone(),
        payload,
        timestamp: raw.timestamp,
    };

    let actions = {
        let context = MaterializerContext {
            tables: store.data(),
            event: &envelope,
        };
        materializer(&envelope.payload, &context)
    };

    // Reject bad actions before the first mutation lands.
    let touched_keys = check_actions(store, &actions)?;
    store.mutate(&actions)?;

    Ok(AppliedEvent {
        envelope,
        actions,
        touched_keys,
    })
}

fn check_actions(store: &dyn TableStore, actions: &[MaterializerAction]) -> SyncResult<KeyList> {
    let mut touched = KeyList::new();
    for action in actions {
        if !store.data().contains_key(action.table().as_str()) {
            return Err(SyncError::UnknownTable(action.table().to_string()));
        }
        let key = action.record_key().ok_or_else(|| {
            ValidationError::single("value.id", "actions must carry a string id")
        })?;
        if !touched.contains(&key) {
            touched.push(key);
        }
    }
    Ok(touched)
}
