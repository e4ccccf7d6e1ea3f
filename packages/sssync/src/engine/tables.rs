//! In-memory table store boundary and the default implementation.
//!
//! The engine only depends on the `TableStore` trait; reactive UI containers
//! implement the same four operations and can be swapped in without touching
//! the core.

use serde_json::Value;

use crate::engine::types::{shallow_merge, MaterializerAction, TableName, Tables};
use crate::error::{SyncError, SyncResult};

/// Contract between the engine and the in-memory row container.
pub trait TableStore {
    /// Read accessor over all materialized tables.
    fn data(&self) -> &Tables;

    /// Full replace, used once at startup load.
    fn hydrate(&mut self, data: Tables);

    /// Insert-or-replace by id, used by rescan.
    fn upsert(&mut self, table: &str, row: Value) -> SyncResult<()>;

    /// Apply an ordered batch of create/update actions, used by commit.
    fn mutate(&mut self, actions: &[MaterializerAction]) -> SyncResult<()>;
}

fn row_id(row: &Value) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

fn position_of(rows: &[Value], id: &str) -> Option<usize> {
    rows.iter().position(|row| row_id(row) == Some(id))
}

/// Plain `Vec`-backed store. Rows keep insertion order.
#[derive(Debug, Default)]
pub struct DefaultTableStore {
    data: Tables,
}

impl DefaultTableStore {
    pub fn new(table_names: impl IntoIterator<Item = TableName>) -> Self {
        let data = table_names
            .into_iter()
            .map(|name| (name, Vec::new()))
            .collect();
        Self { data }
    }
}

impl TableStore for DefaultTableStore {
    fn data(&self) -> &Tables {
        &self.data
    }

    fn hydrate(&mut self, data: Tables) {
        self.data = data;
    }

    fn upsert(&mut self, table: &str, row: Value) -> SyncResult<()> {
        let rows = self
            .data
            .get_mut(table)
            .ok_or_else(|| SyncError::UnknownTable(table.to_string()))?;
        match row_id(&row).and_then(|id| position_of(rows, id)) {
            Some(index) => rows[index] = row,
            None => rows.push(row),
        }
        Ok(())
    }

    fn mutate(&mut self, actions: &[MaterializerAction]) -> SyncResult<()> {
        for action in actions {
            let rows = self
                .data
                .get_mut(action.table().as_str())
                .ok_or_else(|| SyncError::UnknownTable(action.table().to_string()))?;
            match action {
                MaterializerAction::Create { value, .. } => {
                    // Create appends only when the id is absent.
                    let exists = row_id(value)
                        .and_then(|id| position_of(rows, id))
                        .is_some();
                    if !exists {
                        rows.push(value.clone());
                    }
                }
                MaterializerAction::Update { value, .. } => {
                    // Update merges shallowly, no-op when the id is absent.
                    let Some(index) = row_id(value).and_then(|id| position_of(rows, id)) else {
                        continue;
                    };
                    rows[index] = shallow_merge(&rows[index], value);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use smol_str::SmolStr;

    fn store() -> DefaultTableStore {
        DefaultTableStore::new([SmolStr::new("pages")])
    }

    #[test]
    fn test_create_appends_in_order() {
        let mut store = store();
        store
            .mutate(&[
                MaterializerAction::create("pages", json!({"id": "a", "title": "A"})),
                MaterializerAction::create("pages", json!({"id": "b", "title": "B"})),
            ])
            .unwrap();
        let rows = &store.data()["pages"];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "a");
        assert_eq!(rows[1]["id"], "b");
    }

    #[test]
    fn test_create_is_noop_for_duplicate_id() {
        let mut store = store();
        store
            .mutate(&[
                MaterializerAction::create("pages", json!({"id": "a", "title": "first"})),
                MaterializerAction::create("pages", json!({"id": "a", "title": "second"})),
            ])
            .unwrap();
        let rows = &store.data()["pages"];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "first");
    }

    #[test]
    fn test_update_merges_fields_shallowly() {
        let mut store = store();
        store
            .mutate(&[
                MaterializerAction::create("pages", json!({"id": "a", "title": "A", "views": 1})),
                MaterializerAction::update("pages", json!({"id": "a", "title": "A2"})),
            ])
            .unwrap();
        assert_eq!(
            store.data()["pages"][0],
            json!({"id": "a", "title": "A2", "views": 1})
        );
    }

    #[test]
    fn test_update_is_noop_for_missing_row() {
        let mut store = store();
        store
            .mutate(&[MaterializerAction::update(
                "pages",
                json!({"id": "ghost", "title": "x"}),
            )])
            .unwrap();
        assert!(store.data()["pages"].is_empty());
    }

    #[test]
    fn test_upsert_inserts_then_replaces() {
        let mut store = store();
        store
            .upsert("pages", json!({"id": "a", "title": "v1"}))
            .unwrap();
        store
            .upsert("pages", json!({"id": "a", "title": "v2"}))
            .unwrap();
        let rows = &store.data()["pages"];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "v2");
    }

    #[test]
    fn test_unknown_table_is_an_error() {
        let mut store = store();
        let err = store
            .mutate(&[MaterializerAction::create("ghosts", json!({"id": "a"}))])
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownTable(name) if name == "ghosts"));
    }

    #[test]
    fn test_hydrate_replaces_everything() {
        let mut store = store();
        store
            .upsert("pages", json!({"id": "old"}))
            .unwrap();
        let mut fresh = Tables::default();
        fresh.insert(SmolStr::new("pages"), vec![json!({"id": "new"})]);
        store.hydrate(fresh);
        assert_eq!(store.data()["pages"][0]["id"], "new");
    }
}
