//! Fixtures shared by the entity tests.

use std::collections::BTreeMap;

use crate::jobs::NewJob;
use crate::store::StateStore;
use crate::types::*;

pub const SCHEMA_IN: &str = "tensor[4]";
pub const SCHEMA_OUT: &str = "category[3]";

pub fn dataset(id: &str, schema_in: &str, status: DatasetStatus) -> Dataset {
    Dataset {
        id: id.to_string(),
        user: ROOT_USER.to_string(),
        schema_in: schema_in.to_string(),
        schema_out: SCHEMA_OUT.to_string(),
        status,
        process: None,
    }
}

pub fn module(id: &str, kind: ModuleKind, status: ModuleStatus) -> Module {
    Module {
        id: id.to_string(),
        user: ROOT_USER.to_string(),
        kind,
        schema_in: SCHEMA_IN.to_string(),
        schema_out: SCHEMA_OUT.to_string(),
        config_space: format!(r#"{{"{id}-depth":{{".choice":[1,2,3]}}}}"#),
        status,
        process: None,
    }
}

/// In-memory store with a validated dataset `iris`, active models `m1`
/// and `m2`, and active objectives `accuracy` and `f1`.
pub fn seeded_store() -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    store
        .put_dataset(&dataset("iris", SCHEMA_IN, DatasetStatus::Validated))
        .unwrap();
    for id in ["m1", "m2"] {
        store
            .put_module(&module(id, ModuleKind::Model, ModuleStatus::Active))
            .unwrap();
    }
    for id in ["accuracy", "f1"] {
        store
            .put_module(&module(id, ModuleKind::Objective, ModuleStatus::Active))
            .unwrap();
    }
    store
}

pub fn new_job(models: &[&str]) -> NewJob {
    NewJob {
        dataset: "iris".to_string(),
        models: models.iter().map(|m| m.to_string()).collect(),
        config_overrides: BTreeMap::new(),
        accept_new_models: true,
        objective: "accuracy".to_string(),
        alt_objectives: vec!["f1".to_string()],
        max_tasks: 0,
    }
}
