//! Datasets and modules.
//!
//! Their content is produced and validated by other services. The store
//! keeps what job validation and model fan-out need: ownership, schemas,
//! status, and the lease field that the reaper clears.

use crate::error::StateResult;
use crate::store::{Document, Leasable, StateStore};
use crate::tables::{DATASETS, MODULES};
use crate::types::*;

impl Document for Dataset {
    const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> = DATASETS;
    const KIND: &'static str = "dataset";

    fn key(&self) -> &str {
        &self.id
    }
}

impl Leasable for Dataset {
    fn holder(&self) -> Option<&str> {
        self.process.as_deref()
    }

    fn set_holder(&mut self, process: Option<String>) {
        self.process = process;
    }

    fn releasable_on_death(&self) -> bool {
        self.status != DatasetStatus::Error
    }
}

impl Document for Module {
    const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> = MODULES;
    const KIND: &'static str = "module";

    fn key(&self) -> &str {
        &self.id
    }
}

impl Leasable for Module {
    fn holder(&self) -> Option<&str> {
        self.process.as_deref()
    }

    fn set_holder(&mut self, process: Option<String>) {
        self.process = process;
    }

    fn releasable_on_death(&self) -> bool {
        self.status != ModuleStatus::Error
    }
}

impl StateStore {
    // ── Datasets ───────────────────────────────────────────────────

    /// Insert or update a dataset.
    pub fn put_dataset(&self, dataset: &Dataset) -> StateResult<()> {
        self.put(dataset)
    }

    pub fn get_dataset(&self, id: &str) -> StateResult<Dataset> {
        self.fetch_required(id)
    }

    // ── Modules ────────────────────────────────────────────────────

    /// Insert or update a module.
    pub fn put_module(&self, module: &Module) -> StateResult<()> {
        self.put(module)
    }

    pub fn get_module(&self, id: &str) -> StateResult<Module> {
        self.fetch_required(id)
    }

    pub fn list_modules(&self, kind: ModuleKind) -> StateResult<Vec<Module>> {
        self.scan(|m: &Module| m.kind == kind)
    }
}
