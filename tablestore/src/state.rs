// tablestore/src/state.rs

use common::MemoryTableStore;

#[derive(Clone, Default)]
pub struct AppState {
    // todas las tablas viven en memoria mientras el proceso esté vivo
    pub store: MemoryTableStore,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }
}
