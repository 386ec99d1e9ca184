pub mod api;
pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod identity;
pub mod locator;
pub mod memory;
pub mod output;
pub mod retry;
pub mod schema;
pub mod store;
pub mod writer;

pub use cleanup::CleanupSupervisor;
pub use config::{validate_output_spec, JobConf, OutputConfig};
pub use coordinator::{CommitCoordinator, CommitRecord, CommitStatus, JobCommitOutcome};
pub use error::{CleanupWarning, CommitError, CommitResult, StoreError, StoreResult};
pub use http::HttpTableStore;
pub use identity::{
    resolve_attempt_identity, resolve_job_identity, AttemptIdentity, JobIdentity, TaskContext,
};
pub use locator::{
    attempt_staging_locator, final_locator, staging_area_locator, DatasetLocator, TableLocator,
};
pub use memory::MemoryTableStore;
pub use output::{OutputFormat, StagedTableOutput};
pub use retry::RetryPolicy;
pub use schema::TableSchema;
pub use store::{Record, TableInfo, TableStore};
pub use writer::{AttemptWriter, WriterState};
