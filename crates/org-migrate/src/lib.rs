//! # org-migrate
//!
//! Phase-ordered record migration planning between two organizations.
//!
//! This library decides which records move, in what order and with which
//! operation, and makes the result reversible:
//!
//! - **Plans** per phase from a declarative object/relationship graph and a
//!   curated master record selection
//! - **Backups** of every target record a plan will touch, taken before the run
//! - **Reconciliation** of the records a completed run created
//! - **Rollback plans** that invert a run from its backup
//!
//! The records themselves are moved by an external transfer tool that reads
//! the plan documents this crate writes.
//!
//! ## Example
//!
//! ```rust,no_run
//! use org_migrate::{Config, Orchestrator, PlanScope};
//!
//! #[tokio::main]
//! async fn main() -> org_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config)?.connect()?;
//!     for phase in orchestrator.plan(PlanScope::All)? {
//!         println!("phase {} -> {}", phase.phase, phase.path.display());
//!     }
//!     let backup = orchestrator.backup(Some(1), None).await?;
//!     println!("{}", backup.summary());
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod plan;
pub mod query;
pub mod reconcile;
pub mod rollback;
pub mod selection;
pub mod tabular;

// Re-exports for convenient access
pub use backup::{BackupEngine, BackupManifest, BackupObject, BackupOutcome, BackupTarget};
pub use config::{Config, MigrationConfig, Operation, OrgConfig, PartialValuePolicy};
pub use crate::core::{ExternalIdSpec, MetadataDescriber, QueryPage, Record, RecordStore};
pub use drivers::RestStore;
pub use error::{MigrateError, ObjectWarning, Result};
pub use graph::{ObjectRole, PhaseGraph, Relationship};
pub use orchestrator::{Orchestrator, Stores};
pub use plan::{Plan, PlanAssembler, PlanDocument, PlanObject, PlanScope};
pub use query::{BuiltQuery, QueryBuilder};
pub use reconcile::{ReconcileOutcome, Reconciler, RunWindow};
pub use rollback::{plan_rollback, RollbackMode, RollbackPlan};
pub use selection::{SelectedRecord, SelectionSet};
