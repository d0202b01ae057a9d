//! Core abstractions shared by every component:
//!
//! - [`identifier`]: identifier validation and literal quoting
//! - [`external_id`]: external id specs and composite values
//! - [`record`]: record field access
//! - [`traits`]: store query and describe collaborators

pub mod external_id;
pub mod identifier;
pub mod record;
pub mod traits;

pub use external_id::{ExternalIdSpec, KeyPart};
pub use record::{Record, ID_FIELD};
pub use traits::{MetadataDescriber, QueryPage, RecordStore};
