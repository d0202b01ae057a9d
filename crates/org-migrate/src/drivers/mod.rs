//! Store drivers.
//!
//! - [`rest`]: organizations reached over their REST query API

pub mod rest;

pub use rest::RestStore;
