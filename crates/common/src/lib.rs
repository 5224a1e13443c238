//! Common crate
//!
//! Shared types and error handling for Hangar.
//!
//! # Example
//! ```rust
//! use hangar_common::Error;
//! let err = Error::execution("table orders does not exist");
//! assert!(err.to_string().contains("orders"));
//! ```

pub mod dataset;
pub mod error;

pub use dataset::{DatasetDef, DatasetSource};
pub use error::{Error, Result};
