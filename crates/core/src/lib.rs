//! Shared building blocks for the kiln render worker.
//!
//! Holds the pieces every other crate agrees on: the job id sanitizer,
//! the collision-free artifact naming scheme, storage mode resolution,
//! content-type detection and the common error type.

pub mod content_type;
pub mod error;
pub mod naming;
pub mod storage;
pub mod types;
