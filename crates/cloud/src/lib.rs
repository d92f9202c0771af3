//! Artifact delivery: object storage, the persistent volume, and the
//! dispatcher that routes artifacts between them.

pub mod dispatcher;
pub mod error;
pub mod redact;
pub mod s3;
pub mod store;
pub mod volume;
