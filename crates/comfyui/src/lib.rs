//! ComfyUI engine integration for the kiln worker.
//!
//! Covers everything that talks to the rendering engine: the HTTP API
//! wrapper, history parsing, supervision of the engine subprocess, and
//! the submit/poll half of a job's lifecycle.

pub mod api;
pub mod engine;
pub mod history;
pub mod launcher;
pub mod poller;
pub mod submitter;
pub mod supervisor;
