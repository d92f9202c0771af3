pub mod collector;
pub mod config;
pub mod error;
pub mod handler;
pub mod models;
pub mod routes;
pub mod state;
