pub mod app_state;
pub mod cache;
pub mod config;
pub mod query;
pub mod routes;
pub mod service;
pub mod store;
pub mod tile;
pub mod tracing;
