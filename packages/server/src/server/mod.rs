//! REST surface (spec §6): wires C1-C10 into an axum router.

pub mod app;
pub mod routes;

pub use app::{build_app, AppState};
