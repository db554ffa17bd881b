// src/lib.rs

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod exam;
pub mod handlers;
pub mod models;
pub mod monitor;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod sync;
pub mod utils;

// Re-export specific items for convenience if needed
pub use routes::create_router;
pub use session::{ExamSession, SessionDeps};
