//! Private management interface for the PayID registry.

pub mod server;


pub use server::{build_router, start_server, AppState};
