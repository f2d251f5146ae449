//! HTTP gateway: router, middleware, dispatchers, server lifecycle

pub mod auth;
pub mod rest;
pub mod router;
pub mod rpc;
pub mod server;

pub use router::{AppState, create_router};
pub use server::{Collaborators, Gateway};
