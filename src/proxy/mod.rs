//! Reverse proxy core
//!
//! - [`route`]: application vs provider routing
//! - [`rewrite`]: `Set-Cookie` and `Location` rewriting
//! - [`forward`]: streaming upstream dispatch
//! - [`server`]: middleware stack and graceful shutdown

pub mod forward;
pub mod rewrite;
pub mod route;
pub mod server;

pub use forward::ProxyState;
pub use route::{Routing, Target};
pub use server::{ProxyServer, build_router, serve_until};
