//! Worker HTTP API.

mod routes;
mod server;

pub use routes::{Rejection, render, routes};
pub use server::{ServerConfig, bind, cancel_on_signal, serve_listener, serve_router};
