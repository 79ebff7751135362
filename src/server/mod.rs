// src/server/mod.rs

//! The server module: initialization, background task spawning, the TCP
//! accept loop, request dispatch, and the HTTP query surface.

pub mod connection_loop;
pub mod dispatch;
pub mod http_api;
pub mod initialization;
pub mod spawner;

pub use initialization::run;
