//! Bootstrap core of a single-container web stack.
//!
//! `stackgate` waits for the datastore, then supervises the application
//! processes and exposes a loopback control surface. `stackgate-edge` is
//! the path based reverse proxy in front of them.

pub mod admin;
pub mod config;
pub mod error;
pub mod logging;
pub mod probe;
pub mod proxy;
pub mod service;
pub mod supervisor;
pub(crate) mod utils;
