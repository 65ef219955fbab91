pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod loss;
pub mod mirror;
pub mod policy;
pub mod producer;
pub mod service;
pub mod template_store;

pub use error::{FlowmirrorError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
