//! Multi-host test network build engine.
//!
//! Places nodes on servers, gives every node its own network segment, starts
//! the containers over remote shells and tracks the progress of all that
//! fan-out work so network-type plugins can build on top of it.

pub mod address;
pub mod allocator;
pub mod cli;
pub mod config;
pub mod context;
pub mod deploy;
pub mod distribute;
pub mod error;
pub mod fanout;
pub mod plugin;
pub mod remote;
pub mod resources;
pub mod runtime;
pub mod state;
pub mod types;

pub use config::Config;
pub use context::BuildContext;
pub use deploy::{BuildReport, Deployer};
pub use error::{Error, Result};
pub use plugin::{NetworkBuilder, Registry};
