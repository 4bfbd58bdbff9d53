//! Sluice node daemon (sluiced)
//!
//! Hosts the metadata layer of a CDC pipeline runner: the local metadata
//! cache, coordinator synchronization, and replication progress tracking.
//!
//! ## Deployment Modes
//!
//! - **Standalone**: Single node, local metadata only
//! - **Cluster**: Several nodes sharing a coordinator (MySQL, or the
//!   in-process memory backend for local testing)
//!
//! ## Quick Start
//!
//! ```bash
//! # Standalone mode
//! sluiced
//!
//! # Cluster mode
//! sluiced --mode cluster --node-url http://node-1:8060 \
//!   --coordinator mysql --mysql-url mysql://sluice@db:3306/sluice
//! ```

pub mod cli;
pub mod daemon;
pub mod settings;

pub use cli::{Backend, Cli, DeploymentMode};
pub use daemon::{Daemon, ShutdownHandle};
pub use settings::{expand_env_vars, Settings};
