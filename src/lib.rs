//! openwork library root.

pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod router;
pub mod session;
pub mod sidecar;
pub mod supervise;

pub use cli::Commands;
pub use config::Config;
pub use error::{Error, Result};
pub use sidecar::{SidecarBinary, SourcePreference};
