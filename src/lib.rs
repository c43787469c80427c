//! tracedx: a read-only streaming search provider in front of a columnar
//! store of protocol messages and test events.

pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod model;
pub mod observability;
pub mod search;
pub mod server;
pub mod sse;
pub mod store;

pub use config::Config;
pub use error::{ProviderError, Result};
