#![allow(clippy::uninlined_format_args)]

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod output;
pub mod protocol;
pub mod reassembly;
pub mod registry;
pub mod sanitize;
pub mod session;
pub mod stats;
pub mod tls;

pub use config::EngineConfig;
pub use engine::{DecodedData, Engine};
pub use error::{Error, ErrorKind, Result};
pub use protocol::{Direction, LinkType, SessionKey};
pub use registry::KeyFormat;
pub use stats::SessionStats;
