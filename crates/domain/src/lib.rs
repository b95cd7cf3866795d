//! Value types shared across the realtime client crates:
//! error taxonomy, client options and credential types.

pub mod auth;
pub mod config;
pub mod error;

pub use auth::{AuthOptions, TokenDetails, TokenParams};
pub use config::{ClientOptions, ConfigError, ConfigSeverity};
pub use error::{codes, ErrorInfo, ErrorKind};
