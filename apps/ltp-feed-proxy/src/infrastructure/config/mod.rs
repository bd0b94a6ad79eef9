//! Configuration Module
//!
//! Environment-driven configuration for the proxy service.

mod settings;

pub use settings::{
    AccessToken, ConfigError, FallbackSettings, PrimaryFeedSettings, ProxyConfig,
    RegistrySettings, ServerSettings, SupervisorSettings,
};
