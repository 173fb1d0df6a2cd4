//! Configuration Module
//!
//! Environment-driven configuration for the datafeed.

mod settings;

pub use settings::{
    BatchPacing, ConfigError, DatafeedConfig, EndpointSettings, RequestDefaults, RetrySettings,
};
