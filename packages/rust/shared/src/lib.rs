//! Shared types, error model, and configuration for SourceHub.
//!
//! This crate is the foundation depended on by all other SourceHub crates.
//! It provides:
//! - [`SourceHubError`]: the unified error type
//! - Domain types ([`InstanceConfig`], [`ProviderSpec`], [`CapabilitySet`], [`ResultEnvelope`])
//! - Configuration ([`AppConfig`], [`DispatchConfig`], [`SupervisorConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DispatchConfig, SupervisorConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, parse_config,
};
pub use error::{Result, SourceHubError};
pub use types::{
    Capability, CapabilitySet, DEFAULT_PROVIDER_TYPE, FieldKind, InstanceConf, InstanceConfig,
    InstanceParam, Params, ProviderSpec, ResultEnvelope, SpecField, resolve_params,
};
