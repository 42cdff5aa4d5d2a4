//! Source provider interface, built-in providers, and the provider spec catalog.
//!
//! This crate provides:
//! - [`SourceProvider`]: the capability interface every instance implements
//! - [`ProviderFactory`] / [`ProviderRegistry`]: provider types and the spec catalog
//! - [`StaticListSource`]: in-process provider serving configured items
//! - [`SdkSource`]: proxy for providers running as SDK subprocesses

pub mod sources;

pub use sources::{
    BuiltProvider, LaunchSpec, ProviderContext, ProviderFactory, ProviderRegistry, SdkSource,
    SdkSourceFactory, SourceProvider, StaticListFactory, StaticListSource, launch_args,
    reserve_loopback_port,
};
