//! Provider capability trait, provider factories, and the spec catalog.
//!
//! A [`ProviderFactory`] describes one provider type (its [`ProviderSpec`]) and
//! builds runtime [`SourceProvider`] objects from instance records. The
//! [`ProviderRegistry`] holds factories in registration order and doubles as the
//! spec catalog used by configuration tooling.

mod sdk;
mod static_list;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use sourcehub_shared::{
    Capability, CapabilitySet, InstanceConf, Params, ProviderSpec, Result, ResultEnvelope,
    SourceHubError,
};

pub use sdk::{SdkSource, SdkSourceFactory, launch_args, reserve_loopback_port};
pub use static_list::{StaticListFactory, StaticListSource};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Runtime provider object behind one instance.
///
/// Every operation has a default that reports the capability as unsupported;
/// the instance's [`CapabilitySet`] decides which ones are ever called.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Provider type name for tracing.
    fn provider_type(&self) -> &str;

    /// Instance-specific handshake/startup.
    async fn activate(&self, _params: &Params) -> Result<Value> {
        Err(unsupported(self.provider_type(), Capability::Activate))
    }

    /// Search for items matching `keyword`.
    async fn search(
        &self,
        _synchronous: bool,
        _keyword: &str,
        _params: &Params,
    ) -> Result<ResultEnvelope> {
        Err(unsupported(self.provider_type(), Capability::Search))
    }

    /// Collect items on a periodic trigger.
    async fn schedule(&self, _synchronous: bool, _params: &Params) -> Result<ResultEnvelope> {
        Err(unsupported(self.provider_type(), Capability::Schedule))
    }
}

fn unsupported(provider_type: &str, capability: Capability) -> SourceHubError {
    SourceHubError::provider(
        provider_type,
        capability.as_str(),
        "operation not supported by this provider",
    )
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Everything a factory needs to build one instance.
#[derive(Debug, Clone, Copy)]
pub struct ProviderContext<'a> {
    pub instance_id: &'a str,
    pub instance_name: &'a str,
    pub conf: &'a InstanceConf,
    /// `conf.instance_params` resolved into a mapping.
    pub params: &'a Params,
    /// Bound applied to each provider call.
    pub call_timeout: Duration,
}

impl ProviderContext<'_> {
    /// Capabilities from `conf.capabilities`, falling back to `default`.
    pub fn capabilities_or(&self, default: CapabilitySet) -> CapabilitySet {
        match &self.conf.capabilities {
            Some(caps) => caps.iter().copied().collect(),
            None => default,
        }
    }
}

/// How to start the child process of a subprocess-backed provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// A freshly built provider, ready to be wrapped into an instance.
pub struct BuiltProvider {
    pub provider: Arc<dyn SourceProvider>,
    pub capabilities: CapabilitySet,
    /// Present for subprocess-backed providers; the caller must launch it.
    pub launch: Option<LaunchSpec>,
}

impl std::fmt::Debug for BuiltProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltProvider")
            .field("provider_type", &self.provider.provider_type())
            .field("capabilities", &self.capabilities)
            .field("launch", &self.launch)
            .finish()
    }
}

/// Builds providers of one type and describes them.
pub trait ProviderFactory: Send + Sync {
    /// Type name matched against `provider_type` in instance records.
    fn provider_type(&self) -> &str;

    /// Declarative description(s) for configuration tooling.
    fn spec(&self) -> Vec<ProviderSpec>;

    /// Build a provider for one instance record.
    fn build(&self, ctx: &ProviderContext<'_>) -> Result<BuiltProvider>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Holds registered provider factories in registration order.
pub struct ProviderRegistry {
    factories: Vec<Box<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    /// Create a registry with all built-in provider types.
    pub fn new() -> Self {
        Self::empty()
            .with(StaticListFactory)
            .with(SdkSourceFactory)
    }

    /// Create a registry with no provider types.
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Register a factory, replacing any factory with the same type name.
    pub fn with(mut self, factory: impl ProviderFactory + 'static) -> Self {
        self.register(Box::new(factory));
        self
    }

    /// Register a boxed factory, replacing any factory with the same type name.
    pub fn register(&mut self, factory: Box<dyn ProviderFactory>) {
        match self
            .factories
            .iter()
            .position(|f| f.provider_type() == factory.provider_type())
        {
            Some(idx) => self.factories[idx] = factory,
            None => self.factories.push(factory),
        }
    }

    /// Look up the factory for a provider type.
    pub fn get(&self, provider_type: &str) -> Option<&dyn ProviderFactory> {
        self.factories
            .iter()
            .find(|f| f.provider_type() == provider_type)
            .map(|f| f.as_ref())
    }

    /// Registered type names, in registration order.
    pub fn provider_types(&self) -> Vec<&str> {
        self.factories.iter().map(|f| f.provider_type()).collect()
    }

    /// The spec catalog: ordered union of every factory's specs.
    pub fn specs(&self) -> Vec<ProviderSpec> {
        self.factories.iter().flat_map(|f| f.spec()).collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("provider_types", &self.provider_types())
            .finish()
    }
}
