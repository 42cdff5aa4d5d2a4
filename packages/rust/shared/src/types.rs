//! Core domain types for SourceHub providers and instances.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Provider type used when an instance record does not name one.
pub const DEFAULT_PROVIDER_TYPE: &str = "sdk_source_provider";

/// Named call/initialisation parameters, ordered by name.
pub type Params = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// One operation a provider instance may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Search,
    Schedule,
    Activate,
}

impl Capability {
    /// All capabilities, in display order.
    pub const ALL: [Capability; 3] = [Self::Search, Self::Schedule, Self::Activate];

    /// Name used in logs and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Schedule => "schedule",
            Self::Activate => "activate",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::Search => 0b001,
            Self::Schedule => 0b010,
            Self::Activate => 0b100,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of capabilities attached to an instance when it is built.
///
/// Serialized as a list of capability names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<Capability>", from = "Vec<Capability>")]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every capability.
    pub fn all() -> Self {
        Self::from_iter(Capability::ALL)
    }

    /// Return a copy with `capability` added.
    pub fn with(mut self, capability: Capability) -> Self {
        self.0 |= capability.bit();
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate over the contained capabilities in display order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl From<Vec<Capability>> for CapabilitySet {
    fn from(caps: Vec<Capability>) -> Self {
        caps.into_iter().collect()
    }
}

impl From<CapabilitySet> for Vec<Capability> {
    fn from(set: CapabilitySet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|c| c.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

// ---------------------------------------------------------------------------
// ProviderSpec
// ---------------------------------------------------------------------------

/// Kind of value a configuration field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Boolean,
    Path,
    List,
    Json,
}

/// One configuration field accepted by a provider type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecField {
    /// Parameter name as it appears in `instance_params`.
    pub name: String,
    /// Expected value kind.
    pub kind: FieldKind,
    /// Whether instances must supply the field.
    #[serde(default)]
    pub required: bool,
    /// Value used when the field is omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Help text for configuration tooling.
    #[serde(default)]
    pub description: String,
}

/// Declarative description of a provider type, used by configuration tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Provider type name, matched against `provider_type` in instance records.
    pub provider_type: String,
    /// Human-readable name.
    pub display_name: String,
    /// Short description of what the provider does.
    #[serde(default)]
    pub description: String,
    /// Capabilities instances of this type implement by default.
    pub capabilities: CapabilitySet,
    /// Accepted configuration fields.
    #[serde(default)]
    pub fields: Vec<SpecField>,
}

// ---------------------------------------------------------------------------
// Instance configuration
// ---------------------------------------------------------------------------

/// A single `{name, value}` initialisation parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceParam {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

/// Provider-specific part of an instance record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConf {
    /// Executable path for subprocess-backed providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<String>,
    /// Ordered initialisation parameters.
    #[serde(default)]
    pub instance_params: Vec<InstanceParam>,
    /// Capability override; falls back to the provider type's spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<Capability>>,
    /// Any other provider-specific fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A persisted instance record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Stable identifier, unique across the table.
    pub id: String,
    /// Disabled records are never loaded.
    #[serde(default, alias = "enabled")]
    pub enable: bool,
    /// Display name for logs (defaults to the id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    /// Provider type to instantiate.
    #[serde(default = "default_provider_type")]
    pub provider_type: String,
    /// Provider-specific fields.
    pub conf: InstanceConf,
}

fn default_provider_type() -> String {
    DEFAULT_PROVIDER_TYPE.into()
}

impl InstanceConfig {
    /// Name used to tag this instance's log lines.
    pub fn display_name(&self) -> &str {
        self.instance_name.as_deref().unwrap_or(&self.id)
    }

    /// Resolve `conf.instance_params` into a name → value mapping.
    pub fn resolved_params(&self) -> Params {
        resolve_params(&self.conf.instance_params)
    }
}

/// Collapse ordered `{name, value}` pairs into a mapping; later names win.
pub fn resolve_params(params: &[InstanceParam]) -> Params {
    params
        .iter()
        .map(|p| (p.name.clone(), p.value.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// ResultEnvelope
// ---------------------------------------------------------------------------

/// Value returned by one instance's `search` or `schedule`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Opaque result items; absent or `null` means no items.
    #[serde(default)]
    pub data: Option<Vec<Value>>,
}

impl ResultEnvelope {
    pub fn new(items: Vec<Value>) -> Self {
        Self { data: Some(items) }
    }

    /// Consume the envelope, yielding its items (empty when absent).
    pub fn into_items(self) -> Vec<Value> {
        self.data.unwrap_or_default()
    }
}
