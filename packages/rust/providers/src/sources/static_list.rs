//! In-process provider serving a fixed item list.
//!
//! Items come from the `items` instance parameter. `search` keeps items whose
//! title contains the keyword; `schedule` returns every item.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use sourcehub_shared::{
    Capability, CapabilitySet, FieldKind, Params, ProviderSpec, Result, ResultEnvelope,
    SourceHubError, SpecField,
};

use super::{BuiltProvider, ProviderContext, ProviderFactory, SourceProvider};

const PROVIDER_TYPE: &str = "static_source_provider";

/// Factory for [`StaticListSource`].
pub struct StaticListFactory;

impl StaticListFactory {
    fn default_capabilities() -> CapabilitySet {
        CapabilitySet::empty()
            .with(Capability::Search)
            .with(Capability::Schedule)
    }
}

impl ProviderFactory for StaticListFactory {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    fn spec(&self) -> Vec<ProviderSpec> {
        vec![ProviderSpec {
            provider_type: PROVIDER_TYPE.into(),
            display_name: "Static list".into(),
            description: "Serves a fixed list of items configured on the instance.".into(),
            capabilities: Self::default_capabilities(),
            fields: vec![SpecField {
                name: "items".into(),
                kind: FieldKind::List,
                required: false,
                default: Some(json!([])),
                description: "Items returned by search and schedule.".into(),
            }],
        }]
    }

    fn build(&self, ctx: &ProviderContext<'_>) -> Result<BuiltProvider> {
        let items = match ctx.params.get("items") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(SourceHubError::config(format!(
                    "instance {}: `items` must be a list, got {other}",
                    ctx.instance_id
                )));
            }
        };

        Ok(BuiltProvider {
            provider: Arc::new(StaticListSource::new(ctx.instance_name, items)),
            capabilities: ctx.capabilities_or(Self::default_capabilities()),
            launch: None,
        })
    }
}

/// Provider returning a fixed set of items.
#[derive(Debug, Clone)]
pub struct StaticListSource {
    instance_name: String,
    items: Vec<Value>,
}

impl StaticListSource {
    pub fn new(instance_name: impl Into<String>, items: Vec<Value>) -> Self {
        Self {
            instance_name: instance_name.into(),
            items,
        }
    }
}

#[async_trait]
impl SourceProvider for StaticListSource {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    async fn activate(&self, _params: &Params) -> Result<Value> {
        Ok(json!({
            "instance": self.instance_name,
            "items": self.items.len(),
        }))
    }

    async fn search(
        &self,
        _synchronous: bool,
        keyword: &str,
        _params: &Params,
    ) -> Result<ResultEnvelope> {
        let needle = keyword.to_lowercase();
        let items = self
            .items
            .iter()
            .filter(|item| needle.is_empty() || item_title(item).to_lowercase().contains(&needle))
            .cloned()
            .collect();
        Ok(ResultEnvelope::new(items))
    }

    async fn schedule(&self, _synchronous: bool, _params: &Params) -> Result<ResultEnvelope> {
        Ok(ResultEnvelope::new(self.items.clone()))
    }
}

/// Text a keyword is matched against: the `title` field, or the item itself.
fn item_title(item: &Value) -> &str {
    match item {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("title").and_then(Value::as_str).unwrap_or(""),
        _ => "",
    }
}
