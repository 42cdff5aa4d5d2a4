//! Builds an [`InstanceTable`] from raw instance records.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use sourcehub_providers::{ProviderContext, ProviderRegistry};
use sourcehub_shared::{InstanceConfig, Result, SourceHubError};

use crate::instance::{Instance, InstanceTable};
use crate::supervisor::Supervisor;

/// Outcome of one reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    /// Ids of instances in the new table, in id order.
    pub loaded: Vec<String>,
    /// Ids of records skipped because they are not enabled.
    pub disabled: Vec<String>,
    /// `(id, message)` for every enabled record that failed to load.
    pub errors: Vec<(String, String)>,
}

impl ReloadReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Turns instance records into live instances.
pub struct InstanceLoader<'a> {
    registry: &'a ProviderRegistry,
    supervisor: &'a Supervisor,
    call_timeout: Duration,
}

impl<'a> InstanceLoader<'a> {
    pub fn new(
        registry: &'a ProviderRegistry,
        supervisor: &'a Supervisor,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            supervisor,
            call_timeout,
        }
    }

    /// Build a fresh table. Failing records are reported, never fatal.
    ///
    /// Subprocess-backed instances are spawned here, so this must run inside
    /// a Tokio runtime.
    #[instrument(skip_all, fields(records = records.len()))]
    pub fn load(&self, records: &[Value]) -> (InstanceTable, ReloadReport) {
        let mut table = InstanceTable::new();
        let mut report = ReloadReport::default();

        for (idx, record) in records.iter().enumerate() {
            let label = record_label(idx, record);

            if !is_enabled(record) {
                debug!(instance = %label, "skipping disabled instance");
                report.disabled.push(label);
                continue;
            }

            let outcome = serde_json::from_value::<InstanceConfig>(record.clone())
                .map_err(|e| SourceHubError::config(format!("malformed instance record: {e}")))
                .and_then(|config| {
                    if table.contains(&config.id) {
                        return Err(SourceHubError::config(format!(
                            "duplicate instance id `{}`",
                            config.id
                        )));
                    }
                    self.build(&config)
                });

            match outcome {
                Ok(instance) => {
                    info!(
                        instance = %instance.name(),
                        provider_type = %instance.provider_type(),
                        capabilities = %instance.capabilities(),
                        "instance loaded"
                    );
                    // Duplicates were rejected above.
                    let _ = table.insert(instance);
                }
                Err(e) => {
                    warn!(instance = %label, error = %e, "instance failed to load");
                    report.errors.push((label, e.to_string()));
                }
            }
        }

        report.loaded = table.ids().map(str::to_string).collect();
        (table, report)
    }

    fn build(&self, config: &InstanceConfig) -> Result<Instance> {
        let factory = self.registry.get(&config.provider_type).ok_or_else(|| {
            SourceHubError::config(format!(
                "unknown provider type `{}`",
                config.provider_type
            ))
        })?;

        let params = config.resolved_params();
        let ctx = ProviderContext {
            instance_id: &config.id,
            instance_name: config.display_name(),
            conf: &config.conf,
            params: &params,
            call_timeout: self.call_timeout,
        };
        let built = factory.build(&ctx)?;

        let process = match &built.launch {
            Some(launch) => Some(self.supervisor.launch(
                &config.id,
                config.display_name(),
                launch,
            )?),
            None => None,
        };

        Ok(Instance::new(
            config.id.clone(),
            config.display_name(),
            config.provider_type.clone(),
            built.capabilities,
            built.provider,
            process,
        ))
    }
}

/// `enable` (or `enabled`) must be literally `true`.
fn is_enabled(record: &Value) -> bool {
    ["enable", "enabled"]
        .iter()
        .any(|key| record.get(key).and_then(Value::as_bool) == Some(true))
}

/// The record's id, or its position when it has none.
fn record_label(idx: usize, record: &Value) -> String {
    record
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("<record #{idx}>"))
}
