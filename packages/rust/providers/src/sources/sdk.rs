//! Proxy for providers running as SDK subprocesses.
//!
//! The child is launched as
//! `<bin> --port <port> --instance-id <id> [--<param> <value>]...`
//! and serves JSON over loopback HTTP:
//!
//! | Request                   | Body                          | Response         |
//! |---------------------------|-------------------------------|------------------|
//! | `POST /api/v1/activate`   | `{instance_id, params}`       | any JSON         |
//! | `POST /api/v1/search`     | `{sync, keyword, params}`     | `{data: [...]}`  |
//! | `POST /api/v1/schedule`   | `{sync, params}`              | `{data: [...]}`  |
//!
//! Its stdout/stderr carry diagnostics only and are drained by the supervisor.

use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use sourcehub_shared::{
    Capability, CapabilitySet, FieldKind, Params, ProviderSpec, Result, ResultEnvelope,
    SourceHubError, SpecField,
};

use super::{BuiltProvider, LaunchSpec, ProviderContext, ProviderFactory, SourceProvider};

const PROVIDER_TYPE: &str = "sdk_source_provider";

/// User-Agent string for requests to provider subprocesses.
const USER_AGENT: &str = concat!("SourceHub/", env!("CARGO_PKG_VERSION"));

/// Factory for [`SdkSource`] instances.
pub struct SdkSourceFactory;

impl ProviderFactory for SdkSourceFactory {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    fn spec(&self) -> Vec<ProviderSpec> {
        vec![ProviderSpec {
            provider_type: PROVIDER_TYPE.into(),
            display_name: "SDK subprocess".into(),
            description: "Runs a provider built against the SDK as a long-lived subprocess."
                .into(),
            capabilities: CapabilitySet::all(),
            fields: vec![
                SpecField {
                    name: "bin".into(),
                    kind: FieldKind::Path,
                    required: true,
                    default: None,
                    description: "Path to the provider executable (conf.bin).".into(),
                },
                SpecField {
                    name: "capabilities".into(),
                    kind: FieldKind::List,
                    required: false,
                    default: Some(json!(["search", "schedule", "activate"])),
                    description: "Operations the provider implements.".into(),
                },
                SpecField {
                    name: "instance_params".into(),
                    kind: FieldKind::List,
                    required: false,
                    default: Some(json!([])),
                    description: "Passed to the executable as `--<name> <value>`.".into(),
                },
            ],
        }]
    }

    fn build(&self, ctx: &ProviderContext<'_>) -> Result<BuiltProvider> {
        let bin = ctx
            .conf
            .bin
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| {
                SourceHubError::config(format!(
                    "instance {}: {PROVIDER_TYPE} requires conf.bin",
                    ctx.instance_id
                ))
            })?;

        let port = reserve_loopback_port().map_err(|e| {
            SourceHubError::subprocess(ctx.instance_name, format!("no free loopback port: {e}"))
        })?;
        let base_url = Url::parse(&format!("http://{}:{port}/", Ipv4Addr::LOCALHOST))
            .map_err(|e| SourceHubError::config(format!("invalid provider url: {e}")))?;

        let source = SdkSource::new(ctx.instance_id, ctx.instance_name, base_url, ctx.call_timeout)?;

        Ok(BuiltProvider {
            provider: Arc::new(source),
            capabilities: ctx.capabilities_or(CapabilitySet::all()),
            launch: Some(LaunchSpec {
                program: PathBuf::from(bin),
                args: launch_args(port, ctx.instance_id, ctx.params),
            }),
        })
    }
}

/// Command-line arguments for an SDK provider child.
pub fn launch_args(port: u16, instance_id: &str, params: &Params) -> Vec<String> {
    let mut args = vec![
        "--port".to_string(),
        port.to_string(),
        "--instance-id".to_string(),
        instance_id.to_string(),
    ];
    for (name, value) in params {
        args.push(format!("--{name}"));
        args.push(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    args
}

/// Ask the OS for a free loopback port.
///
/// The listener is dropped before the child binds the port, so another
/// process could take it in between; the child then fails to start and the
/// supervisor reports it dead.
pub fn reserve_loopback_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

/// HTTP proxy to one SDK provider subprocess.
#[derive(Debug, Clone)]
pub struct SdkSource {
    instance_id: String,
    instance_name: String,
    base_url: Url,
    client: Client,
}

impl SdkSource {
    /// Create a proxy talking to `base_url`.
    pub fn new(
        instance_id: impl Into<String>,
        instance_name: impl Into<String>,
        base_url: Url,
        call_timeout: Duration,
    ) -> Result<Self> {
        let instance_name = instance_name.into();
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(call_timeout)
            .no_proxy()
            .build()
            .map_err(|e| {
                SourceHubError::subprocess(&instance_name, format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            instance_id: instance_id.into(),
            instance_name,
            base_url,
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// POST a JSON body to `/api/v1/<operation>` and decode the response.
    async fn call<T: DeserializeOwned>(&self, operation: Capability, body: Value) -> Result<T> {
        let op = operation.as_str();
        let url = self
            .base_url
            .join(&format!("api/v1/{op}"))
            .map_err(|e| SourceHubError::provider(&self.instance_name, op, e.to_string()))?;

        debug!(instance = %self.instance_name, %url, "calling provider subprocess");

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SourceHubError::provider(&self.instance_name, op, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            return Err(SourceHubError::provider(
                &self.instance_name,
                op,
                format!("HTTP {status}: {detail}"),
            ));
        }

        response.json::<T>().await.map_err(|e| {
            SourceHubError::provider(&self.instance_name, op, format!("invalid response: {e}"))
        })
    }
}

#[async_trait]
impl SourceProvider for SdkSource {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    async fn activate(&self, params: &Params) -> Result<Value> {
        let body = json!({
            "instance_id": self.instance_id,
            "params": params,
        });
        self.call(Capability::Activate, body).await
    }

    async fn search(
        &self,
        synchronous: bool,
        keyword: &str,
        params: &Params,
    ) -> Result<ResultEnvelope> {
        let body = json!({
            "sync": synchronous,
            "keyword": keyword,
            "params": params,
        });
        self.call(Capability::Search, body).await
    }

    async fn schedule(&self, synchronous: bool, params: &Params) -> Result<ResultEnvelope> {
        let body = json!({
            "sync": synchronous,
            "params": params,
        });
        self.call(Capability::Schedule, body).await
    }
}
