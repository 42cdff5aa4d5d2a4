//! The [`SourceManager`]: reloads instances and fans calls out to them.
//!
//! Every operation loads the instance table once and works on that snapshot,
//! so a concurrent reload never changes the set of instances mid-call.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use sourcehub_providers::ProviderRegistry;
use sourcehub_shared::{AppConfig, Capability, Params, ProviderSpec, Result, SourceHubError};

use crate::instance::{Instance, InstanceStatus, InstanceTable};
use crate::loader::{InstanceLoader, ReloadReport};
use crate::store::InstanceConfigStore;
use crate::supervisor::Supervisor;

/// Fan-out operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Search,
    Schedule,
}

impl Operation {
    pub fn capability(self) -> Capability {
        match self {
            Self::Search => Capability::Search,
            Self::Schedule => Capability::Schedule,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.capability().as_str()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merged results of one fan-out plus what went wrong.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub items: Vec<Value>,
    /// Instances selected for the call.
    pub attempted: usize,
    pub succeeded: usize,
    /// `(instance id, message)` per failed instance, in id order.
    pub failures: Vec<(String, String)>,
}

impl DispatchReport {
    /// At least one instance was called and none succeeded.
    pub fn is_total_failure(&self) -> bool {
        self.attempted > 0 && self.succeeded == 0
    }
}

/// Owns the live instance table and the subprocess supervisor.
pub struct SourceManager {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn InstanceConfigStore>,
    supervisor: Supervisor,
    table: ArcSwap<InstanceTable>,
    reload_lock: Mutex<()>,
    call_timeout: Duration,
}

impl SourceManager {
    /// Create a manager with an empty table. Call [`reload`](Self::reload) to load instances.
    pub fn new(
        registry: ProviderRegistry,
        store: Arc<dyn InstanceConfigStore>,
        supervisor: Supervisor,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            supervisor,
            table: ArcSwap::from_pointee(InstanceTable::new()),
            reload_lock: Mutex::new(()),
            call_timeout,
        }
    }

    /// Create a manager from app config, with built-in providers and the
    /// tracing log sink. Returns the sink task handle alongside.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn InstanceConfigStore>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (supervisor, sink) = Supervisor::with_tracing_sink(config.supervisor.clone());
        let manager = Self::new(
            ProviderRegistry::new(),
            store,
            supervisor,
            config.dispatch.call_timeout(),
        );
        (manager, sink)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Current instance table.
    pub fn snapshot(&self) -> Arc<InstanceTable> {
        self.table.load_full()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Rebuild the instance table from the store and swap it in.
    ///
    /// Reloads are serialized. Instances of the previous table are retired
    /// after the swap, so readers always see a complete table. The table never
    /// holds two instances for one id, but until the retire finishes the old
    /// and new child processes for an id briefly run side by side. Fails only
    /// when the store itself cannot be read; the previous table then stays live.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<ReloadReport> {
        let _guard = self.reload_lock.lock().await;

        let records = self.store.instance_confs()?;
        let (table, report) =
            InstanceLoader::new(&self.registry, &self.supervisor, self.call_timeout)
                .load(&records);

        let previous = self.table.swap(Arc::new(table));
        self.supervisor.retire(previous.iter().cloned()).await;

        info!(
            loaded = report.loaded.len(),
            disabled = report.disabled.len(),
            errors = report.errors.len(),
            "instance table reloaded"
        );
        Ok(report)
    }

    /// Retire every instance and leave the table empty.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _guard = self.reload_lock.lock().await;
        let previous = self.table.swap(Arc::new(InstanceTable::new()));
        let count = previous.len();
        self.supervisor.retire(previous.iter().cloned()).await;
        info!(instances = count, "source manager shut down");
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The provider spec catalog.
    pub fn get_specs(&self) -> Vec<ProviderSpec> {
        self.registry.specs()
    }

    /// Status of every live instance, in id order.
    pub fn instances(&self) -> Vec<InstanceStatus> {
        self.snapshot().iter().map(|i| i.status()).collect()
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    /// Run `activate` on instance `pid`. `Ok(None)` when no such instance is live.
    pub async fn activate(&self, pid: &str, params: &Params) -> Result<Option<Value>> {
        let table = self.snapshot();
        self.supervisor
            .activate(&table, pid, params, self.call_timeout)
            .await
    }

    /// Alias of [`activate`](Self::activate).
    pub async fn active(&self, pid: &str, params: &Params) -> Result<Option<Value>> {
        self.activate(pid, params).await
    }

    /// Run `activate` on every available instance that advertises it, concurrently.
    ///
    /// Returns one `(id, outcome)` per instance, in id order. The whole call is
    /// bounded by one `call_timeout`, however many instances hang.
    pub async fn activate_all(&self, params: &Params) -> Vec<(String, Result<Value>)> {
        let table = self.snapshot();
        let selected: Vec<Arc<Instance>> = table
            .iter()
            .filter(|i| i.capabilities().contains(Capability::Activate) && i.is_available())
            .cloned()
            .collect();
        let params = Arc::new(params.clone());

        let mut calls = JoinSet::new();
        for (idx, instance) in selected.iter().enumerate() {
            let supervisor = self.supervisor.clone();
            let table = Arc::clone(&table);
            let params = Arc::clone(&params);
            let id = instance.id().to_string();
            let limit = self.call_timeout;
            calls.spawn(async move {
                let outcome = supervisor.activate(&table, &id, &params, limit).await;
                (idx, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<Option<Value>>>> =
            (0..selected.len()).map(|_| None).collect();
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(e) => error!(error = %e, "activate task failed"),
            }
        }

        selected
            .iter()
            .zip(outcomes)
            .map(|(instance, outcome)| {
                let outcome = outcome
                    .unwrap_or_else(|| {
                        Err(SourceHubError::provider(
                            instance.name(),
                            "activate",
                            "call task panicked",
                        ))
                    })
                    .and_then(|v| {
                        v.ok_or_else(|| SourceHubError::UnknownInstance(instance.id().to_string()))
                    });
                if let Err(e) = &outcome {
                    error!(instance = %instance.name(), operation = "activate", error = %e, "provider call failed");
                }
                (instance.id().to_string(), outcome)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Search every search-capable instance and merge the results.
    pub async fn search(&self, keyword: &str, synchronous: bool, params: Params) -> Vec<Value> {
        let mut params = params;
        params.insert(KEYWORD_PARAM.into(), Value::String(keyword.to_string()));
        self.dispatch(Operation::Search, synchronous, params).await.items
    }

    /// Run `schedule` on every schedule-capable instance and merge the results.
    pub async fn schedule(&self, synchronous: bool, params: Params) -> Vec<Value> {
        self.dispatch(Operation::Schedule, synchronous, params)
            .await
            .items
    }

    /// Call `operation` on every available instance advertising it, concurrently.
    ///
    /// Items are merged in instance id order, each instance's own order kept.
    /// Failures and timeouts are logged and reported, never propagated. For
    /// `search`, the keyword is taken out of the `keyword` parameter; every
    /// other operation receives `params` untouched. Dropping the returned
    /// future aborts every outstanding call.
    #[instrument(skip_all, fields(operation = %operation, synchronous = synchronous))]
    pub async fn dispatch(
        &self,
        operation: Operation,
        synchronous: bool,
        mut params: Params,
    ) -> DispatchReport {
        let table = self.snapshot();
        let capability = operation.capability();

        let keyword: Arc<str> = match operation {
            Operation::Search => match params.remove(KEYWORD_PARAM) {
                Some(Value::String(s)) => Arc::from(s),
                Some(Value::Null) | None => Arc::from(""),
                Some(other) => Arc::from(other.to_string()),
            },
            Operation::Schedule => Arc::from(""),
        };
        let params = Arc::new(params);

        let selected: Vec<Arc<Instance>> = table
            .iter()
            .filter(|i| i.capabilities().contains(capability))
            .filter(|i| {
                let available = i.is_available();
                if !available {
                    debug!(instance = %i.name(), "skipping unavailable instance");
                }
                available
            })
            .cloned()
            .collect();

        let mut calls = JoinSet::new();
        for (idx, instance) in selected.iter().enumerate() {
            let instance = Arc::clone(instance);
            let params = Arc::clone(&params);
            let keyword = Arc::clone(&keyword);
            let limit = self.call_timeout;
            calls.spawn(async move {
                let outcome =
                    invoke(&instance, operation, synchronous, &keyword, &params, limit).await;
                (idx, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<Vec<Value>>>> =
            (0..selected.len()).map(|_| None).collect();
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(e) => error!(error = %e, "provider call task failed"),
            }
        }

        let mut report = DispatchReport {
            attempted: selected.len(),
            ..DispatchReport::default()
        };
        for (instance, outcome) in selected.iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|| {
                Err(SourceHubError::provider(
                    instance.name(),
                    operation.as_str(),
                    "call task panicked",
                ))
            });
            match outcome {
                Ok(items) => {
                    report.succeeded += 1;
                    report.items.extend(items);
                }
                Err(e) => {
                    error!(
                        instance = %instance.name(),
                        operation = %operation,
                        error = %e,
                        "provider call failed"
                    );
                    report.failures.push((instance.id().to_string(), e.to_string()));
                }
            }
        }

        debug!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            items = report.items.len(),
            "dispatch complete"
        );
        report
    }
}

impl std::fmt::Debug for SourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceManager")
            .field("registry", &self.registry)
            .field("instances", &self.snapshot().len())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

const KEYWORD_PARAM: &str = "keyword";

/// One bounded call against one instance.
async fn invoke(
    instance: &Instance,
    operation: Operation,
    synchronous: bool,
    keyword: &str,
    params: &Params,
    limit: Duration,
) -> Result<Vec<Value>> {
    let provider = instance.provider();
    let call = async {
        match operation {
            Operation::Search => provider.search(synchronous, keyword, params).await,
            Operation::Schedule => provider.schedule(synchronous, params).await,
        }
    };
    let envelope = tokio::time::timeout(limit, call)
        .await
        .map_err(|_| SourceHubError::Timeout {
            instance: instance.name().to_string(),
            operation: operation.as_str().into(),
            after: limit,
        })??;
    Ok(envelope.into_items())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConfigStore;
    use async_trait::async_trait;
    use serde_json::json;
    use sourcehub_providers::{BuiltProvider, ProviderContext, ProviderFactory, SourceProvider};
    use sourcehub_shared::{CapabilitySet, ResultEnvelope, SupervisorConfig};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    /// Records every call as `id:operation`.
    type CallLog = Arc<StdMutex<Vec<String>>>;

    /// Test provider driven by instance params: `data`, `fail`, `delay_ms`,
    /// `panic`, and `echo` (append the received params as an item).
    struct MockSource {
        id: String,
        data: Vec<Value>,
        fail: bool,
        panic: bool,
        echo: bool,
        delay: Duration,
        calls: CallLog,
    }

    impl MockSource {
        async fn respond(&self, op: &str) -> Result<ResultEnvelope> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{op}", self.id));
            tokio::time::sleep(self.delay).await;
            if self.panic {
                panic!("provider bug");
            }
            if self.fail {
                return Err(SourceHubError::provider(&self.id, op, "boom"));
            }
            Ok(ResultEnvelope::new(self.data.clone()))
        }
    }

    #[async_trait]
    impl SourceProvider for MockSource {
        fn provider_type(&self) -> &str {
            "mock_source_provider"
        }

        async fn activate(&self, params: &Params) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:activate", self.id));
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(SourceHubError::provider(&self.id, "activate", "boom"));
            }
            Ok(json!({"id": self.id, "params": params}))
        }

        async fn search(&self, _sync: bool, keyword: &str, _params: &Params) -> Result<ResultEnvelope> {
            let mut env = self.respond("search").await?;
            if !keyword.is_empty() {
                if let Some(items) = env.data.as_mut() {
                    items.push(json!({"keyword": keyword}));
                }
            }
            Ok(env)
        }

        async fn schedule(&self, _sync: bool, params: &Params) -> Result<ResultEnvelope> {
            let mut env = self.respond("schedule").await?;
            if self.echo {
                if let Some(items) = env.data.as_mut() {
                    items.push(json!({"params": params}));
                }
            }
            Ok(env)
        }
    }

    struct MockFactory {
        calls: CallLog,
    }

    impl ProviderFactory for MockFactory {
        fn provider_type(&self) -> &str {
            "mock_source_provider"
        }

        fn spec(&self) -> Vec<ProviderSpec> {
            Vec::new()
        }

        fn build(&self, ctx: &ProviderContext<'_>) -> Result<BuiltProvider> {
            let data = match ctx.params.get("data") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            let flag = |name: &str| ctx.params.get(name).and_then(Value::as_bool).unwrap_or(false);
            let delay = ctx.params.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
            Ok(BuiltProvider {
                provider: Arc::new(MockSource {
                    id: ctx.instance_id.to_string(),
                    data,
                    fail: flag("fail"),
                    panic: flag("panic"),
                    echo: flag("echo"),
                    delay: Duration::from_millis(delay),
                    calls: Arc::clone(&self.calls),
                }),
                capabilities: ctx.capabilities_or(CapabilitySet::all()),
                launch: None,
            })
        }
    }

    fn mock(id: &str, caps: &[&str], params: Value) -> Value {
        let instance_params: Vec<Value> = params
            .as_object()
            .map(|m| m.iter().map(|(k, v)| json!({"name": k, "value": v})).collect())
            .unwrap_or_default();
        json!({
            "id": id,
            "enable": true,
            "provider_type": "mock_source_provider",
            "conf": {"capabilities": caps, "instance_params": instance_params}
        })
    }

    fn manager(records: Vec<Value>, timeout: Duration) -> (SourceManager, CallLog, Arc<MemoryConfigStore>) {
        let calls: CallLog = Arc::default();
        let registry = ProviderRegistry::new().with(MockFactory {
            calls: Arc::clone(&calls),
        });
        let store = Arc::new(MemoryConfigStore::new(records));
        let (tx, _rx) = mpsc::channel(16);
        let supervisor = Supervisor::new(SupervisorConfig::default(), tx);
        let manager = SourceManager::new(registry, store.clone(), supervisor, timeout);
        (manager, calls, store)
    }

    fn recorded(calls: &CallLog) -> Vec<String> {
        let mut calls = calls.lock().unwrap().clone();
        calls.sort();
        calls
    }

    #[tokio::test]
    async fn search_merges_in_id_order() {
        let (manager, calls, _) = manager(
            vec![
                mock("b", &["search", "schedule"], json!({"data": ["b1"]})),
                mock("a", &["search"], json!({"data": ["a1", "a2"]})),
            ],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();

        let items = manager.search("", true, Params::new()).await;
        assert_eq!(items, vec![json!("a1"), json!("a2"), json!("b1")]);
        assert_eq!(recorded(&calls), vec!["a:search", "b:search"]);
    }

    #[tokio::test]
    async fn keyword_reaches_provider_not_params() {
        let (manager, _, _) = manager(
            vec![mock("a", &["search"], json!({"data": []}))],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();

        let items = manager.search("frieren", false, Params::new()).await;
        assert_eq!(items, vec![json!({"keyword": "frieren"})]);
    }

    #[tokio::test]
    async fn schedule_only_reaches_schedule_capable_instances() {
        let (manager, calls, _) = manager(
            vec![
                mock("a", &["search"], json!({"data": ["a1"]})),
                mock("b", &["search", "schedule"], json!({"data": ["b1"]})),
            ],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();

        let items = manager.schedule(false, Params::new()).await;
        assert_eq!(items, vec![json!("b1")]);
        assert_eq!(recorded(&calls), vec!["b:schedule"]);
    }

    #[tokio::test]
    async fn schedule_passes_keyword_param_through() {
        let (manager, _, _) = manager(
            vec![mock("a", &["schedule"], json!({"echo": true}))],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();

        let mut params = Params::new();
        params.insert("keyword".into(), json!("frieren"));
        params.insert("page".into(), json!(2));
        let items = manager.schedule(true, params).await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["params"]["keyword"], json!("frieren"));
        assert_eq!(items[0]["params"]["page"], json!(2));
    }

    #[tokio::test]
    async fn failing_instance_does_not_affect_others() {
        let (manager, _, _) = manager(
            vec![
                mock("a", &["search"], json!({"fail": true})),
                mock("b", &["search"], json!({"data": ["b1"]})),
            ],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();

        let report = manager.dispatch(Operation::Search, true, Params::new()).await;
        assert_eq!(report.items, vec![json!("b1")]);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "a");
        assert!(!report.is_total_failure());
    }

    #[tokio::test]
    async fn panicking_instance_counts_as_failure() {
        let (manager, _, _) = manager(
            vec![
                mock("a", &["schedule"], json!({"panic": true})),
                mock("b", &["schedule"], json!({"data": ["b1"]})),
            ],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();

        let report = manager.dispatch(Operation::Schedule, true, Params::new()).await;
        assert_eq!(report.items, vec![json!("b1")]);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].1.contains("panicked"));
    }

    #[tokio::test]
    async fn slow_instance_times_out_without_blocking_others() {
        let (manager, _, _) = manager(
            vec![
                mock("a", &["search"], json!({"delay_ms": 5_000, "data": ["late"]})),
                mock("b", &["search"], json!({"data": ["b1"]})),
            ],
            Duration::from_millis(100),
        );
        manager.reload().await.unwrap();

        let started = std::time::Instant::now();
        let report = manager.dispatch(Operation::Search, true, Params::new()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.items, vec![json!("b1")]);
        assert!(report.failures[0].1.contains("timed out"));
    }

    #[tokio::test]
    async fn all_failing_yields_empty_result() {
        let (manager, _, _) = manager(
            vec![mock("a", &["search"], json!({"fail": true}))],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();

        let report = manager.dispatch(Operation::Search, true, Params::new()).await;
        assert!(report.items.is_empty());
        assert!(report.is_total_failure());
        assert!(manager.search("x", true, Params::new()).await.is_empty());
    }

    #[tokio::test]
    async fn empty_table_dispatch_is_empty() {
        let (manager, _, _) = manager(Vec::new(), Duration::from_secs(5));
        let report = manager.dispatch(Operation::Schedule, true, Params::new()).await;
        assert_eq!(report.attempted, 0);
        assert!(!report.is_total_failure());
    }

    #[tokio::test]
    async fn activate_unknown_id_is_none() {
        let (manager, _, _) = manager(
            vec![mock("a", &["activate"], json!({}))],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();

        assert!(manager.active("missing", &Params::new()).await.unwrap().is_none());
        let mut params = Params::new();
        params.insert("token".into(), json!("t"));
        let value = manager.activate("a", &params).await.unwrap().unwrap();
        assert_eq!(value["params"]["token"], "t");
    }

    #[tokio::test]
    async fn activate_without_capability_is_error() {
        let (manager, _, _) = manager(
            vec![mock("a", &["search"], json!({}))],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();
        let err = manager.activate("a", &Params::new()).await.unwrap_err();
        assert!(matches!(err, SourceHubError::Provider { .. }));
    }

    #[tokio::test]
    async fn activate_all_reports_each_instance() {
        let (manager, calls, _) = manager(
            vec![
                mock("a", &["activate"], json!({})),
                mock("b", &["activate"], json!({"fail": true})),
                mock("c", &["search"], json!({})),
            ],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();

        let outcomes = manager.activate_all(&Params::new()).await;
        let ids: Vec<&str> = outcomes.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(outcomes[0].1.is_ok());
        assert!(outcomes[1].1.is_err());
        assert_eq!(recorded(&calls), vec!["a:activate", "b:activate"]);
    }

    #[tokio::test]
    async fn activate_all_runs_hung_instances_concurrently() {
        let (manager, _, _) = manager(
            vec![
                mock("a", &["activate"], json!({"delay_ms": 5_000})),
                mock("b", &["activate"], json!({"delay_ms": 5_000})),
                mock("c", &["activate"], json!({"delay_ms": 5_000})),
                mock("d", &["activate"], json!({})),
            ],
            Duration::from_millis(300),
        );
        manager.reload().await.unwrap();

        let started = std::time::Instant::now();
        let outcomes = manager.activate_all(&Params::new()).await;
        assert!(started.elapsed() < Duration::from_millis(850));

        let ids: Vec<&str> = outcomes.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        for (_, outcome) in &outcomes[..3] {
            assert!(matches!(outcome, Err(SourceHubError::Timeout { .. })));
        }
        assert!(outcomes[3].1.is_ok());
    }

    #[tokio::test]
    async fn reload_is_idempotent_and_tracks_store_changes() {
        let (manager, _, store) = manager(
            vec![
                mock("a", &["search"], json!({})),
                mock("b", &["search"], json!({})),
            ],
            Duration::from_secs(5),
        );
        let first = manager.reload().await.unwrap();
        let second = manager.reload().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.snapshot().len(), 2);

        store
            .replace(vec![
                mock("b", &["search"], json!({})),
                json!({"id": "c", "enable": false, "conf": {}}),
            ])
            .unwrap();
        let report = manager.reload().await.unwrap();
        assert_eq!(report.loaded, vec!["b"]);
        assert_eq!(report.disabled, vec!["c"]);
        let ids: Vec<String> = manager.instances().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn reload_keeps_ids_and_capability_sets_stable() {
        let (manager, _, _) = manager(
            vec![
                mock("a", &["search"], json!({})),
                mock("b", &["search", "schedule"], json!({})),
                mock("c", &["activate"], json!({})),
                json!({
                    "id": "d",
                    "enable": true,
                    "provider_type": "mock_source_provider",
                    "conf": {}
                }),
            ],
            Duration::from_secs(5),
        );

        let shape = |manager: &SourceManager| -> Vec<(String, CapabilitySet)> {
            manager
                .instances()
                .into_iter()
                .map(|s| (s.id, s.capabilities))
                .collect()
        };

        manager.reload().await.unwrap();
        let first = shape(&manager);
        manager.reload().await.unwrap();
        let second = shape(&manager);

        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                ("a".to_string(), CapabilitySet::empty().with(Capability::Search)),
                (
                    "b".to_string(),
                    CapabilitySet::empty()
                        .with(Capability::Search)
                        .with(Capability::Schedule)
                ),
                ("c".to_string(), CapabilitySet::empty().with(Capability::Activate)),
                ("d".to_string(), CapabilitySet::all()),
            ]
        );
    }

    #[tokio::test]
    async fn snapshot_survives_concurrent_reload() {
        let (manager, _, store) = manager(
            vec![mock("a", &["search"], json!({}))],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();
        let before = manager.snapshot();

        store.replace(Vec::new()).unwrap();
        manager.reload().await.unwrap();

        assert!(before.get("a").is_some());
        assert!(manager.snapshot().is_empty());
    }

    #[tokio::test]
    async fn shutdown_empties_the_table() {
        let (manager, _, _) = manager(
            vec![mock("a", &["search"], json!({}))],
            Duration::from_secs(5),
        );
        manager.reload().await.unwrap();
        manager.shutdown().await;
        assert!(manager.instances().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_subprocess_instance_is_not_routed() {
        let (manager, _, _) = manager(
            vec![
                json!({
                    "id": "sdk",
                    "enable": true,
                    "instance_name": "Broken SDK",
                    "conf": {"bin": "/bin/sh", "capabilities": ["search"]}
                }),
                mock("b", &["search"], json!({"data": ["b1"]})),
            ],
            Duration::from_secs(5),
        );
        let report = manager.reload().await.unwrap();
        assert_eq!(report.loaded, vec!["b", "sdk"]);

        // `sh` rejects the `--port` flag and exits straight away.
        let process = manager
            .snapshot()
            .get("sdk")
            .and_then(|i| i.process().cloned())
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), process.wait_dead())
            .await
            .expect("exit observed");

        let report = manager.dispatch(Operation::Search, true, Params::new()).await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.items, vec![json!("b1")]);

        let status = manager
            .instances()
            .into_iter()
            .find(|s| s.id == "sdk")
            .unwrap();
        assert!(!status.available);
        assert_eq!(status.state, Some(crate::ProcessState::Dead));
        assert!(status.exited_at.is_some());
    }

    #[tokio::test]
    async fn catalog_includes_registered_types() {
        let (manager, _, _) = manager(Vec::new(), Duration::from_secs(5));
        let types: Vec<String> = manager
            .get_specs()
            .into_iter()
            .map(|s| s.provider_type)
            .collect();
        assert_eq!(types, vec!["static_source_provider", "sdk_source_provider"]);
    }
}
