//! Tool registry and dispatcher
//!
//! Holds the tool descriptors for a run and executes tool calls with schema
//! validation, per-call timeouts, cooperative cancellation, and bounded
//! parallel fan-out. The dispatcher never retries; retry is a tool-internal
//! concern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::agent::types::ToolCallRequest;
use crate::error::{Error, Result, ToolError};

use super::descriptor::{Tool, ToolContext, ToolDescriptor};

/// Result of one tool call, aligned with its originating request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// ID of the originating tool call
    pub call_id: String,
    /// Tool name
    pub tool: String,
    /// Tool return value on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Tagged error on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    /// Wall-clock duration of the call
    pub duration_ms: u64,
}

impl Observation {
    /// Successful observation
    pub fn ok(call: &ToolCallRequest, value: Value, duration: Duration) -> Self {
        Observation {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            value: Some(value),
            error: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Failed observation
    pub fn err(call: &ToolCallRequest, error: ToolError, duration: Duration) -> Self {
        Observation {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            value: None,
            error: Some(error),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Whether the call failed
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The text echoed back to the model as the tool-call result
    pub fn as_model_text(&self) -> String {
        match (&self.value, &self.error) {
            (Some(v), _) => match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            (None, Some(e)) => format!("Error: {}", e),
            (None, None) => String::new(),
        }
    }
}

/// Registry of the tools available to an agent
///
/// Shared read-only by concurrent runs; `seal()` is called when the first
/// run starts, after which registration is rejected.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    sealed: AtomicBool,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        ToolRegistry {
            tools: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register a tool. Replacing an existing name is allowed until the
    /// registry is sealed by the first run.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::InvalidInput(
                "tool registry is sealed; a run has already started".to_string(),
            ));
        }
        let name = tool.descriptor().name;
        let mut tools = self.tools.write().expect("registry lock poisoned");
        if tools.insert(name.clone(), tool).is_some() {
            debug!("Replaced tool registration: {}", name);
        }
        Ok(())
    }

    /// Make the registry read-only. Idempotent.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Look up a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Whether a tool is registered
    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    /// All registered descriptors, sorted by name
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|t| t.descriptor())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// JSON function schemas for every registered tool
    pub fn function_schemas(&self) -> Value {
        Value::Array(
            self.descriptors()
                .iter()
                .map(|d| d.to_function_schema())
                .collect(),
        )
    }

    /// Number of registered tools
    pub fn count(&self) -> usize {
        self.tools.read().expect("registry lock poisoned").len()
    }

    /// Execute a single tool call
    ///
    /// Validates arguments against the tool's schema, then runs the tool
    /// under the context's timeout and cancellation token. All failure modes
    /// come back as a tagged `ToolError`, never a panic or a retry.
    pub async fn invoke(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Observation {
        let start = Instant::now();

        let tool = match self.get(&call.name) {
            Some(t) => t,
            None => {
                return Observation::err(call, ToolError::not_found(&call.name), start.elapsed());
            }
        };

        let args = match tool.descriptor().validate_args(&call.arguments) {
            Ok(args) => args,
            Err(e) => return Observation::err(call, e, start.elapsed()),
        };

        debug!("Invoking tool: {} (call {})", call.name, call.id);

        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ToolError::canceled(&call.name)),
            res = tokio::time::timeout(ctx.timeout, tool.invoke(args, ctx)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(ToolError::timeout(&call.name, ctx.timeout)),
            },
        };

        let duration = start.elapsed();
        match outcome {
            Ok(value) => Observation::ok(call, value, duration),
            Err(e) => {
                warn!("Tool {} failed: {}", call.name, e);
                Observation::err(call, e, duration)
            }
        }
    }

    /// Execute several tool calls with bounded parallelism
    ///
    /// Runs up to `max_parallel` calls concurrently. The returned vector
    /// preserves the input order regardless of completion order; a failing
    /// call records its error in its own slot without aborting siblings.
    /// Cancelling the context cancels all pending calls.
    pub async fn invoke_many(
        self: &Arc<Self>,
        calls: &[ToolCallRequest],
        ctx: &ToolContext,
        max_parallel: usize,
    ) -> Vec<Observation> {
        if calls.is_empty() {
            return Vec::new();
        }
        if calls.len() == 1 {
            return vec![self.invoke(&calls[0], ctx).await];
        }

        let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
        let mut join_set: JoinSet<(usize, Observation)> = JoinSet::new();

        for (index, call) in calls.iter().enumerate() {
            let registry = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let ctx = ctx.child();
            let call = call.clone();
            join_set.spawn(async move {
                // Wait for a worker slot, but give up immediately on cancel
                // so queued calls do not outlive the run.
                let _permit = tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        let obs = Observation::err(
                            &call,
                            ToolError::canceled(&call.name),
                            Duration::ZERO,
                        );
                        return (index, obs);
                    }
                    permit = semaphore.acquire_owned() => permit.expect("semaphore closed"),
                };
                let observation = registry.invoke(&call, &ctx).await;
                (index, observation)
            });
        }

        let mut slots: Vec<Option<Observation>> = vec![None; calls.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, observation)) => slots[index] = Some(observation),
                Err(e) => warn!("Tool worker panicked: {}", e),
            }
        }

        // A panicked worker leaves its slot empty; surface that as a tool error.
        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    Observation::err(
                        &calls[i],
                        ToolError::failed("tool worker aborted"),
                        Duration::ZERO,
                    )
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("count", &self.count())
            .field("sealed", &self.sealed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::descriptor::{ParamSpec, ParamType};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Tool that sleeps then echoes its input, counting invocations.
    struct SleepEcho {
        delay: Duration,
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for SleepEcho {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("sleep_echo", "Sleep then echo")
                .with_input("value", ParamSpec::required(ParamType::String))
                .with_output("string")
        }

        async fn invoke(
            &self,
            args: serde_json::Map<String, Value>,
            _ctx: &ToolContext,
        ) -> std::result::Result<Value, ToolError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(args["value"].clone())
        }
    }

    fn registry_with_sleeper(delay: Duration) -> (Arc<ToolRegistry>, Arc<AtomicUsize>) {
        let registry = Arc::new(ToolRegistry::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        registry
            .register(Arc::new(SleepEcho {
                delay,
                invocations: Arc::clone(&invocations),
            }))
            .unwrap();
        (registry, invocations)
    }

    fn call(value: &str) -> ToolCallRequest {
        ToolCallRequest::new("sleep_echo", json!({"value": value}))
    }

    #[tokio::test]
    async fn invoke_unknown_tool_is_not_found() {
        let registry = Arc::new(ToolRegistry::new());
        let obs = registry
            .invoke(
                &ToolCallRequest::new("missing", json!({})),
                &ToolContext::default(),
            )
            .await;
        assert_eq!(obs.error.as_ref().unwrap().kind, crate::error::ToolErrorKind::NotFound);
    }

    #[tokio::test]
    async fn invoke_schema_error_never_runs_tool() {
        let (registry, invocations) = registry_with_sleeper(Duration::ZERO);
        let obs = registry
            .invoke(
                &ToolCallRequest::new("sleep_echo", json!({"value": 7})),
                &ToolContext::default(),
            )
            .await;
        assert_eq!(obs.error.as_ref().unwrap().kind, crate::error::ToolErrorKind::Schema);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invoke_times_out() {
        let (registry, _) = registry_with_sleeper(Duration::from_secs(5));
        let ctx = ToolContext::with_timeout(Duration::from_millis(20));
        let obs = registry.invoke(&call("x"), &ctx).await;
        assert_eq!(obs.error.as_ref().unwrap().kind, crate::error::ToolErrorKind::Timeout);
    }

    #[tokio::test]
    async fn invoke_many_runs_in_parallel_preserving_order() {
        let delay = Duration::from_millis(100);
        let (registry, invocations) = registry_with_sleeper(delay);
        let calls: Vec<ToolCallRequest> =
            (0..4).map(|i| call(&format!("v{}", i))).collect();

        let start = Instant::now();
        let observations = registry
            .invoke_many(&calls, &ToolContext::default(), 4)
            .await;
        let elapsed = start.elapsed();

        // All four ran concurrently: well under the 400ms serial time.
        assert!(elapsed < delay + delay / 2, "took {:?}", elapsed);
        assert_eq!(observations.len(), 4);
        for (i, obs) in observations.iter().enumerate() {
            assert_eq!(obs.call_id, calls[i].id);
            assert_eq!(obs.value.as_ref().unwrap(), &json!(format!("v{}", i)));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn invoke_many_partial_failure_keeps_siblings() {
        let (registry, _) = registry_with_sleeper(Duration::ZERO);
        let calls = vec![
            call("good"),
            ToolCallRequest::new("missing_tool", json!({})),
            call("also good"),
        ];
        let observations = registry
            .invoke_many(&calls, &ToolContext::default(), 4)
            .await;
        assert!(!observations[0].is_error());
        assert!(observations[1].is_error());
        assert!(!observations[2].is_error());
    }

    #[tokio::test]
    async fn invoke_many_cancellation_stops_pending() {
        let (registry, invocations) = registry_with_sleeper(Duration::from_secs(10));
        let ctx = ToolContext::default();
        let calls: Vec<ToolCallRequest> = (0..3).map(|i| call(&format!("{}", i))).collect();

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        let observations = registry.invoke_many(&calls, &ctx, 2).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(observations.iter().all(|o| o.is_error()));
        for obs in &observations {
            assert_eq!(obs.error.as_ref().unwrap().kind, crate::error::ToolErrorKind::Canceled);
        }
        // Only the two admitted workers ever started.
        assert!(invocations.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn sealed_registry_rejects_registration() {
        let (registry, _) = registry_with_sleeper(Duration::ZERO);
        registry.seal();
        let err = registry
            .register(Arc::new(SleepEcho {
                delay: Duration::ZERO,
                invocations: Arc::new(AtomicUsize::new(0)),
            }))
            .unwrap_err();
        assert!(err.to_string().contains("sealed"));
    }

    #[test]
    fn observation_model_text() {
        let call = ToolCallRequest::new("t", json!({}));
        let ok = Observation::ok(&call, json!("plain"), Duration::ZERO);
        assert_eq!(ok.as_model_text(), "plain");
        let structured = Observation::ok(&call, json!({"a": 1}), Duration::ZERO);
        assert_eq!(structured.as_model_text(), r#"{"a":1}"#);
        let err = Observation::err(&call, ToolError::failed("boom"), Duration::ZERO);
        assert!(err.as_model_text().starts_with("Error:"));
    }
}
