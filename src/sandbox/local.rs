//! Local child-process sandbox backend
//!
//! Spawns a minimal Python runtime as a subprocess and speaks a
//! length-prefixed JSON-RPC protocol over stdio: `prepare`, `exec`, `close`
//! host→child, and `tool_call` child→host while a block is executing. Tool
//! shims inside the interpreter call back through the same pipe, so
//! model-written code invokes tools as ordinary callables.

use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::tools::{Tool, ToolContext};

use super::{ExecutionOutcome, SandboxBackend};

/// Python harness executed inside the child process
const PYTHON_HARNESS: &str = include_str!("harness.py");

struct Pipes {
    child: Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
}

/// Child-process backend with a persistent interpreter
pub struct LocalBackend {
    python_bin: String,
    pipes: Mutex<Option<Pipes>>,
    tools: Mutex<HashMap<String, Arc<dyn Tool>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl LocalBackend {
    /// Backend using `python3` from PATH
    pub fn new() -> Self {
        Self::with_python("python3")
    }

    /// Backend using a specific interpreter binary
    pub fn with_python(python_bin: impl Into<String>) -> Self {
        LocalBackend {
            python_bin: python_bin.into(),
            pipes: Mutex::new(None),
            tools: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    async fn spawn(&self) -> Result<Pipes, SandboxError> {
        debug!("Spawning sandbox interpreter: {}", self.python_bin);
        let mut child = Command::new(&self.python_bin)
            .arg("-u")
            .arg("-c")
            .arg(PYTHON_HARNESS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::backend(format!("failed to spawn {}: {}", self.python_bin, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::backend("failed to capture interpreter stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::backend("failed to capture interpreter stdout"))?;

        Ok(Pipes {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn write_frame(stdin: &mut tokio::process::ChildStdin, frame: &Value) -> Result<(), SandboxError> {
        let data = serde_json::to_vec(frame)
            .map_err(|e| SandboxError::protocol(format!("frame encode: {}", e)))?;
        let len = (data.len() as u32).to_be_bytes();
        stdin
            .write_all(&len)
            .await
            .map_err(|e| SandboxError::protocol(format!("frame write: {}", e)))?;
        stdin
            .write_all(&data)
            .await
            .map_err(|e| SandboxError::protocol(format!("frame write: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| SandboxError::protocol(format!("frame flush: {}", e)))?;
        Ok(())
    }

    async fn read_frame(
        stdout: &mut BufReader<tokio::process::ChildStdout>,
    ) -> Result<Value, SandboxError> {
        let mut header = [0u8; 4];
        stdout
            .read_exact(&mut header)
            .await
            .map_err(|e| SandboxError::protocol(format!("frame header read: {}", e)))?;
        let len = u32::from_be_bytes(header) as usize;
        let mut data = vec![0u8; len];
        stdout
            .read_exact(&mut data)
            .await
            .map_err(|e| SandboxError::protocol(format!("frame body read: {}", e)))?;
        serde_json::from_slice(&data)
            .map_err(|e| SandboxError::protocol(format!("frame decode: {}", e)))
    }

    /// Answer a child `tool_call` frame through the host tool handles
    async fn dispatch_tool_call(&self, frame: &Value, ctx: &ToolContext) -> Value {
        let id = frame.get("id").cloned().unwrap_or(Value::Null);
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        let tool = {
            let tools = self.tools.lock().await;
            tools.get(&name).cloned()
        };
        let Some(tool) = tool else {
            return serde_json::json!({"id": id, "error": format!("Unknown tool: {}", name)});
        };

        // Shims surface schema mismatches as catchable errors in the
        // executed code rather than aborting the block.
        let args = match tool.descriptor().validate_args(&arguments) {
            Ok(args) => args,
            Err(e) => {
                return serde_json::json!({"id": id, "error": e.to_string()});
            }
        };

        match tool.invoke(args, ctx).await {
            Ok(value) => serde_json::json!({"id": id, "result": value}),
            Err(e) => serde_json::json!({"id": id, "error": e.to_string()}),
        }
    }

    /// Send one `exec` request and read frames until its response arrives;
    /// interleaved `tool_call` frames are dispatched as they come
    async fn exchange(
        &self,
        pipes: &mut Pipes,
        code: &str,
        state: &serde_json::Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::json!({
            "id": id,
            "method": "exec",
            "params": {"code": code, "state": state},
        });
        Self::write_frame(&mut pipes.stdin, &frame).await?;

        loop {
            let frame = Self::read_frame(&mut pipes.stdout).await?;

            if frame.get("method").and_then(Value::as_str) == Some("tool_call") {
                let reply = self.dispatch_tool_call(&frame, ctx).await;
                Self::write_frame(&mut pipes.stdin, &reply).await?;
                continue;
            }

            if frame.get("id").and_then(Value::as_u64) == Some(id) {
                let result = frame
                    .get("result")
                    .cloned()
                    .ok_or_else(|| SandboxError::protocol("exec response without result"))?;
                return serde_json::from_value(result)
                    .map_err(|e| SandboxError::protocol(format!("exec result decode: {}", e)));
            }

            warn!("Ignoring unexpected sandbox frame: {}", frame);
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    async fn prepare(
        &self,
        namespace: HashMap<String, Arc<dyn Tool>>,
        authorized_imports: BTreeSet<String>,
    ) -> Result<(), SandboxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SandboxError::closed());
        }

        let tool_names: Vec<String> = namespace.keys().cloned().collect();
        *self.tools.lock().await = namespace;

        let mut guard = self.pipes.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn().await?);
        }
        let pipes = guard.as_mut().expect("interpreter just spawned");

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::json!({
            "id": id,
            "method": "prepare",
            "params": {
                "tools": tool_names,
                "authorized_imports": authorized_imports.iter().collect::<Vec<_>>(),
            },
        });
        Self::write_frame(&mut pipes.stdin, &frame).await?;
        let response = Self::read_frame(&mut pipes.stdout).await?;
        if let Some(error) = response.get("error").and_then(Value::as_str) {
            return Err(SandboxError::backend(format!("prepare failed: {}", error)));
        }
        Ok(())
    }

    async fn execute(
        &self,
        code: &str,
        state: &serde_json::Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ExecutionOutcome, SandboxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SandboxError::closed());
        }

        let mut guard = self.pipes.lock().await;
        if guard.is_none() {
            return Err(SandboxError::backend("prepare() has not been called"));
        }

        let exchanged = {
            let pipes = guard.as_mut().expect("interpreter checked above");
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(SandboxError::backend("execution canceled")),
                _ = tokio::time::sleep(ctx.timeout) => Err(SandboxError::backend(format!(
                    "execution timed out after {:?}", ctx.timeout
                ))),
                result = self.exchange(pipes, code, state, ctx) => result,
            }
        };

        // A canceled or timed-out exchange leaves the interpreter mid-block;
        // the process has to go.
        if exchanged.is_err() {
            if let Some(mut pipes) = guard.take() {
                if let Err(e) = pipes.child.start_kill() {
                    warn!("Failed to kill sandbox interpreter: {}", e);
                }
            }
        }
        exchanged
    }

    async fn close(&self) -> Result<(), SandboxError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut guard = self.pipes.lock().await;
        if let Some(mut pipes) = guard.take() {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let frame = serde_json::json!({"id": id, "method": "close", "params": {}});
            // Best-effort polite shutdown, then make sure the process dies.
            let _ = Self::write_frame(&mut pipes.stdin, &frame).await;
            let _ = tokio::time::timeout(std::time::Duration::from_millis(500), async {
                let _ = Self::read_frame(&mut pipes.stdout).await;
            })
            .await;
            if let Err(e) = pipes.child.start_kill() {
                debug!("Sandbox interpreter already exited: {}", e);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("python_bin", &self.python_bin)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ParamSpec, ParamType, ToolDescriptor};
    use serde_json::json;

    struct UpperTool;

    #[async_trait]
    impl Tool for UpperTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("upper", "Uppercase a string")
                .with_input("text", ParamSpec::required(ParamType::String))
                .with_output("string")
        }

        async fn invoke(
            &self,
            args: serde_json::Map<String, Value>,
            _ctx: &ToolContext,
        ) -> std::result::Result<Value, crate::error::ToolError> {
            let text = args["text"].as_str().unwrap_or_default();
            Ok(json!(text.to_uppercase()))
        }
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok()
    }

    async fn prepared_backend() -> LocalBackend {
        let backend = LocalBackend::new();
        let mut namespace: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        namespace.insert("upper".to_string(), Arc::new(UpperTool));
        backend
            .prepare(namespace, merge_imports())
            .await
            .expect("prepare");
        backend
    }

    fn merge_imports() -> BTreeSet<String> {
        super::super::merge_authorized_imports(&[])
    }

    #[tokio::test]
    async fn executes_code_and_captures_stdout() {
        if !python_available() {
            return;
        }
        let backend = prepared_backend().await;
        let outcome = backend
            .execute("print('hello')", &Default::default(), &ToolContext::default())
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "hello");
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn trailing_expression_becomes_return_value() {
        if !python_available() {
            return;
        }
        let backend = prepared_backend().await;
        let outcome = backend
            .execute("x = 20\nx * 2 + 2", &Default::default(), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.return_value, Some(json!(42)));
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn state_survives_across_blocks() {
        if !python_available() {
            return;
        }
        let backend = prepared_backend().await;
        let mut state = serde_json::Map::new();
        state.insert("search_depth".to_string(), json!(1));

        let outcome = backend
            .execute(
                "search_depth = search_depth + 1",
                &state,
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.updated_state["search_depth"], json!(2));
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn tool_shims_call_back_into_host() {
        if !python_available() {
            return;
        }
        let backend = prepared_backend().await;
        let outcome = backend
            .execute(
                "result = upper(text='hi there')\nprint(result)",
                &Default::default(),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(outcome.success(), "stderr: {}", outcome.stderr);
        assert_eq!(outcome.stdout.trim(), "HI THERE");
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn final_answer_is_reported_as_sentinel() {
        if !python_available() {
            return;
        }
        let backend = prepared_backend().await;
        let code = r#"
import json
final_answer(json.dumps({"title": "hi", "content": "ok", "sources": []}, ensure_ascii=False))
"#;
        let outcome = backend
            .execute(code, &Default::default(), &ToolContext::default())
            .await
            .unwrap();
        assert!(outcome.final_answer.is_some());
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn python_exception_is_captured_not_fatal() {
        if !python_available() {
            return;
        }
        let backend = prepared_backend().await;
        let outcome = backend
            .execute("1 / 0", &Default::default(), &ToolContext::default())
            .await
            .unwrap();
        assert!(!outcome.success());
        assert!(outcome.error.as_deref().unwrap().contains("ZeroDivisionError"));
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn execute_before_prepare_fails() {
        let backend = LocalBackend::new();
        let err = backend
            .execute("print(1)", &Default::default(), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(err.message.contains("prepare"));
    }

    #[tokio::test]
    async fn closed_backend_rejects_execute() {
        let backend = LocalBackend::new();
        backend.close().await.unwrap();
        let err = backend
            .execute("print(1)", &Default::default(), &ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::SandboxErrorKind::Closed);
    }
}
