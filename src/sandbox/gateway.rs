//! Sandbox gateway: validation, namespace marshaling, state echo
//!
//! The gateway is the only path from a loop to a backend. It runs the
//! static validator before every execution, remembers the prepared
//! namespace so a memory reset can re-install it, and treats the backend
//! itself as a black box.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::error::SandboxError;
use crate::tools::{Tool, ToolContext};

use super::validator::{merge_authorized_imports, CodeValidator};
use super::{ExecutionOutcome, SandboxBackend};

/// Host-side gateway in front of a sandbox backend
pub struct SandboxGateway {
    backend: Arc<dyn SandboxBackend>,
    validator: CodeValidator,
    namespace: Mutex<HashMap<String, Arc<dyn Tool>>>,
    authorized_imports: Mutex<BTreeSet<String>>,
}

impl SandboxGateway {
    /// Gateway over the given backend
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        SandboxGateway {
            backend,
            validator: CodeValidator::new(),
            namespace: Mutex::new(HashMap::new()),
            authorized_imports: Mutex::new(BTreeSet::new()),
        }
    }

    /// Install tool shims and the import allow-list in the backend
    ///
    /// The allow-list is the default set plus `additional_imports`, with
    /// dangerous module names always stripped.
    pub async fn prepare(
        &self,
        namespace: HashMap<String, Arc<dyn Tool>>,
        additional_imports: &[String],
    ) -> Result<(), SandboxError> {
        let imports = merge_authorized_imports(additional_imports);
        debug!(
            "Preparing sandbox namespace: {} tools, {} authorized imports",
            namespace.len(),
            imports.len()
        );
        *self.namespace.lock().expect("namespace lock") = namespace.clone();
        *self.authorized_imports.lock().expect("imports lock") = imports.clone();
        self.backend.prepare(namespace, imports).await
    }

    /// Re-install the previously prepared namespace (memory reset path)
    pub async fn reprepare(&self) -> Result<(), SandboxError> {
        let namespace = self.namespace.lock().expect("namespace lock").clone();
        let imports = self.authorized_imports.lock().expect("imports lock").clone();
        self.backend.prepare(namespace, imports).await
    }

    /// Validate and execute one code block
    ///
    /// Rejected code yields `unsafe_code` without contacting the backend.
    pub async fn execute(
        &self,
        code: &str,
        state: &serde_json::Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ExecutionOutcome, SandboxError> {
        self.validator.validate(code)?;
        self.backend.execute(code, state, ctx).await
    }

    /// Tear the backend down
    pub async fn close(&self) -> Result<(), SandboxError> {
        self.backend.close().await
    }
}

impl std::fmt::Debug for SandboxGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxGateway")
            .field("tools", &self.namespace.lock().expect("namespace lock").len())
            .finish()
    }
}
