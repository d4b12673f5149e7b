//! Scripted bridge for engine tests.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use ctxwatch_adapters::probe::DEFAULT_METRICS_EXPRESSION;
use ctxwatch_adapters::{
    BridgeError, ConsoleEntry, ContextDescriptor, InstrumentationBridge, NetworkEntry,
    StructuralSnapshot,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
struct Script {
    kind: String,
    delay: Duration,
    memory_mb: Option<f64>,
    fail_with: Option<BridgeError>,
    console: VecDeque<ConsoleEntry>,
    network: Vec<NetworkEntry>,
}

/// An in-memory bridge whose contexts behave as the test says.
#[derive(Debug, Default)]
pub(crate) struct ScriptedBridge {
    contexts: Mutex<BTreeMap<String, Script>>,
    /// Expressions other than the metrics probe, in call order.
    executed: Mutex<Vec<(String, String)>>,
    action_result: Mutex<Option<Value>>,
}

impl ScriptedBridge {
    pub fn add(&self, id: &str, kind: &str) {
        self.contexts.lock().insert(
            id.to_string(),
            Script {
                kind: kind.to_string(),
                delay: Duration::ZERO,
                memory_mb: Some(16.0),
                fail_with: None,
                console: VecDeque::new(),
                network: Vec::new(),
            },
        );
    }

    pub fn set_delay(&self, id: &str, ms: u64) {
        self.edit(id, |s| s.delay = Duration::from_millis(ms));
    }

    pub fn set_memory(&self, id: &str, mb: f64) {
        self.edit(id, |s| s.memory_mb = Some(mb));
    }

    pub fn fail(&self, id: &str, error: Option<BridgeError>) {
        self.edit(id, |s| s.fail_with = error);
    }

    pub fn push_console(&self, id: &str, entry: ConsoleEntry) {
        self.edit(id, |s| s.console.push_back(entry));
    }

    pub fn set_action_result(&self, value: Value) {
        *self.action_result.lock() = Some(value);
    }

    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().clone()
    }

    fn edit(&self, id: &str, f: impl FnOnce(&mut Script)) {
        if let Some(script) = self.contexts.lock().get_mut(id) {
            f(script);
        }
    }

    fn script(&self, id: &str) -> Result<Script, BridgeError> {
        let script = self
            .contexts
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::ContextGone(id.to_string()))?;
        match &script.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(script),
        }
    }
}

#[async_trait]
impl InstrumentationBridge for ScriptedBridge {
    async fn list_contexts(&self) -> Result<Vec<ContextDescriptor>, BridgeError> {
        Ok(self
            .contexts
            .lock()
            .iter()
            .map(|(id, s)| ContextDescriptor::new(id.clone(), s.kind.clone()))
            .collect())
    }

    async fn select_context(&self, context_id: &str) -> Result<(), BridgeError> {
        let script = self
            .contexts
            .lock()
            .get(context_id)
            .cloned()
            .ok_or_else(|| BridgeError::ContextGone(context_id.to_string()))?;
        // A failing context hangs on its first call, like an unresponsive worker.
        if script.fail_with.is_some() {
            tokio::time::sleep(script.delay).await;
        }
        Ok(())
    }

    async fn evaluate_in_context(&self, context_id: &str, expression: &str) -> Result<Value, BridgeError> {
        let script = self.script(context_id)?;
        if expression != DEFAULT_METRICS_EXPRESSION {
            self.executed
                .lock()
                .push((context_id.to_string(), expression.to_string()));
            return Ok(self.action_result.lock().clone().unwrap_or(Value::Bool(true)));
        }
        tokio::time::sleep(script.delay).await;
        Ok(match script.memory_mb {
            Some(mb) => json!({ "memory_mb": mb }),
            None => Value::Null,
        })
    }

    async fn read_console_output(&self, context_id: &str) -> Result<Vec<ConsoleEntry>, BridgeError> {
        self.script(context_id)?;
        let mut contexts = self.contexts.lock();
        Ok(contexts
            .get_mut(context_id)
            .map(|s| s.console.drain(..).collect())
            .unwrap_or_default())
    }

    async fn read_network_activity(&self, context_id: &str) -> Result<Vec<NetworkEntry>, BridgeError> {
        Ok(self.script(context_id)?.network)
    }

    async fn take_structural_snapshot(&self, context_id: &str) -> Result<StructuralSnapshot, BridgeError> {
        self.script(context_id)?;
        Ok(StructuralSnapshot {
            node_count: 1,
            captured_at_ms: 0,
            root: None,
        })
    }
}
