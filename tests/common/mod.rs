//! Common test utilities and helpers

#![allow(dead_code)]

use anyhow::anyhow;
use mapflow::executor::ActionRegistry;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Write a strategy document into `dir` and return its path
pub fn write_strategy(dir: &Path, name: &str, yaml: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, yaml).expect("write strategy fixture");
    path
}

/// Actions that record what they were asked to do
#[derive(Clone, Default)]
pub struct RecordingActions {
    failures: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl RecordingActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builtins plus `record` (stores its params, returns them) and `fail`
    /// (always errors)
    pub fn registry(&self) -> ActionRegistry {
        let mut registry = ActionRegistry::with_builtins();

        let calls = Arc::clone(&self.calls);
        registry.register_fn("record", move |params, context| {
            let mut entry = params.clone();
            entry.insert("step".to_string(), json!(context.step_name));
            calls.lock().unwrap().push(Value::Object(entry));
            Ok(Value::Object(params.clone()))
        });

        let failures = Arc::clone(&self.failures);
        registry.register_fn("fail", move |_, context| {
            failures.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("{} failed on purpose", context.step_name))
        });
        registry
    }

    /// Params of every `record` call, in call order
    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }

    /// Step names of every `record` call, in call order
    pub fn steps(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|call| call["step"].as_str().map(str::to_string))
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}
