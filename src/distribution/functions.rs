//! Split and reduce functions for fan-out
//!
//! Functions are referenced by name on the command line (`--split-fn`,
//! `--reduce-fn`) and resolved through a [`FunctionRegistry`]. Closures work
//! too: any `Fn(&Task) -> Result<Vec<Value>>` is a [`TaskSplitter`] and any
//! `Fn(Vec<Value>) -> Result<Value>` is a [`TaskReducer`].

use crate::core::{OrchestratorError, Result, Task};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Splits a task payload into subtask payloads
pub trait TaskSplitter: Send + Sync {
    /// One payload per subtask, in order
    fn split(&self, task: &Task) -> Result<Vec<Value>>;
}

impl<F> TaskSplitter for F
where
    F: Fn(&Task) -> Result<Vec<Value>> + Send + Sync,
{
    fn split(&self, task: &Task) -> Result<Vec<Value>> {
        self(task)
    }
}

/// Folds subtask outputs, given in split order
pub trait TaskReducer: Send + Sync {
    /// Combine the outputs
    fn reduce(&self, outputs: Vec<Value>) -> Result<Value>;
}

impl<F> TaskReducer for F
where
    F: Fn(Vec<Value>) -> Result<Value> + Send + Sync,
{
    fn reduce(&self, outputs: Vec<Value>) -> Result<Value> {
        self(outputs)
    }
}

fn items(task: &Task) -> Result<&Vec<Value>> {
    task.payload()
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            OrchestratorError::invalid_task(format!(
                "task {} has no `items` array to split",
                task.task_id()
            ))
        })
}

/// One subtask per element of `payload.items`
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemsSplitter;

impl TaskSplitter for ItemsSplitter {
    fn split(&self, task: &Task) -> Result<Vec<Value>> {
        Ok(items(task)?.clone())
    }
}

/// `n` roughly equal slices of `payload.items`
///
/// Each subtask payload is the original payload with `items` replaced by
/// its slice. Earlier slices take the remainder.
#[derive(Debug, Clone, Copy)]
pub struct ChunksSplitter {
    chunks: usize,
}

impl ChunksSplitter {
    /// Splitter producing up to `chunks` slices
    pub fn new(chunks: usize) -> Result<Self> {
        if chunks == 0 {
            return Err(OrchestratorError::invalid_config("split_fn", "chunks:<n> needs n >= 1"));
        }
        Ok(Self { chunks })
    }
}

impl TaskSplitter for ChunksSplitter {
    fn split(&self, task: &Task) -> Result<Vec<Value>> {
        let items = items(task)?;
        let count = self.chunks.min(items.len());
        if count == 0 {
            return Ok(Vec::new());
        }
        let base = items.len() / count;
        let extra = items.len() % count;

        let template = task.payload().as_object().cloned().unwrap_or_else(Map::new);
        let mut start = 0;
        let mut payloads = Vec::with_capacity(count);
        for i in 0..count {
            let len = base + usize::from(i < extra);
            let mut payload = template.clone();
            payload.insert("items".to_string(), Value::Array(items[start..start + len].to_vec()));
            payloads.push(Value::Object(payload));
            start += len;
        }
        Ok(payloads)
    }
}

/// Array of outputs
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectReducer;

impl TaskReducer for CollectReducer {
    fn reduce(&self, outputs: Vec<Value>) -> Result<Value> {
        Ok(Value::Array(outputs))
    }
}

/// Numeric sum; integral when every output is an integer
#[derive(Debug, Clone, Copy, Default)]
pub struct SumReducer;

impl TaskReducer for SumReducer {
    fn reduce(&self, outputs: Vec<Value>) -> Result<Value> {
        if outputs.iter().all(|v| v.is_i64()) {
            let total = outputs
                .iter()
                .filter_map(Value::as_i64)
                .try_fold(0i64, i64::checked_add)
                .ok_or_else(|| OrchestratorError::invalid_task("sum overflowed i64"))?;
            return Ok(Value::from(total));
        }
        let mut total = 0.0;
        for value in &outputs {
            total += value.as_f64().ok_or_else(|| {
                OrchestratorError::invalid_task(format!("sum expects numbers, got {}", value))
            })?;
        }
        Ok(Value::from(total))
    }
}

/// Flattened arrays or joined strings
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatReducer;

impl TaskReducer for ConcatReducer {
    fn reduce(&self, outputs: Vec<Value>) -> Result<Value> {
        if outputs.iter().all(Value::is_string) {
            let joined: String = outputs.iter().filter_map(Value::as_str).collect();
            return Ok(Value::String(joined));
        }
        let mut flattened = Vec::new();
        for value in outputs {
            match value {
                Value::Array(items) => flattened.extend(items),
                other => {
                    return Err(OrchestratorError::invalid_task(format!(
                        "concat expects arrays or strings, got {}",
                        other
                    )))
                }
            }
        }
        Ok(Value::Array(flattened))
    }
}

/// Named split and reduce functions
#[derive(Clone)]
pub struct FunctionRegistry {
    splitters: HashMap<String, Arc<dyn TaskSplitter>>,
    reducers: HashMap<String, Arc<dyn TaskReducer>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut splitters: Vec<_> = self.splitters.keys().collect();
        let mut reducers: Vec<_> = self.reducers.keys().collect();
        splitters.sort();
        reducers.sort();
        f.debug_struct("FunctionRegistry")
            .field("splitters", &splitters)
            .field("reducers", &reducers)
            .finish()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_splitter("items", Arc::new(ItemsSplitter));
        registry.register_reducer("collect", Arc::new(CollectReducer));
        registry.register_reducer("sum", Arc::new(SumReducer));
        registry.register_reducer("concat", Arc::new(ConcatReducer));
        registry
    }
}

impl FunctionRegistry {
    /// Registry without built-ins
    pub fn empty() -> Self {
        Self {
            splitters: HashMap::new(),
            reducers: HashMap::new(),
        }
    }

    /// Add or replace a splitter
    pub fn register_splitter(&mut self, name: impl Into<String>, splitter: Arc<dyn TaskSplitter>) {
        self.splitters.insert(name.into(), splitter);
    }

    /// Add or replace a reducer
    pub fn register_reducer(&mut self, name: impl Into<String>, reducer: Arc<dyn TaskReducer>) {
        self.reducers.insert(name.into(), reducer);
    }

    /// Resolve a splitter reference; `chunks:<n>` is built on the fly
    pub fn splitter(&self, reference: &str) -> Result<Arc<dyn TaskSplitter>> {
        if let Some(found) = self.splitters.get(reference) {
            return Ok(Arc::clone(found));
        }
        if let Some(n) = reference.strip_prefix("chunks:") {
            let n = n.trim().parse::<usize>().map_err(|_| {
                OrchestratorError::invalid_config("split_fn", format!("bad chunk count in '{}'", reference))
            })?;
            return Ok(Arc::new(ChunksSplitter::new(n)?));
        }
        Err(OrchestratorError::invalid_config(
            "split_fn",
            format!("unknown split function '{}'", reference),
        ))
    }

    /// Resolve a reducer reference
    pub fn reducer(&self, reference: &str) -> Result<Arc<dyn TaskReducer>> {
        self.reducers
            .get(reference)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::invalid_config(
                    "reduce_fn",
                    format!("unknown reduce function '{}'", reference),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(payload: Value) -> Task {
        Task::with_id("t", "x", payload)
    }

    #[test]
    fn test_items_splitter() {
        let parts = ItemsSplitter.split(&task(json!({"items": [1, "a", {"k": 2}]}))).unwrap();
        assert_eq!(parts, vec![json!(1), json!("a"), json!({"k": 2})]);
        assert_eq!(
            ItemsSplitter.split(&task(json!({"other": 1}))).unwrap_err().code(),
            "INVALID_TASK"
        );
    }

    #[test]
    fn test_chunks_splitter_balances_and_keeps_fields() {
        let parts = ChunksSplitter::new(3)
            .unwrap()
            .split(&task(json!({"items": [1, 2, 3, 4, 5, 6, 7], "mode": "fast"})))
            .unwrap();
        let sizes: Vec<usize> = parts.iter().map(|p| p["items"].as_array().unwrap().len()).collect();
        assert_eq!(sizes, vec![3, 2, 2]);
        assert_eq!(parts[2]["items"], json!([6, 7]));
        assert_eq!(parts[0]["mode"], "fast");

        let few = ChunksSplitter::new(5).unwrap().split(&task(json!({"items": [1, 2]}))).unwrap();
        assert_eq!(few.len(), 2);
        assert!(ChunksSplitter::new(0).is_err());
    }

    #[test]
    fn test_reducers() {
        assert_eq!(SumReducer.reduce(vec![json!(1), json!(2), json!(3)]).unwrap(), json!(6));
        assert_eq!(SumReducer.reduce(vec![json!(1), json!(0.5)]).unwrap(), json!(1.5));
        assert_eq!(SumReducer.reduce(vec![]).unwrap(), json!(0));
        assert!(SumReducer.reduce(vec![json!("x")]).is_err());

        assert_eq!(
            ConcatReducer.reduce(vec![json!([1]), json!([2, 3])]).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(ConcatReducer.reduce(vec![json!("ab"), json!("c")]).unwrap(), json!("abc"));
        assert!(ConcatReducer.reduce(vec![json!([1]), json!(2)]).is_err());

        assert_eq!(
            CollectReducer.reduce(vec![json!(1), json!(null)]).unwrap(),
            json!([1, null])
        );
    }

    #[test]
    fn test_registry_resolution() {
        let mut registry = FunctionRegistry::default();
        assert!(registry.splitter("items").is_ok());
        assert!(registry.splitter("chunks:4").is_ok());
        assert_eq!(registry.splitter("chunks:x").err().unwrap().code(), "INVALID_CONFIG");
        assert!(registry.splitter("nope").is_err());
        assert!(registry.reducer("sum").is_ok());
        assert!(registry.reducer("avg").is_err());

        registry.register_reducer(
            "count",
            Arc::new(|outputs: Vec<Value>| -> Result<Value> { Ok(json!(outputs.len())) }),
        );
        let count = registry.reducer("count").unwrap();
        assert_eq!(count.reduce(vec![json!(1), json!(2)]).unwrap(), json!(2));
    }
}
