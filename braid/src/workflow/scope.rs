//! The workflow variable scope
//!
//! Three stacked layers are visible to substitution: the per-iteration
//! item scope (innermost), step outputs accumulated in dependency order,
//! and the workflow-level `env`. Writes are monotonic: a completed step's
//! output is never overwritten except through an explicit re-run.

use std::collections::HashMap;

use serde_json::Value;

use super::WorkflowError;

/// Synthetic variables for one loop/fan-out iteration
#[derive(Debug, Clone)]
pub struct ItemScope {
    /// Binding name, `item` unless the step sets `item_name`
    pub name: String,
    pub item: Value,
    pub index: usize,
    pub iteration: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Scope {
    env: HashMap<String, String>,
    outputs: HashMap<String, Value>,
    item: Option<ItemScope>,
}

impl Scope {
    pub fn new(env: HashMap<String, String>) -> Self {
        Self {
            env,
            outputs: HashMap::new(),
            item: None,
        }
    }

    /// Scope for a child workflow: fresh outputs seeded from `with`
    /// parameters plus the initial input.
    pub fn child(env: HashMap<String, String>, initial: HashMap<String, Value>) -> Self {
        Self {
            env,
            outputs: initial,
            item: None,
        }
    }

    pub fn with_item(&self, item: ItemScope) -> Self {
        let mut scope = self.clone();
        scope.item = Some(item);
        scope
    }

    pub fn set_input(&mut self, input: Value) {
        self.outputs.insert("input".to_string(), input);
    }

    /// Bind a completed step's output. Rebinding an existing name is a
    /// [`WorkflowError::ScopeConflict`].
    pub fn bind(&mut self, name: &str, value: Value) -> Result<(), WorkflowError> {
        if self.outputs.contains_key(name) {
            return Err(WorkflowError::ScopeConflict(name.to_string()));
        }
        self.outputs.insert(name.to_string(), value);
        Ok(())
    }

    /// Overwrite a binding; only retry and fallback paths use this.
    pub fn force_bind(&mut self, name: &str, value: Value) {
        self.outputs.insert(name.to_string(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.outputs.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    /// Resolve a dotted path through the layered scope.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;

        let root: Value = match head {
            "env" => {
                let name: Vec<&str> = parts.collect();
                if name.is_empty() {
                    return None;
                }
                return self.env.get(&name.join(".")).map(|s| Value::String(s.clone()));
            }
            "index" => {
                return self.item.as_ref().map(|i| Value::from(i.index));
            }
            "iteration" => {
                return self.item.as_ref().map(|i| Value::from(i.iteration));
            }
            _ => {
                if let Some(item) = &self.item {
                    if head == item.name || head == "item" {
                        item.item.clone()
                    } else {
                        self.outputs.get(head)?.clone()
                    }
                } else {
                    self.outputs.get(head)?.clone()
                }
            }
        };

        let mut current = root;
        for part in parts {
            current = match &current {
                Value::Object(map) => map.get(part)?.clone(),
                Value::Array(items) => {
                    let idx: usize = part.parse().ok()?;
                    items.get(idx)?.clone()
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Full output layer, for returning to callers after a run.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.outputs.clone()
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        let mut env = HashMap::new();
        env.insert("REGION".to_string(), "eu-west-1".to_string());
        let mut scope = Scope::new(env);
        scope.set_input(json!("hello"));
        scope
            .bind("fetch", json!({"status": 200, "rows": [1, 2, 3]}))
            .unwrap();
        scope
    }

    #[test]
    fn test_lookup_layers() {
        let s = scope();
        assert_eq!(s.lookup("input"), Some(json!("hello")));
        assert_eq!(s.lookup("env.REGION"), Some(json!("eu-west-1")));
        assert_eq!(s.lookup("fetch.status"), Some(json!(200)));
        assert_eq!(s.lookup("fetch.rows.1"), Some(json!(2)));
        assert_eq!(s.lookup("missing"), None);
        assert_eq!(s.lookup("fetch.rows.9"), None);
    }

    #[test]
    fn test_item_scope_shadows() {
        let s = scope().with_item(ItemScope {
            name: "doc".to_string(),
            item: json!({"id": 7}),
            index: 2,
            iteration: 3,
        });
        assert_eq!(s.lookup("doc.id"), Some(json!(7)));
        assert_eq!(s.lookup("item.id"), Some(json!(7)));
        assert_eq!(s.lookup("index"), Some(json!(2)));
        assert_eq!(s.lookup("iteration"), Some(json!(3)));
        // outputs still visible underneath
        assert_eq!(s.lookup("fetch.status"), Some(json!(200)));
    }

    #[test]
    fn test_monotonic_bind() {
        let mut s = scope();
        let err = s.bind("fetch", json!(1)).unwrap_err();
        assert!(matches!(err, WorkflowError::ScopeConflict(_)));
        s.force_bind("fetch", json!(1));
        assert_eq!(s.lookup("fetch"), Some(json!(1)));
    }
}
