//! State container, typed keys and merge policies
//!
//! Every execution threads one [`State`] through the graph. Node handlers never mutate it
//! directly: they receive a snapshot and return a [`StateDelta`], and the engine merges the
//! delta under the field's declared [`MergePolicy`]. The merge is the only place where
//! concurrent branches meet, so it is the only place that needs exclusive access.
//!
//! # Merge policies
//!
//! | Policy | Behavior | Typical fields |
//! |--------|----------|----------------|
//! | [`MergePolicy::Overwrite`] | last writer wins | reports, language, final text |
//! | [`MergePolicy::Append`] | concatenate, optionally keep only the last N | history, tool logs |
//! | [`MergePolicy::Merge`] | shallow object merge | per-node counters |
//!
//! # Typed keys
//!
//! A [`StateKey`] binds a field name, its value type and its policy in one constant, so
//! handlers read and write through the registry instead of by string convention:
//!
//! ```rust
//! use flowgraph_core::state::{StateKey, StateSchema, StateDelta, State};
//!
//! const HISTORY: StateKey<Vec<String>> = StateKey::append("history", Some(20));
//! const LANGUAGE: StateKey<String> = StateKey::overwrite("language");
//!
//! let schema = StateSchema::new().with_key(&HISTORY).with_key(&LANGUAGE);
//!
//! let mut state = State::new();
//! let mut delta = StateDelta::new();
//! delta.put(&HISTORY, &vec!["hello".to_string()]).unwrap();
//! delta.put(&LANGUAGE, &"python".to_string()).unwrap();
//! schema.apply(&mut state, &delta).unwrap();
//! schema.apply(&mut state, &delta).unwrap();
//!
//! assert_eq!(state.get(&HISTORY).unwrap(), Some(vec!["hello".to_string(), "hello".to_string()]));
//! assert_eq!(state.get(&LANGUAGE).unwrap().as_deref(), Some("python"));
//! ```
//!
//! # Engine-owned fields
//!
//! [`LOOP_ITERATIONS`], [`BRANCH_FAILURES`] and [`PRUNED_NODES`] are written only by the engine. A handler
//! delta touching them is rejected with [`StateError::ReservedField`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use thiserror::Error;

/// Errors raised while reading or merging state
#[derive(Debug, Error)]
pub enum StateError {
    /// State or delta is not a JSON object
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Update does not fit the field's merge policy
    #[error("Field '{field}' uses {policy} merge but received {found}")]
    TypeMismatch {
        field: String,
        policy: &'static str,
        found: &'static str,
    },

    /// Handler tried to write an engine-owned field
    #[error("Field '{0}' is maintained by the engine")]
    ReservedField(String),

    /// Typed read or write failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// How an update combines with the current value of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum MergePolicy {
    /// Replace the current value
    #[default]
    Overwrite,

    /// Concatenate arrays (a scalar update is pushed as one element), keeping only the
    /// last `max_len` entries when bounded
    Append { max_len: Option<usize> },

    /// Insert the update's keys into the current object
    Merge,
}

impl MergePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            MergePolicy::Overwrite => "overwrite",
            MergePolicy::Append { .. } => "append",
            MergePolicy::Merge => "merge",
        }
    }

    /// Combine `update` into `current` for `field`
    pub fn reduce(&self, field: &str, current: &Value, update: &Value) -> Result<Value> {
        match self {
            MergePolicy::Overwrite => Ok(update.clone()),
            MergePolicy::Append { max_len } => {
                let mut items = match current {
                    Value::Array(items) => items.clone(),
                    Value::Null => Vec::new(),
                    other => return Err(self.mismatch(field, other)),
                };
                match update {
                    Value::Array(new_items) => items.extend(new_items.iter().cloned()),
                    Value::Null => {}
                    single => items.push(single.clone()),
                }
                if let Some(max_len) = max_len {
                    if items.len() > *max_len {
                        items.drain(..items.len() - max_len);
                    }
                }
                Ok(Value::Array(items))
            }
            MergePolicy::Merge => {
                let mut merged = match current {
                    Value::Object(obj) => obj.clone(),
                    Value::Null => Map::new(),
                    other => return Err(self.mismatch(field, other)),
                };
                match update {
                    Value::Object(obj) => {
                        for (key, value) in obj {
                            merged.insert(key.clone(), value.clone());
                        }
                    }
                    Value::Null => {}
                    other => return Err(self.mismatch(field, other)),
                }
                Ok(Value::Object(merged))
            }
        }
    }

    fn mismatch(&self, field: &str, found: &Value) -> StateError {
        StateError::TypeMismatch {
            field: field.to_string(),
            policy: self.name(),
            found: json_kind(found),
        }
    }
}

/// Typed handle to a state field and its declared merge policy
///
/// `T` is the type of the whole field value. For append fields it is the list type, and a
/// written value is appended element-wise.
pub struct StateKey<T> {
    name: &'static str,
    policy: MergePolicy,
    _ty: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn overwrite(name: &'static str) -> Self {
        Self::with_policy(name, MergePolicy::Overwrite)
    }

    pub const fn append(name: &'static str, max_len: Option<usize>) -> Self {
        Self::with_policy(name, MergePolicy::Append { max_len })
    }

    pub const fn merge(name: &'static str) -> Self {
        Self::with_policy(name, MergePolicy::Merge)
    }

    pub const fn with_policy(name: &'static str, policy: MergePolicy) -> Self {
        Self {
            name,
            policy,
            _ty: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> std::fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateKey")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Failure of one branch, recorded by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFailure {
    pub node: String,
    pub error: String,
}

/// Per-loop-head iteration counters
pub const LOOP_ITERATIONS: StateKey<BTreeMap<String, u32>> = StateKey::merge("loop_iterations");

/// Branches that failed during the current execution
pub const BRANCH_FAILURES: StateKey<Vec<BranchFailure>> = StateKey::append("branch_failures", None);

/// Nodes skipped during the current execution (pruned by a gate or cut off by failures)
pub const PRUNED_NODES: StateKey<Vec<String>> = StateKey::append("pruned_nodes", None);

const RESERVED: [&str; 3] = [LOOP_ITERATIONS.name, BRANCH_FAILURES.name, PRUNED_NODES.name];

/// Shared state of one execution: an ordered JSON object plus a revision counter
///
/// Serializes as the bare object. The revision counts applied deltas and is not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State {
    values: Map<String, Value>,
    #[serde(skip)]
    revision: u64,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON object. `null` yields an empty state.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(values) => Ok(Self {
                values,
                revision: 0,
            }),
            Value::Null => Ok(Self::new()),
            other => Err(StateError::InvalidState(format!(
                "state must be an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Read a typed field. Missing and `null` fields read as `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &StateKey<T>) -> Result<Option<T>> {
        match self.values.get(key.name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    pub fn get_raw(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// String field shortcut used by resolvers and status templates
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.values.get(field).and_then(Value::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Failures recorded so far in this execution
    pub fn branch_failures(&self) -> Vec<BranchFailure> {
        self.get(&BRANCH_FAILURES).ok().flatten().unwrap_or_default()
    }

    pub fn pruned_nodes(&self) -> Vec<String> {
        self.get(&PRUNED_NODES).ok().flatten().unwrap_or_default()
    }

    /// Loop-backs taken so far through `head`
    pub fn loop_iterations(&self, head: &str) -> u32 {
        self.get(&LOOP_ITERATIONS)
            .ok()
            .flatten()
            .and_then(|counters| counters.get(head).copied())
            .unwrap_or(0)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }

    /// Drop engine-owned fields, e.g. before resuming from a checkpoint
    pub(crate) fn clear_engine_fields(&mut self) {
        for field in RESERVED {
            self.values.remove(field);
        }
    }
}

/// Update returned by a node handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDelta {
    values: Map<String, Value>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style untyped write
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    /// Typed write through a registered key
    pub fn put<T: Serialize>(&mut self, key: &StateKey<T>, value: &T) -> Result<()> {
        self.values
            .insert(key.name.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            Value::Null => Ok(Self::new()),
            other => Err(StateError::InvalidState(format!(
                "delta must be an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }
}

impl From<Map<String, Value>> for StateDelta {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

/// Field registry: declared merge policy per field
#[derive(Debug, Clone)]
pub struct StateSchema {
    fields: HashMap<String, MergePolicy>,
    default_policy: MergePolicy,
}

impl Default for StateSchema {
    fn default() -> Self {
        let mut fields = HashMap::new();
        fields.insert(LOOP_ITERATIONS.name.to_string(), LOOP_ITERATIONS.policy);
        fields.insert(BRANCH_FAILURES.name.to_string(), BRANCH_FAILURES.policy);
        fields.insert(PRUNED_NODES.name.to_string(), PRUNED_NODES.policy);
        Self {
            fields,
            default_policy: MergePolicy::Overwrite,
        }
    }
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field by name
    pub fn add_field(&mut self, field: impl Into<String>, policy: MergePolicy) {
        self.fields.insert(field.into(), policy);
    }

    /// Declare the field behind a typed key
    pub fn with_key<T>(mut self, key: &StateKey<T>) -> Self {
        self.add_field(key.name, key.policy);
        self
    }

    pub fn with_field(mut self, field: impl Into<String>, policy: MergePolicy) -> Self {
        self.add_field(field, policy);
        self
    }

    /// Policy for fields that were never declared
    pub fn with_default_policy(mut self, policy: MergePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn policy_for(&self, field: &str) -> MergePolicy {
        self.fields
            .get(field)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Merge a handler delta. Engine-owned fields are rejected.
    pub fn apply(&self, state: &mut State, delta: &StateDelta) -> Result<()> {
        if let Some(field) = delta
            .values
            .keys()
            .find(|field| RESERVED.contains(&field.as_str()))
        {
            return Err(StateError::ReservedField(field.clone()));
        }
        self.apply_unchecked(state, delta)
    }

    /// Merge a delta produced by the engine itself
    pub(crate) fn apply_unchecked(&self, state: &mut State, delta: &StateDelta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }

        // Reduce into a scratch map first so a rejected field leaves state untouched.
        let mut reduced = Vec::with_capacity(delta.values.len());
        for (field, update) in &delta.values {
            let current = state.values.get(field).unwrap_or(&Value::Null);
            reduced.push((field.clone(), self.policy_for(field).reduce(field, current, update)?));
        }
        for (field, value) in reduced {
            state.values.insert(field, value);
        }
        state.revision += 1;
        Ok(())
    }

    pub fn fields(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HISTORY: StateKey<Vec<String>> = StateKey::append("history", Some(3));
    const REPORT: StateKey<Value> = StateKey::overwrite("report");

    #[test]
    fn test_overwrite_policy() {
        let out = MergePolicy::Overwrite
            .reduce("f", &json!("old"), &json!("new"))
            .unwrap();
        assert_eq!(out, json!("new"));
    }

    #[test]
    fn test_append_arrays_and_scalars() {
        let policy = MergePolicy::Append { max_len: None };
        assert_eq!(
            policy.reduce("f", &json!([1, 2]), &json!([3])).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(policy.reduce("f", &Value::Null, &json!(7)).unwrap(), json!([7]));
        assert_eq!(policy.reduce("f", &json!([1]), &json!("x")).unwrap(), json!([1, "x"]));
    }

    #[test]
    fn test_append_bounded_keeps_last() {
        let policy = MergePolicy::Append { max_len: Some(3) };
        let out = policy.reduce("f", &json!([1, 2, 3]), &json!([4, 5])).unwrap();
        assert_eq!(out, json!([3, 4, 5]));
    }

    #[test]
    fn test_append_rejects_scalar_current() {
        let policy = MergePolicy::Append { max_len: None };
        let err = policy.reduce("tool_logs", &json!(42), &json!([1])).unwrap_err();
        assert!(matches!(
            err,
            StateError::TypeMismatch { policy: "append", found: "number", .. }
        ));
    }

    #[test]
    fn test_merge_policy() {
        let out = MergePolicy::Merge
            .reduce("f", &json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}))
            .unwrap();
        assert_eq!(out, json!({"a": 1, "b": 3, "c": 4}));
        assert!(MergePolicy::Merge.reduce("f", &json!({}), &json!([1])).is_err());
    }

    #[test]
    fn test_schema_apply_typed_keys() {
        let schema = StateSchema::new().with_key(&HISTORY).with_key(&REPORT);
        let mut state = State::new();

        for turn in ["a", "b", "c", "d"] {
            let mut delta = StateDelta::new();
            delta.put(&HISTORY, &vec![turn.to_string()]).unwrap();
            delta.put(&REPORT, &json!({"turn": turn})).unwrap();
            schema.apply(&mut state, &delta).unwrap();
        }

        assert_eq!(
            state.get(&HISTORY).unwrap().unwrap(),
            vec!["b".to_string(), "c".to_string(), "d".to_string()]
        );
        assert_eq!(state.get(&REPORT).unwrap().unwrap(), json!({"turn": "d"}));
        assert_eq!(state.revision(), 4);
    }

    #[test]
    fn test_undeclared_fields_overwrite() {
        let schema = StateSchema::new();
        let mut state = State::from_value(json!({"x": [1]})).unwrap();
        schema
            .apply(&mut state, &StateDelta::new().with("x", json!([2])))
            .unwrap();
        assert_eq!(state.get_raw("x"), Some(&json!([2])));
    }

    #[test]
    fn test_default_policy_override() {
        let schema = StateSchema::new().with_default_policy(MergePolicy::Append { max_len: None });
        let mut state = State::new();
        schema.apply(&mut state, &StateDelta::new().with("log", "a")).unwrap();
        schema.apply(&mut state, &StateDelta::new().with("log", "b")).unwrap();
        assert_eq!(state.get_raw("log"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn test_reserved_fields_rejected_for_handlers() {
        let schema = StateSchema::new();
        let mut state = State::new();
        let delta = StateDelta::new().with("branch_failures", json!([]));
        assert!(matches!(
            schema.apply(&mut state, &delta),
            Err(StateError::ReservedField(_))
        ));

        schema.apply_unchecked(&mut state, &delta).unwrap();
        assert!(state.contains("branch_failures"));
    }

    #[test]
    fn test_failed_merge_leaves_state_untouched() {
        let schema = StateSchema::new().with_field("logs", MergePolicy::Append { max_len: None });
        let mut state = State::from_value(json!({"logs": "oops", "a": 1})).unwrap();
        let delta = StateDelta::new().with("a", 2).with("logs", json!(["x"]));

        assert!(schema.apply(&mut state, &delta).is_err());
        assert_eq!(state.get_raw("a"), Some(&json!(1)));
        assert_eq!(state.revision(), 0);
    }

    #[test]
    fn test_engine_counters() {
        let schema = StateSchema::new();
        let mut state = State::new();
        let mut delta = StateDelta::new();
        delta
            .put(&LOOP_ITERATIONS, &BTreeMap::from([("experts".to_string(), 2)]))
            .unwrap();
        delta
            .put(
                &BRANCH_FAILURES,
                &vec![BranchFailure {
                    node: "analyze_a".into(),
                    error: "boom".into(),
                }],
            )
            .unwrap();
        schema.apply_unchecked(&mut state, &delta).unwrap();

        assert_eq!(state.loop_iterations("experts"), 2);
        assert_eq!(state.loop_iterations("other"), 0);
        assert_eq!(state.branch_failures()[0].node, "analyze_a");
    }

    #[test]
    fn test_clear_engine_fields() {
        let mut state = State::from_value(json!({
            "loop_iterations": {"experts": 2},
            "pruned_nodes": ["chat_reply"],
            "final_report": "ok"
        }))
        .unwrap();
        state.clear_engine_fields();
        assert_eq!(state.fields().collect::<Vec<_>>(), vec!["final_report"]);
    }

    #[test]
    fn test_state_serializes_as_object() {
        let state = State::from_value(json!({"b": 1, "a": 2})).unwrap();
        let encoded = serde_json::to_string(&state).unwrap();
        assert_eq!(encoded, r#"{"b":1,"a":2}"#);
        assert!(State::from_value(json!("nope")).is_err());
    }
}
