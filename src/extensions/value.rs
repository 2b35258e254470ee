//! Script values and structured clone.
//!
//! Extension code hands the runtime live object graphs: objects and arrays
//! are shared, mutable and may contain functions or point back at
//! themselves. Nothing crosses a context boundary by reference. Every
//! payload, response and stored item is first copied into a plain
//! [`serde_json::Value`] tree by [`structured_clone`].
//!
//! Rules applied while cloning:
//! - `undefined` and functions are omitted from objects and become `null`
//!   inside arrays (JSON semantics)
//! - non-finite numbers become `null`
//! - a reference cycle fails the whole clone, as does nesting deeper than
//!   [`MAX_CLONE_DEPTH`] containers
//! - [`ClonePolicy::Strict`] additionally rejects any function

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use serde_json::{Map, Number, Value};

use super::error::{ExtensionError, ExtensionResult};

/// A value as seen by extension script code.
#[derive(Debug, Clone, Default)]
pub enum ScriptValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(ScriptArray),
    Object(ScriptObject),
    /// A function reference. Only its name is kept, for diagnostics.
    Function(String),
}

/// Shared, mutable array handle. Clones alias the same storage.
#[derive(Clone, Default)]
pub struct ScriptArray(Arc<RwLock<Vec<ScriptValue>>>);

/// Shared, mutable object handle with insertion-ordered keys.
#[derive(Clone, Default)]
pub struct ScriptObject(Arc<RwLock<IndexMap<String, ScriptValue>>>);

impl ScriptArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: impl Into<ScriptValue>) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value.into());
    }

    pub fn get(&self, index: usize) -> Option<ScriptValue> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<ScriptValue> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl ScriptObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<ScriptValue>) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<ScriptValue> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<ScriptValue> {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current members in insertion order. Nested handles stay shared.
    pub fn entries(&self) -> Vec<(String, ScriptValue)> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

// Graphs may be cyclic, so never recurse in Debug.
impl fmt::Debug for ScriptArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptArray({:#x}, len={})", self.identity(), self.len())
    }
}

impl fmt::Debug for ScriptObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptObject({:#x}, len={})", self.identity(), self.len())
    }
}

impl<K: Into<String>, V: Into<ScriptValue>> FromIterator<(K, V)> for ScriptObject {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<IndexMap<_, _>>();
        Self(Arc::new(RwLock::new(map)))
    }
}

impl<V: Into<ScriptValue>> FromIterator<V> for ScriptArray {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        let items = iter.into_iter().map(Into::into).collect();
        Self(Arc::new(RwLock::new(items)))
    }
}

impl From<Value> for ScriptValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ScriptValue::Null,
            Value::Bool(b) => ScriptValue::Bool(b),
            Value::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => ScriptValue::String(s),
            Value::Array(items) => ScriptValue::Array(items.into_iter().collect()),
            Value::Object(map) => ScriptValue::Object(map.into_iter().collect()),
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<i32> for ScriptValue {
    fn from(n: i32) -> Self {
        ScriptValue::Number(f64::from(n))
    }
}

impl From<i64> for ScriptValue {
    fn from(n: i64) -> Self {
        ScriptValue::Number(n as f64)
    }
}

impl From<ScriptObject> for ScriptValue {
    fn from(object: ScriptObject) -> Self {
        ScriptValue::Object(object)
    }
}

impl From<ScriptArray> for ScriptValue {
    fn from(array: ScriptArray) -> Self {
        ScriptValue::Array(array)
    }
}

/// How strictly non-cloneable members are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClonePolicy {
    /// Messages and responses: any function fails the clone.
    Strict,
    /// Storage writes: functions are dropped like `undefined`.
    Lenient,
}

/// Containers nested deeper than this fail the clone.
pub const MAX_CLONE_DEPTH: usize = 128;

/// Clone a value for transfer. A top-level `undefined` becomes `null`
/// under either policy.
pub fn structured_clone(value: &ScriptValue, policy: ClonePolicy) -> ExtensionResult<Value> {
    Ok(clone_member(value, policy)?.unwrap_or(Value::Null))
}

/// Clone a value that sits in a member position. `Ok(None)` means the
/// value has no JSON form and the member should be omitted.
pub fn clone_member(value: &ScriptValue, policy: ClonePolicy) -> ExtensionResult<Option<Value>> {
    Cloner {
        policy,
        path: Vec::new(),
    }
    .clone_value(value)
}

// Integral values serialize without a fraction, like `JSON.stringify`.
fn number_to_json(n: f64) -> Value {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

struct Cloner {
    policy: ClonePolicy,
    // Identities of the containers currently being visited. Shared
    // subgraphs that are not on the path are fine.
    path: Vec<usize>,
}

impl Cloner {
    fn clone_value(&mut self, value: &ScriptValue) -> ExtensionResult<Option<Value>> {
        let cloned = match value {
            ScriptValue::Undefined => None,
            ScriptValue::Function(name) => match self.policy {
                ClonePolicy::Strict => {
                    return Err(ExtensionError::Serialization(format!(
                        "function '{}' could not be cloned",
                        name
                    )))
                }
                ClonePolicy::Lenient => None,
            },
            ScriptValue::Null => Some(Value::Null),
            ScriptValue::Bool(b) => Some(Value::Bool(*b)),
            ScriptValue::Number(n) => Some(number_to_json(*n)),
            ScriptValue::String(s) => Some(Value::String(s.clone())),
            ScriptValue::Array(array) => {
                self.enter(array.identity())?;
                let mut items = Vec::with_capacity(array.len());
                for item in array.snapshot() {
                    items.push(self.clone_value(&item)?.unwrap_or(Value::Null));
                }
                self.path.pop();
                Some(Value::Array(items))
            }
            ScriptValue::Object(object) => {
                self.enter(object.identity())?;
                let mut map = Map::new();
                for (key, member) in object.entries() {
                    if let Some(cloned) = self.clone_value(&member)? {
                        map.insert(key, cloned);
                    }
                }
                self.path.pop();
                Some(Value::Object(map))
            }
        };
        Ok(cloned)
    }

    fn enter(&mut self, identity: usize) -> ExtensionResult<()> {
        if self.path.len() >= MAX_CLONE_DEPTH {
            return Err(ExtensionError::Serialization(
                "maximum nesting depth exceeded".to_string(),
            ));
        }
        if self.path.contains(&identity) {
            return Err(ExtensionError::Serialization(
                "converting circular structure".to_string(),
            ));
        }
        self.path.push(identity);
        Ok(())
    }
}
