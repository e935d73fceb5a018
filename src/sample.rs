//! Samples and the time-sorted bounded buffer.
//!
//! A sample is one reading flowing through a pipeline graph: a unix timestamp
//! plus named scalar fields. Nodes enrich, replace or filter fields but never
//! mutate a sample another node already holds; copies travel downstream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A scalar field value inside a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view; integers and booleans coerce, text does not.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Text(_) => None,
        }
    }

    /// Truthiness for digital control inputs: nonzero numbers, `true`,
    /// and non-empty text are truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(t) => !t.is_empty(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Float(_) | Value::Int(_) | Value::Bool(_))
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", i32::from(*b)),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(t) => write!(f, "{}", t),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Parse a bus payload: integers stay integral, anything with a dot or
/// exponent becomes a float, everything else is text.
pub fn parse_scalar(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Text(text.to_string())
}

/// One reading travelling through a pipeline: a timestamp (unix seconds)
/// and named fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: f64,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Sample {
    pub fn new(time: f64) -> Self {
        Self {
            time,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Move a field to a new name, e.g. rewriting `input_var` to
    /// `output_var` when a stream source receives a bus message.
    pub fn rename(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        if let Some(v) = self.fields.remove(from) {
            self.fields.insert(to.to_string(), v);
        }
    }
}

/// A bounded buffer of samples kept sorted by time.
///
/// Insertion locates the position by binary search; on overflow the oldest
/// samples are dropped. Equal timestamps keep arrival order.
#[derive(Debug, Clone, Default)]
pub struct SortedBuffer {
    buf: Vec<Sample>,
    limit: Option<usize>,
}

impl SortedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit: Some(limit),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            buf: Vec::new(),
            limit: None,
        }
    }

    pub fn add(&mut self, sample: Sample) {
        let idx = self.buf.partition_point(|s| s.time <= sample.time);
        self.buf.insert(idx, sample);
        if let Some(limit) = self.limit {
            if self.buf.len() > limit {
                let excess = self.buf.len() - limit;
                self.buf.drain(..excess);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The configured capacity, if bounded.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = Some(limit);
        if self.buf.len() > limit {
            let excess = self.buf.len() - limit;
            self.buf.drain(..excess);
        }
    }

    pub fn is_full(&self) -> bool {
        match self.limit {
            Some(limit) => self.buf.len() >= limit,
            None => false,
        }
    }

    /// The freshest sample, if any.
    pub fn newest(&self) -> Option<&Sample> {
        self.buf.last()
    }

    pub fn oldest(&self) -> Option<&Sample> {
        self.buf.first()
    }

    /// Oldest-to-newest view of the contents.
    pub fn samples(&self) -> &[Sample] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
