//! Model keys: the identity of one loadable engine configuration.
//!
//! Two keys are equal iff path, backend kind and the normalized parameter set
//! are equal. Keys are immutable once constructed; all validation happens in
//! the constructors so the pool never sees a malformed key.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Inference runtime that serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    LlamaCpp,
    Vllm,
    Transformers,
    Mock,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::LlamaCpp,
        BackendKind::Vllm,
        BackendKind::Transformers,
        BackendKind::Mock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LlamaCpp => "llamacpp",
            BackendKind::Vllm => "vllm",
            BackendKind::Transformers => "transformers",
            BackendKind::Mock => "mock",
        }
    }

    /// Pick a runtime from the model path: GGUF files go to llama.cpp, AWQ
    /// checkpoints to vLLM, everything else to Transformers.
    pub fn infer_from_path(model_path: &str) -> Self {
        let ext = Path::new(model_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let lower = model_path.to_ascii_lowercase();

        if ext.as_deref() == Some("gguf") || lower.contains("gguf") {
            BackendKind::LlamaCpp
        } else if lower.contains("awq") {
            BackendKind::Vllm
        } else {
            BackendKind::Transformers
        }
    }

    /// Parse a kind name, resolving `auto` (or an empty string) against the
    /// model path.
    pub fn parse_or_infer(kind: &str, model_path: &str) -> PoolResult<Self> {
        let trimmed = kind.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return Ok(Self::infer_from_path(model_path));
        }
        trimmed.parse()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "llamacpp" | "llama.cpp" | "llama_cpp" | "llama-cpp" => Ok(BackendKind::LlamaCpp),
            "vllm" => Ok(BackendKind::Vllm),
            "transformers" | "hf" | "huggingface" => Ok(BackendKind::Transformers),
            "mock" => Ok(BackendKind::Mock),
            other => Err(PoolError::InvalidKey(format!(
                "unknown backend kind '{other}'"
            ))),
        }
    }
}

/// A primitive launch parameter value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Interpret a raw string the way a command line would: booleans,
    /// integers and finite floats are typed, anything else stays text.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("true") {
            return ParamValue::Bool(true);
        }
        if raw.eq_ignore_ascii_case("false") {
            return ParamValue::Bool(false);
        }
        if let Ok(i) = raw.parse::<i64>() {
            return ParamValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return ParamValue::Float(f).normalized();
            }
        }
        ParamValue::Text(raw.to_string())
    }

    /// Integral floats collapse to integers so `2` and `2.0` name the same
    /// configuration; `-0.0` collapses to `0`.
    fn normalized(self) -> Self {
        match self {
            ParamValue::Float(f)
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 =>
            {
                ParamValue::Int(f as i64)
            }
            ParamValue::Text(s) => ParamValue::Text(s.trim().to_string()),
            other => other,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Bool(a), ParamValue::Bool(b)) => a == b,
            (ParamValue::Int(a), ParamValue::Int(b)) => a == b,
            (ParamValue::Float(a), ParamValue::Float(b)) => a.to_bits() == b.to_bits(),
            (ParamValue::Text(a), ParamValue::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ParamValue {}

impl Hash for ParamValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ParamValue::Bool(b) => b.hash(state),
            ParamValue::Int(i) => i.hash(state),
            ParamValue::Float(f) => f.to_bits().hash(state),
            ParamValue::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Identity of one loadable configuration: path, runtime, and parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelKey {
    model_path: String,
    backend_kind: BackendKind,
    parameters: BTreeMap<String, ParamValue>,
}

impl ModelKey {
    /// Build a key from typed parts.
    ///
    /// Fails with [`PoolError::InvalidKey`] on an empty path, an empty
    /// parameter name, or a non-finite float parameter.
    pub fn new<I, K, V>(
        model_path: impl Into<String>,
        backend_kind: BackendKind,
        parameters: I,
    ) -> PoolResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        let model_path = model_path.into().trim().to_string();
        if model_path.is_empty() {
            return Err(PoolError::InvalidKey("model path must not be empty".into()));
        }

        let mut normalized = BTreeMap::new();
        for (name, value) in parameters {
            let name = name.into().trim().to_ascii_lowercase();
            if name.is_empty() {
                return Err(PoolError::InvalidKey(
                    "parameter names must not be empty".into(),
                ));
            }
            let value = value.into();
            if let ParamValue::Float(f) = value {
                if !f.is_finite() {
                    return Err(PoolError::InvalidKey(format!(
                        "parameter '{name}' must be a finite number"
                    )));
                }
            }
            normalized.insert(name, value.normalized());
        }

        Ok(Self {
            model_path,
            backend_kind,
            parameters: normalized,
        })
    }

    /// Build a key from a parameterless path.
    pub fn simple(model_path: impl Into<String>, backend_kind: BackendKind) -> PoolResult<Self> {
        Self::new(model_path, backend_kind, std::iter::empty::<(String, ParamValue)>())
    }

    /// Build a key from the stringly-typed inbound form used by launcher UIs
    /// and the CLI. `backend_kind` may be `auto`.
    pub fn parse(
        model_path: &str,
        backend_kind: &str,
        parameters: &HashMap<String, String>,
    ) -> PoolResult<Self> {
        let kind = BackendKind::parse_or_infer(backend_kind, model_path)?;
        Self::new(
            model_path,
            kind,
            parameters
                .iter()
                .map(|(k, v)| (k.clone(), ParamValue::parse(v))),
        )
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    pub fn parameters(&self) -> &BTreeMap<String, ParamValue> {
        &self.parameters
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.parameters.get(name)
    }

    /// Human-readable, stable label used for benchmarks and logs.
    pub fn label(&self) -> String {
        if self.parameters.is_empty() {
            return format!("{}@{}", self.model_path, self.backend_kind);
        }
        let params = self
            .parameters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}@{}{{{}}}", self.model_path, self.backend_kind, params)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
