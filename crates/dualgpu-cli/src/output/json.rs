//! JSON output formatting

use serde::Serialize;
use serde_json::{Value, json};

/// Trait for types that can be serialized to JSON output
pub trait JsonOutput: Send + Sync {
    /// Convert to JSON value
    fn to_json(&self) -> Value;
}

impl<T: Serialize + Send + Sync> JsonOutput for T {
    fn to_json(&self) -> Value {
        json!(self)
    }
}

/// Pretty-printed JSON; falls back to compact output.
pub fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blanket_impl() {
        #[derive(Serialize)]
        struct Sample {
            label: &'static str,
        }
        assert_eq!(Sample { label: "x" }.to_json()["label"], "x");
    }

    #[test]
    fn test_pretty_is_multiline() {
        assert!(pretty(&json!({"a": 1, "b": 2})).contains('\n'));
    }
}
