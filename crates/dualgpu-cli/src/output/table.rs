//! Table formatting for CLI output

use comfy_table::{ContentArrangement, Table as ComfyTable};
use serde_json::Value;

/// Table builder for CLI output
#[derive(Debug, Clone, Default)]
pub struct TableBuilder {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers(mut self, headers: &[&str]) -> Self {
        self.headers = headers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.rows.push(row);
        self
    }

    #[must_use]
    pub fn build(self) -> Table {
        let mut table = ComfyTable::new();
        table.set_header(&self.headers);
        for row in self.rows {
            table.add_row(row);
        }
        table.set_content_arrangement(ContentArrangement::Dynamic);
        Table { inner: table }
    }
}

/// Table for CLI output
#[derive(Debug, Clone)]
pub struct Table {
    inner: ComfyTable,
}

impl Table {
    pub fn builder() -> TableBuilder {
        TableBuilder::new()
    }

    /// Create a table from a JSON array of objects; headers come from the
    /// first object.
    pub fn from_json_array(arr: &[Value]) -> Self {
        let mut table = ComfyTable::new();

        if let Some(first) = arr.first()
            && let Some(obj) = first.as_object()
        {
            let headers: Vec<String> = obj.keys().cloned().collect();
            table.set_header(&headers);
        }

        for item in arr {
            if let Some(obj) = item.as_object() {
                let row: Vec<String> = obj
                    .values()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        Value::Null => "".to_string(),
                        _ => v.to_string(),
                    })
                    .collect();
                table.add_row(row);
            }
        }

        table
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_width(120);

        Self { inner: table }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_builder() {
        let table = Table::builder()
            .headers(&["GPU", "Memory"])
            .add_row(vec!["0".into(), "10240 / 24564 MiB".into()])
            .build();

        let output = table.to_string();
        assert!(output.contains("GPU"));
        assert!(output.contains("24564"));
    }

    #[test]
    fn test_from_json_array() {
        let json = serde_json::json!([
            {"model": "a@mock", "samples": 3},
            {"model": "b@mock", "samples": null}
        ]);

        let table = Table::from_json_array(json.as_array().unwrap());
        let output = table.to_string();

        assert!(output.contains("model"));
        assert!(output.contains("samples"));
        assert!(output.contains("b@mock"));
    }

    #[test]
    fn test_from_empty_array() {
        assert!(!Table::from_json_array(&[]).to_string().contains("model"));
    }
}
