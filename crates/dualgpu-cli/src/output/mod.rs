//! Output formatting module
//!
//! Every command hands its rows to [`render`], which prints them as plain
//! text, JSON for automation, or a table.

pub mod json;
mod table;

pub use json::JsonOutput;
pub use table::Table;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output for automation
    Json,
    /// Table-formatted output
    Table,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Table => write!(f, "table"),
        }
    }
}

/// Format `rows` for display. `text` renders one row in text mode.
pub fn render<T: JsonOutput>(rows: &[T], format: OutputFormat, text: impl Fn(&T) -> String) -> String {
    match format {
        OutputFormat::Text => rows.iter().map(text).collect::<Vec<_>>().join("\n"),
        OutputFormat::Json => {
            let values: Vec<serde_json::Value> = rows.iter().map(JsonOutput::to_json).collect();
            json::pretty(&serde_json::Value::Array(values))
        }
        OutputFormat::Table => {
            let values: Vec<serde_json::Value> = rows.iter().map(JsonOutput::to_json).collect();
            Table::from_json_array(&values).to_string()
        }
    }
}
