//! GPU telemetry from `nvidia-smi`.

use std::process::Stdio;

use async_trait::async_trait;
use dualgpu_kernel::{GpuMetricsSource, GpuSample, TelemetryError};
use tokio::process::Command;

const QUERY_FIELDS: &str =
    "index,name,utilization.gpu,memory.used,memory.total,temperature.gpu,power.draw";

/// Samples NVIDIA GPUs by shelling out to `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiSource {
    binary: String,
}

impl Default for NvidiaSmiSource {
    fn default() -> Self {
        Self::new("nvidia-smi")
    }
}

impl NvidiaSmiSource {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Parse `--format=csv,noheader,nounits` output, one GPU per line.
    pub fn parse_csv(output: &str) -> Result<Vec<GpuSample>, TelemetryError> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(parse_line)
            .collect()
    }
}

fn parse_line(line: &str) -> Result<GpuSample, TelemetryError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 7 {
        return Err(TelemetryError::Parse(format!(
            "expected 7 fields, got {}: '{line}'",
            fields.len()
        )));
    }

    Ok(GpuSample {
        index: number(fields[0], "index")?,
        name: fields[1].to_string(),
        utilization: optional_number(fields[2], "utilization")?,
        memory_used_mb: number(fields[3], "memory.used")?,
        memory_total_mb: number(fields[4], "memory.total")?,
        temperature_c: optional_number(fields[5], "temperature")?,
        power_w: optional_number(fields[6], "power.draw")?,
    })
}

fn number<T: std::str::FromStr>(raw: &str, field: &str) -> Result<T, TelemetryError> {
    raw.parse()
        .map_err(|_| TelemetryError::Parse(format!("invalid {field} value '{raw}'")))
}

/// Some boards report `[N/A]` or `[Not Supported]` for sensors they lack.
fn optional_number(raw: &str, field: &str) -> Result<f32, TelemetryError> {
    if raw.starts_with('[') {
        return Ok(0.0);
    }
    number(raw, field)
}

#[async_trait]
impl GpuMetricsSource for NvidiaSmiSource {
    async fn sample(&self) -> Result<Vec<GpuSample>, TelemetryError> {
        let output = Command::new(&self.binary)
            .arg(format!("--query-gpu={QUERY_FIELDS}"))
            .arg("--format=csv,noheader,nounits")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TelemetryError::Unavailable(format!("{}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TelemetryError::Unavailable(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }

        Self::parse_csv(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_gpus() {
        let out = "0, NVIDIA GeForce RTX 4090, 35, 10240, 24564, 61, 220.5\n\
                   1, NVIDIA GeForce RTX 3090, 0, 512, 24576, 40, [N/A]\n";
        let gpus = NvidiaSmiSource::parse_csv(out).unwrap();

        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpus[0].memory_used_mb, 10240);
        assert_eq!(gpus[0].power_w, 220.5);
        assert_eq!(gpus[1].index, 1);
        assert_eq!(gpus[1].power_w, 0.0);
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(NvidiaSmiSource::parse_csv("0, GPU, 1, 2\n").is_err());
        assert!(NvidiaSmiSource::parse_csv("x, GPU, 1, 2, 3, 4, 5\n").is_err());
        assert!(NvidiaSmiSource::parse_csv("\n\n").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let source = NvidiaSmiSource::new("/nonexistent/nvidia-smi");
        assert!(matches!(
            source.sample().await,
            Err(TelemetryError::Unavailable(_))
        ));
    }
}
