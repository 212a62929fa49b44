//! `dualgpu gpus` command implementation

use colored::Colorize;
use dualgpu_foundation::telemetry::NvidiaSmiSource;
use dualgpu_kernel::{GpuMetricsSource, GpuSample};

use crate::context::CliContext;
use crate::output::{OutputFormat, Table, render};

pub async fn run(ctx: &CliContext) -> anyhow::Result<()> {
    let gpus = NvidiaSmiSource::default().sample().await?;
    if gpus.is_empty() {
        println!("  No GPUs reported.");
        return Ok(());
    }

    let output = match ctx.output {
        OutputFormat::Table => gpu_table(&gpus).to_string(),
        format => render(&gpus, format, describe),
    };
    println!("{output}");
    Ok(())
}

fn describe(gpu: &GpuSample) -> String {
    let memory = format!(
        "{}/{} MiB ({:.0}%)",
        gpu.memory_used_mb,
        gpu.memory_total_mb,
        gpu.memory_used_fraction() * 100.0
    );
    format!(
        "{} {}  util {:>3.0}%  mem {}  {:.0}°C  {:.1} W",
        format!("GPU {}", gpu.index).cyan(),
        gpu.name,
        gpu.utilization,
        memory,
        gpu.temperature_c,
        gpu.power_w
    )
}

fn gpu_table(gpus: &[GpuSample]) -> Table {
    gpus.iter()
        .fold(
            Table::builder().headers(&["GPU", "Name", "Util %", "Memory (MiB)", "Temp °C", "Power W"]),
            |table, gpu| {
                table.add_row(vec![
                    gpu.index.to_string(),
                    gpu.name.clone(),
                    format!("{:.0}", gpu.utilization),
                    format!("{} / {}", gpu.memory_used_mb, gpu.memory_total_mb),
                    format!("{:.0}", gpu.temperature_c),
                    format!("{:.1}", gpu.power_w),
                ])
            },
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GpuSample {
        GpuSample {
            index: 1,
            name: "NVIDIA GeForce RTX 3090".into(),
            utilization: 42.0,
            memory_used_mb: 12288,
            memory_total_mb: 24576,
            temperature_c: 66.0,
            power_w: 280.5,
        }
    }

    #[test]
    fn test_describe_mentions_memory_share() {
        let line = describe(&sample());
        assert!(line.contains("12288/24576 MiB (50%)"));
        assert!(line.contains("RTX 3090"));
    }

    #[test]
    fn test_gpu_table() {
        let table = gpu_table(&[sample()]).to_string();
        assert!(table.contains("Memory (MiB)"));
        assert!(table.contains("12288 / 24576"));
        assert!(table.contains("280.5"));
    }
}
