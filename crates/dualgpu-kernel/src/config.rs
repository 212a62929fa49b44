//! Configuration loading
//!
//! Loads typed configuration from YAML, TOML or JSON files, with
//! `${VAR}` / `$VAR` substitution in file contents and environment-variable
//! overrides layered on top.
//!
//! Layering order (later wins):
//!
//! 1. serde defaults of the target type
//! 2. the configuration file, if any
//! 3. `PREFIX_SECTION__FIELD` environment variables
//! 4. explicit legacy variable aliases

use std::path::Path;

use config::{Config as Cfg, Environment, File, FileFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

static BRACED_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("braced variable pattern is valid")
});

static BARE_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("bare variable pattern is valid")
});

/// Detect configuration format from file extension
///
/// - YAML: `.yaml`, `.yml`
/// - TOML: `.toml`
/// - JSON: `.json`
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute environment variables in a string
///
/// Supports `${VAR_NAME}` and `$VAR_NAME`. Unknown variables are left as-is.
pub fn substitute_env_vars(content: &str) -> String {
    let braced = BRACED_VAR.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });

    BARE_VAR
        .replace_all(&braced, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string()
}

/// Load configuration from a string with explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content);

    Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

/// Load configuration from an optional file plus environment overrides.
///
/// Environment variables use `env_prefix` and `__` for nesting, so
/// `DUALGPU_POOL__CAPACITY=4` sets `pool.capacity`. `aliases` maps extra
/// variable names onto config keys and is applied last.
pub fn load_layered<T>(
    path: Option<&Path>,
    env_prefix: &str,
    aliases: &[(&str, &str)],
) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let mut builder = Cfg::builder();

    if let Some(path) = path {
        let path_str = path.to_string_lossy();
        let format = detect_format(&path_str)?;
        let content = std::fs::read_to_string(path)?;
        builder = builder.add_source(File::from_str(&substitute_env_vars(&content), format));
    }

    builder = builder.add_source(
        Environment::with_prefix(env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    for (var, key) in aliases {
        builder = builder
            .set_override_option(*key, std::env::var(var).ok())
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
    }

    builder
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        #[serde(default)]
        name: String,
        #[serde(default)]
        size: usize,
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("pool.yaml").unwrap(), FileFormat::Yaml);
        assert_eq!(detect_format("pool.yml").unwrap(), FileFormat::Yaml);
        assert_eq!(detect_format("pool.toml").unwrap(), FileFormat::Toml);
        assert_eq!(detect_format("pool.json").unwrap(), FileFormat::Json);
        assert!(detect_format("pool.txt").is_err());
        assert!(detect_format("pool").is_err());
    }

    #[test]
    fn test_from_str_toml() {
        let sample: Sample = from_str("name = \"llama\"\nsize = 3\n", FileFormat::Toml).unwrap();
        assert_eq!(
            sample,
            Sample {
                name: "llama".into(),
                size: 3
            }
        );
    }

    #[test]
    fn test_substitution_leaves_unknown_vars() {
        let out = substitute_env_vars("path: ${DUALGPU_TEST_SURELY_UNSET_VAR}/models");
        assert_eq!(out, "path: ${DUALGPU_TEST_SURELY_UNSET_VAR}/models");
    }

    #[test]
    fn test_substitution_replaces_known_vars() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("DUALGPU_TEST_MODEL_DIR", "/srv/models") };
        let out = substitute_env_vars("a: ${DUALGPU_TEST_MODEL_DIR}/x\nb: $DUALGPU_TEST_MODEL_DIR");
        assert_eq!(out, "a: /srv/models/x\nb: /srv/models");
    }

    #[test]
    fn test_load_layered_file_and_alias() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.yaml");
        std::fs::write(&path, "name: from-file\nsize: 2\n").unwrap();

        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("DUALGPU_TEST_LEGACY_SIZE", "7") };
        let sample: Sample = load_layered(
            Some(&path),
            "DUALGPU_TEST_LAYERED",
            &[("DUALGPU_TEST_LEGACY_SIZE", "size")],
        )
        .unwrap();

        assert_eq!(sample.name, "from-file");
        assert_eq!(sample.size, 7);
    }

    #[derive(Debug, Deserialize)]
    struct Nested {
        #[serde(default)]
        pool: Sample,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "default".into(),
                size: 1,
            }
        }
    }

    #[test]
    fn test_load_layered_nested_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.toml");
        std::fs::write(&path, "[pool]\nname = \"from-file\"\nsize = 2\n").unwrap();

        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("DUALGPU_TEST_NESTED_POOL__SIZE", "4") };
        let nested: Nested = load_layered(Some(&path), "DUALGPU_TEST_NESTED", &[]).unwrap();

        assert_eq!(nested.pool.name, "from-file");
        assert_eq!(nested.pool.size, 4);
    }
}
