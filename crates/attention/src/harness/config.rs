//! Harness configuration: file loading, validation and `key=value` overrides.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use super::cases::{ElementType, Suite};
use crate::core::config::{DEFAULT_BLOCK_K, DEFAULT_BLOCK_Q};
use crate::core::{AttentionConfig, AttentionError, EnvOverrides, Result};

/// Default ceiling on the memory the f64 reference may use for one case.
pub const DEFAULT_REFERENCE_MEMORY_LIMIT: u64 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Seed every case starts from; each suite has its own default.
    pub seed: Option<u64>,
    pub suites: Vec<Suite>,
    /// Drop grid entries whose longer sequence exceeds this length.
    pub max_seqlen: Option<usize>,
    pub head_dims: Option<Vec<usize>>,
    /// Element types swept by the dense, varlen and flex suites.
    pub dtypes: Option<Vec<ElementType>>,
    /// Keep only dense and varlen cases with this backward mode.
    pub deterministic: Option<bool>,
    /// Cases whose reference would need more bytes than this are skipped.
    pub reference_memory_limit: u64,
    pub block_q: usize,
    pub block_k: usize,
    /// Stop at most after this many cases per suite.
    pub max_cases: Option<usize>,
    pub fail_fast: bool,
    /// Markdown file receiving one section per suite.
    pub results_path: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            seed: None,
            suites: Suite::ALL.to_vec(),
            max_seqlen: None,
            head_dims: None,
            dtypes: None,
            deterministic: None,
            reference_memory_limit: DEFAULT_REFERENCE_MEMORY_LIMIT,
            block_q: DEFAULT_BLOCK_Q,
            block_k: DEFAULT_BLOCK_K,
            max_cases: None,
            fail_fast: false,
            results_path: None,
        }
    }
}

impl HarnessConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: HarnessConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| AttentionError::Config(format!("{}: {err}", path.display())))?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)
                .map_err(|err| AttentionError::Config(format!("{}: {err}", path.display())))?,
            Some(other) => {
                return Err(AttentionError::Config(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    /// Resolve a relative `results_path` against the config file's directory.
    fn apply_base_path(&mut self, base_dir: &Path) {
        if let Some(results) = &self.results_path {
            if results.is_relative() {
                self.results_path = Some(base_dir.join(results));
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.suites.is_empty() {
            errors.push("suites must not be empty".to_string());
        }

        if self.block_q == 0 || self.block_k == 0 {
            errors.push("block_q and block_k must be greater than 0".to_string());
        }

        if self.max_seqlen == Some(0) {
            errors.push("max_seqlen must be greater than 0".to_string());
        }

        if let Some(dims) = &self.head_dims {
            if dims.is_empty() {
                errors.push("head_dims must not be empty when set".to_string());
            }
            if dims.iter().any(|&d| d == 0) {
                errors.push("head_dims entries must be greater than 0".to_string());
            }
        }

        if matches!(&self.dtypes, Some(dtypes) if dtypes.is_empty()) {
            errors.push("dtypes must not be empty when set".to_string());
        }

        if self.reference_memory_limit == 0 {
            errors.push("reference_memory_limit must be greater than 0".to_string());
        }

        if self.max_cases == Some(0) {
            errors.push("max_cases must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AttentionError::Config(errors.join("; ")))
        }
    }

    /// Fold `FLASH_ATTN_*` overrides into the tile sizes and the backward
    /// mode filter. Called once by the front end; kernels see the result
    /// through the configs the harness builds.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(&EnvOverrides::from_env());
    }

    pub fn apply_overrides(&mut self, overrides: &EnvOverrides) {
        if overrides.is_empty() {
            return;
        }
        let mut kernel = AttentionConfig {
            block_q: self.block_q,
            block_k: self.block_k,
            deterministic: self.deterministic.unwrap_or_default(),
            ..AttentionConfig::default()
        };
        overrides.apply(&mut kernel);
        self.block_q = kernel.block_q;
        self.block_k = kernel.block_k;
        if overrides.deterministic.is_some() {
            self.deterministic = Some(kernel.deterministic);
        }
    }

    pub fn seed_for(&self, suite: Suite) -> u64 {
        self.seed.unwrap_or_else(|| suite.default_seed())
    }

    /// Apply `key=value` overrides through the config's JSON form. The first
    /// path segment must name a config field.
    pub fn with_overrides<'a, I>(self, overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut value = serde_json::to_value(&self).map_err(|err| {
            AttentionError::Config(format!("cannot serialize config for overrides: {err}"))
        })?;

        for (path, raw) in overrides {
            let path: OverridePath = path.parse()?;
            let field = &path.segments[0].key;
            if value.get(field).is_none() {
                return Err(AttentionError::Config(format!(
                    "unknown config key '{field}' in override '{path}'"
                )));
            }
            path.assign(&mut value, override_value(raw))?;
        }

        let config: HarnessConfig = serde_json::from_value(value)
            .map_err(|err| AttentionError::Config(format!("override rejected: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}

/// Interpret a raw override: booleans, `null`, numbers, JSON arrays/objects,
/// and bare comma lists (`64,128` or `dense,flex`) become typed values;
/// anything else stays a string.
fn override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            return json;
        }
    }
    if trimmed.contains(',') {
        return Value::Array(
            trimmed
                .split(',')
                .filter(|item| !item.trim().is_empty())
                .map(scalar_value)
                .collect(),
        );
    }
    scalar_value(trimmed)
}

fn scalar_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }
    if let Ok(int) = trimmed.parse::<u64>() {
        return Value::Number(Number::from(int));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

/// Dot-separated override target such as `suites[1]` or `head_dims`.
#[derive(Debug)]
struct OverridePath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl FromStr for OverridePath {
    type Err = AttentionError;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = |reason: String| AttentionError::Config(format!("override '{raw}': {reason}"));
        let mut segments = Vec::new();
        for segment in raw.trim().split('.') {
            let (key, index) = match segment.split_once('[') {
                Some((key, rest)) => {
                    let digits = rest
                        .strip_suffix(']')
                        .ok_or_else(|| invalid(format!("unclosed index in '{segment}'")))?;
                    let index = digits
                        .parse::<usize>()
                        .map_err(|err| invalid(format!("bad index in '{segment}': {err}")))?;
                    (key, Some(index))
                }
                None => (segment, None),
            };
            if key.is_empty() {
                return Err(invalid("empty key".to_string()));
            }
            segments.push(PathSegment {
                key: key.to_string(),
                index,
            });
        }
        Ok(Self {
            raw: raw.trim().to_string(),
            segments,
        })
    }
}

impl fmt::Display for OverridePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl OverridePath {
    fn assign(&self, target: &mut Value, new_value: Value) -> Result<()> {
        assign_at(target, &self.segments, new_value)
    }
}

fn assign_at(target: &mut Value, segments: &[PathSegment], new_value: Value) -> Result<()> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    if target.is_null() {
        *target = Value::Object(serde_json::Map::new());
    }
    let Some(map) = target.as_object_mut() else {
        return Err(AttentionError::Config(format!(
            "'{}' is not a table",
            segment.key
        )));
    };
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);

    let Some(index) = segment.index else {
        return assign_at(entry, rest, new_value);
    };
    if entry.is_null() {
        *entry = Value::Array(Vec::new());
    }
    let Some(array) = entry.as_array_mut() else {
        return Err(AttentionError::Config(format!(
            "'{}' is not a list",
            segment.key
        )));
    };
    if index > array.len() {
        return Err(AttentionError::Config(format!(
            "index {index} skips past the end of '{}' (length {})",
            segment.key,
            array.len()
        )));
    }
    if index == array.len() {
        array.push(Value::Null);
    }
    assign_at(&mut array[index], rest, new_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_values_are_typed() {
        assert_eq!(override_value("TRUE"), Value::Bool(true));
        assert_eq!(override_value("none"), Value::Null);
        assert_eq!(override_value("12"), Value::from(12u64));
        assert_eq!(override_value("0.5"), Value::from(0.5));
        assert_eq!(override_value("[64, 128]"), serde_json::json!([64, 128]));
        assert_eq!(override_value("64,128"), serde_json::json!([64, 128]));
        assert_eq!(override_value("dense, flex"), serde_json::json!(["dense", "flex"]));
        assert_eq!(override_value("varlen"), Value::from("varlen"));
    }

    #[test]
    fn overrides_reach_lists_and_indexed_fields() -> Result<()> {
        let config = HarnessConfig::default().with_overrides([
            ("max_seqlen", "256"),
            ("head_dims", "64,128"),
            ("dtypes", "bf16,f16"),
            ("suites[1]", "flex"),
            ("fail_fast", "true"),
            ("deterministic", "false"),
        ])?;
        assert_eq!(config.max_seqlen, Some(256));
        assert_eq!(config.head_dims, Some(vec![64, 128]));
        assert_eq!(config.dtypes, Some(vec![ElementType::Bf16, ElementType::F16]));
        assert_eq!(config.suites[1], Suite::Flex);
        assert!(config.fail_fast);
        assert_eq!(config.deterministic, Some(false));
        Ok(())
    }

    #[test]
    fn unknown_keys_and_bad_paths_are_rejected() {
        let err = HarnessConfig::default()
            .with_overrides([("max_seqlenn", "8")])
            .unwrap_err();
        assert!(err.to_string().contains("unknown config key 'max_seqlenn'"));

        // A lone value is not widened into a list.
        assert!(HarnessConfig::default()
            .with_overrides([("head_dims", "64")])
            .is_err());
        for path in ["suites[x]", "suites[1", "block_q..x", "suites[9]"] {
            assert!(
                HarnessConfig::default().with_overrides([(path, "dense")]).is_err(),
                "{path}"
            );
        }
        let mut value = serde_json::json!({ "block_q": 64 });
        let path: OverridePath = "block_q.inner".parse().unwrap();
        assert!(path.assign(&mut value, Value::from(1)).is_err());
    }

    #[test]
    fn validation_collects_every_problem() {
        let config = HarnessConfig {
            suites: Vec::new(),
            block_q: 0,
            max_cases: Some(0),
            ..HarnessConfig::default()
        };
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("suites"));
        assert!(message.contains("block_q"));
        assert!(message.contains("max_cases"));
    }

    #[test]
    fn env_overrides_reach_tiles_and_backward_filter() {
        let mut config = HarnessConfig::default();
        config.apply_overrides(&EnvOverrides::default());
        assert_eq!(config, HarnessConfig::default());

        config.apply_overrides(&EnvOverrides {
            block_k: Some(32),
            deterministic: Some(true),
            ..EnvOverrides::default()
        });
        assert_eq!((config.block_q, config.block_k), (DEFAULT_BLOCK_Q, 32));
        assert_eq!(config.deterministic, Some(true));
        assert!(crate::harness::cases::dense_cases(&config)
            .iter()
            .all(|case| case.deterministic));

        config.apply_overrides(&EnvOverrides {
            block_q: Some(0),
            ..EnvOverrides::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn seeds_default_per_suite() {
        let config = HarnessConfig::default();
        assert_eq!(config.seed_for(Suite::Varlen), 0);
        assert_eq!(config.seed_for(Suite::Dense), 42);
        let config = HarnessConfig {
            seed: Some(7),
            ..config
        };
        assert_eq!(config.seed_for(Suite::Flex), 7);
    }
}
