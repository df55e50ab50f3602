//! Configuration options shared by all attention implementations.
//!
//! [`AttentionConfig`] captures the run-time knobs of a kernel invocation:
//! masking, softmax scale, determinism of the backward reduction and the tile
//! geometry. [`MaskRule`] is the resolved masking predicate both the fused
//! kernel and the reference consult, so the two can never disagree about
//! which keys a query may see.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

pub const DEFAULT_BLOCK_Q: usize = 64;
pub const DEFAULT_BLOCK_K: usize = 64;

/// Sliding-window extent around the (bottom-right aligned) diagonal.
///
/// `None` means the side is unbounded, which corresponds to `-1` in the
/// usual `(left, right)` window notation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl WindowSize {
    pub const UNBOUNDED: Self = Self {
        left: None,
        right: None,
    };

    pub fn new(left: usize, right: usize) -> Self {
        Self {
            left: Some(left),
            right: Some(right),
        }
    }

    /// Build a window from signed bounds where any negative value is unbounded.
    pub fn from_signed(left: i64, right: i64) -> Self {
        Self {
            left: usize::try_from(left).ok(),
            right: usize::try_from(right).ok(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.left.is_some() || self.right.is_some()
    }
}

/// Resolved masking predicate for one (query, key) sequence pair.
///
/// Query `i` of a `q_len` sequence is aligned with key `i + k_len - q_len`.
/// Causality caps the right side of the window at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskRule {
    left: Option<usize>,
    right: Option<usize>,
}

impl MaskRule {
    pub const FULL: Self = Self {
        left: None,
        right: None,
    };

    pub fn new(causal: bool, window: WindowSize) -> Self {
        let right = if causal { Some(0) } else { window.right };
        Self {
            left: window.left,
            right,
        }
    }

    pub fn is_causal(&self) -> bool {
        self.right == Some(0)
    }

    /// Contiguous span of keys visible to `q_idx`; empty when none are.
    pub fn key_span(&self, q_idx: usize, q_len: usize, k_len: usize) -> Range<usize> {
        let diagonal = q_idx as i64 + k_len as i64 - q_len as i64;
        let lo = self
            .left
            .map_or(0, |left| diagonal - left as i64)
            .max(0);
        let hi = self
            .right
            .map_or(k_len as i64, |right| diagonal + right as i64 + 1)
            .min(k_len as i64);
        if hi <= lo {
            0..0
        } else {
            lo as usize..hi as usize
        }
    }

    pub fn admits(&self, q_idx: usize, k_idx: usize, q_len: usize, k_len: usize) -> bool {
        self.key_span(q_idx, q_len, k_len).contains(&k_idx)
    }
}

/// Configuration driving a kernel invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    /// Restrict each query to keys at or before its aligned diagonal.
    pub causal: bool,
    /// Optional sliding window; combined with `causal` when both are set.
    pub window: WindowSize,
    /// Multiplier applied to `q · k`; defaults to `1 / sqrt(head_dim)`.
    pub softmax_scale: Option<f32>,
    /// Reduce backward partial sums in a fixed order.
    pub deterministic: bool,
    /// Process all query heads sharing a key/value head against one tile.
    pub gqa_parallel: bool,
    /// Query rows per tile.
    pub block_q: usize,
    /// Key rows per tile.
    pub block_k: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            causal: false,
            window: WindowSize::UNBOUNDED,
            softmax_scale: None,
            deterministic: false,
            gqa_parallel: false,
            block_q: DEFAULT_BLOCK_Q,
            block_k: DEFAULT_BLOCK_K,
        }
    }
}

impl AttentionConfig {
    pub fn mask_rule(&self) -> MaskRule {
        MaskRule::new(self.causal, self.window)
    }

    pub fn scale_for(&self, head_dim: usize) -> f32 {
        self.softmax_scale
            .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt())
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_q == 0 || self.block_k == 0 {
            return Err(AttentionError::argument(format!(
                "tile sizes must be non-zero, got block_q={} block_k={}",
                self.block_q, self.block_k
            )));
        }
        if let Some(scale) = self.softmax_scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(AttentionError::argument(format!(
                    "softmax_scale must be finite and positive, got {scale}"
                )));
            }
        }
        Ok(())
    }

    /// Apply `FLASH_ATTN_*` environment overrides for tile sizes and
    /// determinism. Kernels never call this; callers resolve the environment
    /// once and pass the result down.
    pub fn apply_env_overrides(&mut self) {
        EnvOverrides::from_env().apply(self);
    }
}

/// Overrides read from `FLASH_ATTN_BLOCK_Q`, `FLASH_ATTN_BLOCK_K` and
/// `FLASH_ATTN_DETERMINISTIC`. Unparseable values are ignored with a warning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub block_q: Option<usize>,
    pub block_k: Option<usize>,
    pub deterministic: Option<bool>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            block_q: parse_usize("FLASH_ATTN_BLOCK_Q", lookup("FLASH_ATTN_BLOCK_Q")),
            block_k: parse_usize("FLASH_ATTN_BLOCK_K", lookup("FLASH_ATTN_BLOCK_K")),
            deterministic: parse_flag(
                "FLASH_ATTN_DETERMINISTIC",
                lookup("FLASH_ATTN_DETERMINISTIC"),
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, cfg: &mut AttentionConfig) {
        if let Some(block_q) = self.block_q {
            log::debug!("FLASH_ATTN_BLOCK_Q override: {} -> {}", cfg.block_q, block_q);
            cfg.block_q = block_q;
        }
        if let Some(block_k) = self.block_k {
            log::debug!("FLASH_ATTN_BLOCK_K override: {} -> {}", cfg.block_k, block_k);
            cfg.block_k = block_k;
        }
        if let Some(deterministic) = self.deterministic {
            log::debug!("FLASH_ATTN_DETERMINISTIC override: {deterministic}");
            cfg.deterministic = deterministic;
        }
    }
}

fn parse_usize(key: &str, raw: Option<String>) -> Option<usize> {
    let raw = raw?;
    match raw.trim().parse::<usize>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {key}={raw}: expected an unsigned integer");
            None
        }
    }
}

fn parse_flag(key: &str, raw: Option<String>) -> Option<bool> {
    let raw = raw?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => {
            log::warn!("ignoring {key}={raw}: expected a boolean");
            None
        }
    }
}

/// Serialises tests that touch `FLASH_ATTN_*` and restores the previous
/// values on drop.
#[cfg(test)]
pub(crate) struct EnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

#[cfg(test)]
impl EnvGuard {
    pub(crate) fn set(vars: &[(&'static str, &str)]) -> Self {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        let lock = LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let saved = vars
            .iter()
            .map(|&(key, value)| {
                let previous = std::env::var(key).ok();
                std::env::set_var(key, value);
                (key, previous)
            })
            .collect();
        Self { saved, _lock: lock }
    }
}

#[cfg(test)]
impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, previous) in &self.saved {
            match previous {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_span_is_bottom_right_aligned() {
        let rule = MaskRule::new(true, WindowSize::UNBOUNDED);
        // q_len=3, k_len=5: the first query already sees keys 0..=2.
        assert_eq!(rule.key_span(0, 3, 5), 0..3);
        assert_eq!(rule.key_span(2, 3, 5), 0..5);
        // q_len > k_len: leading queries see nothing.
        assert_eq!(rule.key_span(0, 4, 2), 0..0);
        assert_eq!(rule.key_span(2, 4, 2), 0..1);
    }

    #[test]
    fn local_window_bounds_both_sides() {
        let rule = MaskRule::new(false, WindowSize::new(1, 2));
        assert_eq!(rule.key_span(3, 8, 8), 2..6);
        assert_eq!(rule.key_span(0, 8, 8), 0..3);
        assert_eq!(rule.key_span(7, 8, 8), 6..8);
    }

    #[test]
    fn causal_caps_right_window() {
        let rule = MaskRule::new(true, WindowSize::new(2, 5));
        assert!(rule.is_causal());
        assert_eq!(rule.key_span(4, 8, 8), 2..5);
    }

    #[test]
    fn signed_window_treats_negative_as_unbounded() {
        let window = WindowSize::from_signed(-1, 3);
        assert_eq!(window.left, None);
        assert_eq!(window.right, Some(3));
        assert!(window.is_local());
        assert!(!WindowSize::from_signed(-1, -1).is_local());
    }

    #[test]
    fn validate_rejects_zero_tiles_and_bad_scale() {
        let cfg = AttentionConfig {
            block_k: 0,
            ..AttentionConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = AttentionConfig {
            softmax_scale: Some(f32::NAN),
            ..AttentionConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(AttentionConfig::default().validate().is_ok());
    }

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key: &str| {
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn env_overrides_parse_and_skip_garbage() {
        let overrides = EnvOverrides::from_lookup(lookup(&[
            ("FLASH_ATTN_BLOCK_Q", " 32 "),
            ("FLASH_ATTN_BLOCK_K", "wide"),
            ("FLASH_ATTN_DETERMINISTIC", "Yes"),
        ]));
        assert_eq!(
            overrides,
            EnvOverrides {
                block_q: Some(32),
                block_k: None,
                deterministic: Some(true),
            }
        );
        assert!(EnvOverrides::from_lookup(lookup(&[])).is_empty());

        let mut cfg = AttentionConfig::default();
        overrides.apply(&mut cfg);
        assert_eq!((cfg.block_q, cfg.block_k), (32, DEFAULT_BLOCK_K));
        assert!(cfg.deterministic);
    }

    #[test]
    fn env_overrides_are_checked_by_validate() {
        let _env = EnvGuard::set(&[
            ("FLASH_ATTN_BLOCK_Q", "0"),
            ("FLASH_ATTN_BLOCK_K", "16"),
            ("FLASH_ATTN_DETERMINISTIC", "false"),
        ]);
        let mut cfg = AttentionConfig {
            block_q: 16,
            deterministic: true,
            ..AttentionConfig::default()
        };
        assert!(cfg.validate().is_ok());
        cfg.apply_env_overrides();
        assert_eq!((cfg.block_q, cfg.block_k), (0, 16));
        assert!(!cfg.deterministic);
        assert!(cfg.validate().is_err());
    }
}
