//! Padding masks for batches of sequences with different valid lengths.
//!
//! Padding masks are `[batch][max_len]` boolean grids with `true` on valid
//! positions. Generated masks always have valid positions as a prefix.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::KeepMask;
use crate::core::{AttentionError, MaskRule, Result};

/// Distribution of generated sequence lengths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Every sequence uses the full length.
    Full,
    /// Lengths uniform in `[max(max_len - 20, 0 or 1), max_len]`.
    #[default]
    Random,
    /// Lengths uniform in `[max_len / 3, max_len]`.
    Third,
}

/// Draw a random prefix padding mask.
///
/// With `zero_lengths`, every fifth sequence (starting with the first) and
/// the last sequence are forced to length zero.
pub fn generate_random_padding_mask<R: Rng>(
    rng: &mut R,
    max_len: usize,
    batch: usize,
    mode: PaddingMode,
    zero_lengths: bool,
) -> Vec<Vec<bool>> {
    let mut lengths: Vec<usize> = (0..batch)
        .map(|_| match mode {
            PaddingMode::Full => max_len,
            PaddingMode::Random => {
                let floor = if zero_lengths { 0 } else { 1 };
                let low = floor.max(max_len.saturating_sub(20)).min(max_len);
                rng.gen_range(low..=max_len)
            }
            PaddingMode::Third => rng.gen_range(max_len / 3..=max_len),
        })
        .collect();

    if zero_lengths {
        for (i, len) in lengths.iter_mut().enumerate() {
            if i % 5 == 0 {
                *len = 0;
            }
        }
        if let Some(last) = lengths.last_mut() {
            *last = 0;
        }
    }

    padding_mask_from_lengths(&lengths, max_len)
}

pub fn padding_mask_from_lengths(lengths: &[usize], max_len: usize) -> Vec<Vec<bool>> {
    lengths
        .iter()
        .map(|&len| (0..max_len).map(|pos| pos < len).collect())
        .collect()
}

/// Number of valid positions per sequence.
pub fn padding_lengths(mask: &[Vec<bool>]) -> Vec<usize> {
    mask.iter()
        .map(|row| row.iter().filter(|&&valid| valid).count())
        .collect()
}

/// Split two padding masks into the positions attended by both and the
/// positions present in exactly one of them ("unused" rows that occupy
/// packed slots but take no part in attention).
pub fn split_unused(
    padding: &[Vec<bool>],
    other: &[Vec<bool>],
) -> Result<(Vec<Vec<bool>>, Vec<Vec<bool>>)> {
    if padding.len() != other.len()
        || padding.iter().zip(other).any(|(a, b)| a.len() != b.len())
    {
        return Err(AttentionError::shape("padding masks must share dimensions"));
    }
    let attend = padding
        .iter()
        .zip(other)
        .map(|(a, b)| a.iter().zip(b).map(|(&x, &y)| x && y).collect())
        .collect();
    let unused = padding
        .iter()
        .zip(other)
        .map(|(a, b)| a.iter().zip(b).map(|(&x, &y)| x != y).collect())
        .collect();
    Ok((attend, unused))
}

impl KeepMask {
    /// Combine `rule` with query and key padding masks.
    ///
    /// The diagonal of each sequence is aligned using its number of valid
    /// queries and keys; padded queries see nothing.
    pub fn from_padding(
        rule: MaskRule,
        query_padding: &[Vec<bool>],
        key_padding: &[Vec<bool>],
    ) -> Result<KeepMask> {
        if query_padding.len() != key_padding.len() {
            return Err(AttentionError::shape(format!(
                "query padding batch {} differs from key padding batch {}",
                query_padding.len(),
                key_padding.len()
            )));
        }
        let batch = query_padding.len();
        let q_len = query_padding.first().map_or(0, |row| row.len());
        let k_len = key_padding.first().map_or(0, |row| row.len());
        if query_padding.iter().any(|row| row.len() != q_len)
            || key_padding.iter().any(|row| row.len() != k_len)
        {
            return Err(AttentionError::shape("padding rows must share one length"));
        }

        let mut mask = KeepMask::empty(batch, q_len, k_len);
        for b in 0..batch {
            let queries: Vec<usize> = positions(&query_padding[b]);
            let keys: Vec<usize> = positions(&key_padding[b]);
            for (rank, &i) in queries.iter().enumerate() {
                for key_rank in rule.key_span(rank, queries.len(), keys.len()) {
                    mask.set(b, i, keys[key_rank], true);
                }
            }
        }
        Ok(mask)
    }
}

fn positions(row: &[bool]) -> Vec<usize> {
    row.iter()
        .enumerate()
        .filter_map(|(pos, &valid)| valid.then_some(pos))
        .collect()
}
