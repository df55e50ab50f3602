//! `cu_seqlens` descriptors for ragged batches.

use crate::core::{AttentionError, Result};

/// Location of one sequence inside a packed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First packed row of the sequence.
    pub start: usize,
    /// Rows reserved for the sequence.
    pub len: usize,
    /// Leading rows that take part in attention (`<= len`).
    pub used: usize,
}

/// Ragged batch layout: prefix offsets into packed query and key buffers.
///
/// `cu_seqlens_*` hold `batch + 1` offsets starting at zero. When
/// `seqused_*` is present only the leading `seqused[i]` rows of sequence `i`
/// participate; the remaining rows keep their slot but produce zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarlenBatch {
    pub cu_seqlens_q: Vec<usize>,
    pub cu_seqlens_k: Vec<usize>,
    pub seqused_q: Option<Vec<usize>>,
    pub seqused_k: Option<Vec<usize>>,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
}

impl VarlenBatch {
    pub fn from_lengths(lengths_q: &[usize], lengths_k: &[usize]) -> Result<Self> {
        if lengths_q.len() != lengths_k.len() {
            return Err(AttentionError::argument(format!(
                "query batch ({}) and key batch ({}) differ",
                lengths_q.len(),
                lengths_k.len()
            )));
        }
        Ok(Self {
            cu_seqlens_q: prefix_offsets(lengths_q),
            cu_seqlens_k: prefix_offsets(lengths_k),
            seqused_q: None,
            seqused_k: None,
            max_seqlen_q: lengths_q.iter().copied().max().unwrap_or(0),
            max_seqlen_k: lengths_k.iter().copied().max().unwrap_or(0),
        })
    }

    pub fn with_seqused(mut self, seqused_q: Vec<usize>, seqused_k: Vec<usize>) -> Result<Self> {
        self.seqused_q = Some(seqused_q);
        self.seqused_k = Some(seqused_k);
        self.check_used()?;
        Ok(self)
    }

    pub fn batch(&self) -> usize {
        self.cu_seqlens_q.len().saturating_sub(1)
    }

    pub fn total_q(&self) -> usize {
        self.cu_seqlens_q.last().copied().unwrap_or(0)
    }

    pub fn total_k(&self) -> usize {
        self.cu_seqlens_k.last().copied().unwrap_or(0)
    }

    pub fn query_segment(&self, index: usize) -> Segment {
        segment(&self.cu_seqlens_q, self.seqused_q.as_deref(), index)
    }

    pub fn key_segment(&self, index: usize) -> Segment {
        segment(&self.cu_seqlens_k, self.seqused_k.as_deref(), index)
    }

    /// Check offsets against the packed tensor sizes.
    pub fn validate(&self, total_q: usize, total_k: usize) -> Result<()> {
        for (name, cu) in [("cu_seqlens_q", &self.cu_seqlens_q), ("cu_seqlens_k", &self.cu_seqlens_k)] {
            if cu.first() != Some(&0) {
                return Err(AttentionError::argument(format!("{name} must start at 0")));
            }
            if cu.windows(2).any(|pair| pair[1] < pair[0]) {
                return Err(AttentionError::argument(format!(
                    "{name} must be non-decreasing"
                )));
            }
        }
        if self.cu_seqlens_q.len() != self.cu_seqlens_k.len() {
            return Err(AttentionError::argument(
                "cu_seqlens_q and cu_seqlens_k describe different batch sizes",
            ));
        }
        if self.total_q() > total_q || self.total_k() > total_k {
            return Err(AttentionError::shape(format!(
                "cu_seqlens cover ({}, {}) rows but tensors hold ({total_q}, {total_k})",
                self.total_q(),
                self.total_k()
            )));
        }
        self.check_used()
    }

    fn check_used(&self) -> Result<()> {
        let batch = self.batch();
        for (name, used, cu) in [
            ("seqused_q", self.seqused_q.as_ref(), &self.cu_seqlens_q),
            ("seqused_k", self.seqused_k.as_ref(), &self.cu_seqlens_k),
        ] {
            let Some(used) = used else { continue };
            if used.len() != batch {
                return Err(AttentionError::argument(format!(
                    "{name} has {} entries for a batch of {batch}",
                    used.len()
                )));
            }
            for (i, &rows) in used.iter().enumerate() {
                let len = cu[i + 1] - cu[i];
                if rows > len {
                    return Err(AttentionError::argument(format!(
                        "{name}[{i}] = {rows} exceeds segment length {len}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn segment(cu: &[usize], used: Option<&[usize]>, index: usize) -> Segment {
    let start = cu[index];
    let len = cu[index + 1] - start;
    let used = used.map_or(len, |used| used[index].min(len));
    Segment { start, len, used }
}

/// Convert per-sequence lengths into `cu_seqlens` offsets.
pub fn prefix_offsets(lengths: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(lengths.len() + 1);
    offsets.push(0);
    let mut acc = 0usize;
    for &len in lengths {
        acc += len;
        offsets.push(acc);
    }
    offsets
}
