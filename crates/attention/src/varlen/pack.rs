//! Conversions between padded `[batch, seqlen, heads, head_dim]` tensors and
//! packed ragged buffers.

use candle_core::{DType, Device, Tensor};

use super::batch::VarlenBatch;
use crate::core::{AttentionError, Result};

/// Packed inputs plus the bookkeeping needed to scatter results back.
#[derive(Debug, Clone)]
pub struct UnpaddedInputs {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub batch: VarlenBatch,
    query_rows: Vec<u32>,
    key_rows: Vec<u32>,
    batch_size: usize,
    seqlen_q: usize,
    seqlen_k: usize,
}

/// Pack padded query/key/value tensors into ragged buffers.
///
/// Padding masks mark valid positions with `true`. Positions flagged in the
/// optional `*_unused` masks are packed as well but excluded from attention
/// through `seqused`; within each sequence every valid row must precede every
/// unused row.
pub fn generate_qkv(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    query_padding: &[Vec<bool>],
    key_padding: &[Vec<bool>],
    query_unused: Option<&[Vec<bool>]>,
    key_unused: Option<&[Vec<bool>]>,
) -> Result<UnpaddedInputs> {
    let (batch_size, seqlen_q, heads, head_dim) = q.dims4()?;
    let (kb, seqlen_k, kv_heads, kd) = k.dims4()?;
    if kb != batch_size || kd != head_dim || v.dims() != k.dims() {
        return Err(AttentionError::shape(format!(
            "generate_qkv expects q [b, sq, h, d] and k/v [b, sk, hk, d], got {:?} and {:?}",
            q.dims(),
            k.dims()
        )));
    }

    let queries = collect_rows(query_padding, query_unused, batch_size, seqlen_q, "query")?;
    let keys = collect_rows(key_padding, key_unused, batch_size, seqlen_k, "key")?;

    let mut batch = VarlenBatch::from_lengths(&queries.present, &keys.present)?;
    if query_unused.is_some() || key_unused.is_some() {
        batch = batch.with_seqused(queries.valid.clone(), keys.valid.clone())?;
    }

    let device = q.device();
    let q_packed = gather_rows(q, &queries.rows, batch_size * seqlen_q, heads, head_dim, device)?;
    let k_packed = gather_rows(k, &keys.rows, batch_size * seqlen_k, kv_heads, head_dim, device)?;
    let v_packed = gather_rows(v, &keys.rows, batch_size * seqlen_k, kv_heads, head_dim, device)?;

    Ok(UnpaddedInputs {
        q: q_packed,
        k: k_packed,
        v: v_packed,
        batch,
        query_rows: queries.rows,
        key_rows: keys.rows,
        batch_size,
        seqlen_q,
        seqlen_k,
    })
}

impl UnpaddedInputs {
    /// Scatter packed query-aligned rows (outputs, `dq`) into a zero-filled
    /// `[batch, seqlen_q, heads, head_dim]` tensor.
    pub fn pad_queries(&self, packed: &Tensor) -> Result<Tensor> {
        scatter_rows(packed, &self.query_rows, self.batch_size, self.seqlen_q)
    }

    /// Gather query-aligned rows of a padded tensor (`dout`) in packed order.
    pub fn pack_queries(&self, padded: &Tensor) -> Result<Tensor> {
        let (batch, seqlen, heads, head_dim) = padded.dims4()?;
        if (batch, seqlen) != (self.batch_size, self.seqlen_q) {
            return Err(AttentionError::shape(format!(
                "padded tensor {:?} does not match [{}, {}, ..]",
                padded.dims(),
                self.batch_size,
                self.seqlen_q
            )));
        }
        gather_rows(
            padded,
            &self.query_rows,
            batch * seqlen,
            heads,
            head_dim,
            padded.device(),
        )
    }

    /// Scatter packed key-aligned rows (`dk`, `dv`) into a zero-filled
    /// `[batch, seqlen_k, kv_heads, head_dim]` tensor.
    pub fn pad_keys(&self, packed: &Tensor) -> Result<Tensor> {
        scatter_rows(packed, &self.key_rows, self.batch_size, self.seqlen_k)
    }
}

struct PackedRows {
    rows: Vec<u32>,
    present: Vec<usize>,
    valid: Vec<usize>,
}

fn collect_rows(
    padding: &[Vec<bool>],
    unused: Option<&[Vec<bool>]>,
    batch_size: usize,
    seqlen: usize,
    label: &str,
) -> Result<PackedRows> {
    if padding.len() != batch_size || padding.iter().any(|row| row.len() != seqlen) {
        return Err(AttentionError::shape(format!(
            "{label} padding mask must be [{batch_size}, {seqlen}]"
        )));
    }
    if let Some(unused) = unused {
        if unused.len() != batch_size || unused.iter().any(|row| row.len() != seqlen) {
            return Err(AttentionError::shape(format!(
                "{label} unused mask must be [{batch_size}, {seqlen}]"
            )));
        }
    }

    let mut rows = Vec::new();
    let mut present = Vec::with_capacity(batch_size);
    let mut valid = Vec::with_capacity(batch_size);
    for b in 0..batch_size {
        let mut n_present = 0;
        let mut n_valid = 0;
        for s in 0..seqlen {
            let is_valid = padding[b][s];
            let is_unused = unused.map_or(false, |u| u[b][s]);
            if !is_valid && !is_unused {
                continue;
            }
            if is_valid && n_present > n_valid {
                return Err(AttentionError::argument(format!(
                    "{label} sequence {b}: valid position {s} follows an unused position"
                )));
            }
            rows.push((b * seqlen + s) as u32);
            n_present += 1;
            if is_valid {
                n_valid += 1;
            }
        }
        present.push(n_present);
        valid.push(n_valid);
    }
    Ok(PackedRows {
        rows,
        present,
        valid,
    })
}

fn gather_rows(
    padded: &Tensor,
    rows: &[u32],
    flat_rows: usize,
    heads: usize,
    head_dim: usize,
    device: &Device,
) -> Result<Tensor> {
    let flat = padded.reshape((flat_rows, heads, head_dim))?;
    let ids = Tensor::from_vec(rows.to_vec(), rows.len(), device)?;
    Ok(flat.index_select(&ids, 0)?.contiguous()?)
}

fn scatter_rows(packed: &Tensor, rows: &[u32], batch: usize, seqlen: usize) -> Result<Tensor> {
    let (total, heads, head_dim) = packed.dims3()?;
    if total != rows.len() {
        return Err(AttentionError::shape(format!(
            "packed tensor has {total} rows but {} were gathered",
            rows.len()
        )));
    }
    let dtype = packed.dtype();
    let values = packed
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let width = heads * head_dim;
    let mut padded = vec![0f32; batch * seqlen * width];
    for (packed_row, &flat_row) in rows.iter().enumerate() {
        let dst = flat_row as usize * width;
        let src = packed_row * width;
        padded[dst..dst + width].copy_from_slice(&values[src..src + width]);
    }
    Ok(Tensor::from_vec(padded, (batch, seqlen, heads, head_dim), packed.device())?.to_dtype(dtype)?)
}
