//! Recomputation-based backward pass.
//!
//! Probabilities are rebuilt from the forward log-sum-exp as
//! `p = exp(scale * q·k - lse)`. With `D_i = dout_i · out_i`:
//!
//! * `dv_j += p_ij * dout_i`
//! * `ds_ij = p_ij * (dout_i · v_j - D_i)`
//! * `dk_j += scale * ds_ij * q_i`
//! * `dq_i += scale * ds_ij * k_j`
//!
//! Key/value gradients are produced by units of (key/value head, segment, key
//! tile) whose partials are reduced in unit order. The deterministic mode
//! computes `dq` in a second pass over (query head, segment, query tile)
//! units, each walking its keys in ascending order; otherwise `dq` partials
//! are folded into a shared buffer as the key units finish.

use std::ops::Range;
use std::sync::Mutex;

use rayon::prelude::*;

use super::plan::{dot, tiles, HostTensor, Plan, WorkSegment};
use crate::core::{AttentionError, Result};

pub(crate) struct HostGradients {
    pub dq: HostTensor,
    pub dk: HostTensor,
    pub dv: HostTensor,
}

/// Read-only inputs of the backward pass in packed host layout.
pub(crate) struct BackwardInputs<'a> {
    pub q: &'a HostTensor,
    pub k: &'a HostTensor,
    pub v: &'a HostTensor,
    pub out: &'a HostTensor,
    pub dout: &'a HostTensor,
    /// `[heads, rows]`.
    pub lse: &'a [f32],
}

struct KeyUnit {
    kv_head: usize,
    segment: usize,
    keys: Range<usize>,
}

struct QueryUnit {
    head: usize,
    segment: usize,
    rows: Range<usize>,
}

/// Key-tile partials: `[keys, dim]` slices of the unit's key/value head.
struct KeyPartial {
    dk: Vec<f32>,
    dv: Vec<f32>,
}

struct Context<'a> {
    plan: &'a Plan,
    inputs: &'a BackwardInputs<'a>,
    /// `D_i` per `[head, row]`.
    delta: Vec<f32>,
}

impl<'a> Context<'a> {
    fn lse(&self, head: usize, row: usize) -> f32 {
        self.inputs.lse[head * self.plan.total_q + row]
    }

    fn delta(&self, head: usize, row: usize) -> f32 {
        self.delta[head * self.plan.total_q + row]
    }
}

pub(crate) fn backward(plan: &Plan, inputs: &BackwardInputs<'_>) -> Result<HostGradients> {
    let delta = row_deltas(plan, inputs);
    let ctx = Context {
        plan,
        inputs,
        delta,
    };

    let key_units: Vec<KeyUnit> = (0..plan.num_kv_heads)
        .flat_map(|kv_head| {
            plan.segments
                .iter()
                .enumerate()
                .flat_map(move |(index, segment)| {
                    tiles(0..segment.k_used, plan.block_k).map(move |keys| KeyUnit {
                        kv_head,
                        segment: index,
                        keys,
                    })
                })
        })
        .collect();

    let dim = plan.head_dim;
    let (partials, dq) = if plan.deterministic {
        let partials: Vec<KeyPartial> = key_units
            .par_iter()
            .map(|unit| key_unit(&ctx, unit, None))
            .collect();
        (partials, query_pass(&ctx))
    } else {
        let shared = Mutex::new(HostTensor::zeros(plan.total_q, plan.num_heads, dim));
        let partials = key_units
            .par_iter()
            .map(|unit| {
                let mut local = vec![0f32; plan.group_size() * segment_of(plan, unit.segment).q_used * dim];
                let partial = key_unit(&ctx, unit, Some(&mut local));
                fold_query_partial(plan, unit, &local, &shared)?;
                Ok(partial)
            })
            .collect::<Result<Vec<KeyPartial>>>()?;
        let dq = shared.into_inner().map_err(|_| AttentionError::Backend {
            message: "dq accumulator mutex poisoned".to_string(),
        })?;
        (partials, dq)
    };

    let mut dk = HostTensor::zeros(plan.total_k, plan.num_kv_heads, dim);
    let mut dv = HostTensor::zeros(plan.total_k, plan.num_kv_heads, dim);
    for (unit, partial) in key_units.iter().zip(partials) {
        let segment = segment_of(plan, unit.segment);
        for (local, j) in unit.keys.clone().enumerate() {
            let row = segment.k_start + j;
            let src = local * dim..(local + 1) * dim;
            add_into(dk.row_mut(row, unit.kv_head), &partial.dk[src.clone()]);
            add_into(dv.row_mut(row, unit.kv_head), &partial.dv[src]);
        }
    }

    Ok(HostGradients { dq, dk, dv })
}

fn segment_of(plan: &Plan, index: usize) -> &WorkSegment {
    &plan.segments[index]
}

fn row_deltas(plan: &Plan, inputs: &BackwardInputs<'_>) -> Vec<f32> {
    let mut delta = vec![0f32; plan.num_heads * plan.total_q];
    delta
        .par_chunks_mut(plan.total_q.max(1))
        .enumerate()
        .for_each(|(head, rows)| {
            for (row, slot) in rows.iter_mut().enumerate() {
                *slot = dot(inputs.dout.row(row, head), inputs.out.row(row, head));
            }
        });
    delta
}

/// Gradients of one key tile. When `dq` is given it receives the unit's
/// query contributions as `[group head, segment row, dim]`.
fn key_unit(ctx: &Context<'_>, unit: &KeyUnit, mut dq: Option<&mut Vec<f32>>) -> KeyPartial {
    let plan = ctx.plan;
    let inputs = ctx.inputs;
    let segment = segment_of(plan, unit.segment);
    let dim = plan.head_dim;
    let n_keys = unit.keys.len();
    let mut dk = vec![0f32; n_keys * dim];
    let mut dv = vec![0f32; n_keys * dim];

    for (local_head, head) in plan.group(unit.kv_head).enumerate() {
        for i in 0..segment.q_used {
            let visible = segment.key_span(i);
            if visible.end <= unit.keys.start {
                continue;
            }
            if visible.start >= unit.keys.end {
                break;
            }
            let lo = visible.start.max(unit.keys.start);
            let hi = visible.end.min(unit.keys.end);
            let row = segment.q_start + i;
            let q_row = inputs.q.row(row, head);
            let dout_row = inputs.dout.row(row, head);
            let lse = ctx.lse(head, row);
            let delta = ctx.delta(head, row);
            for j in lo..hi {
                let key_row = segment.k_start + j;
                let k_row = inputs.k.row(key_row, unit.kv_head);
                let v_row = inputs.v.row(key_row, unit.kv_head);
                let p = (plan.scale * dot(q_row, k_row) - lse).exp();
                let ds = p * (dot(dout_row, v_row) - delta);
                let local = (j - unit.keys.start) * dim;
                for d in 0..dim {
                    dv[local + d] += p * dout_row[d];
                    dk[local + d] += plan.scale * ds * q_row[d];
                }
                if let Some(dq) = dq.as_deref_mut() {
                    let base = (local_head * segment.q_used + i) * dim;
                    for d in 0..dim {
                        dq[base + d] += plan.scale * ds * k_row[d];
                    }
                }
            }
        }
    }
    KeyPartial { dk, dv }
}

fn fold_query_partial(
    plan: &Plan,
    unit: &KeyUnit,
    local: &[f32],
    shared: &Mutex<HostTensor>,
) -> Result<()> {
    let segment = segment_of(plan, unit.segment);
    let dim = plan.head_dim;
    let mut dq = shared.lock().map_err(|_| AttentionError::Backend {
        message: "dq accumulator mutex poisoned".to_string(),
    })?;
    for (local_head, head) in plan.group(unit.kv_head).enumerate() {
        for i in 0..segment.q_used {
            let base = (local_head * segment.q_used + i) * dim;
            add_into(
                dq.row_mut(segment.q_start + i, head),
                &local[base..base + dim],
            );
        }
    }
    Ok(())
}

fn query_pass(ctx: &Context<'_>) -> HostTensor {
    let plan = ctx.plan;
    let units: Vec<QueryUnit> = (0..plan.num_heads)
        .flat_map(|head| {
            plan.segments
                .iter()
                .enumerate()
                .flat_map(move |(index, segment)| {
                    tiles(0..segment.q_used, plan.block_q).map(move |rows| QueryUnit {
                        head,
                        segment: index,
                        rows,
                    })
                })
        })
        .collect();

    let partials: Vec<Vec<f32>> = units.par_iter().map(|unit| query_unit(ctx, unit)).collect();

    let dim = plan.head_dim;
    let mut dq = HostTensor::zeros(plan.total_q, plan.num_heads, dim);
    for (unit, partial) in units.iter().zip(partials) {
        let segment = segment_of(plan, unit.segment);
        for (local, i) in unit.rows.clone().enumerate() {
            add_into(
                dq.row_mut(segment.q_start + i, unit.head),
                &partial[local * dim..(local + 1) * dim],
            );
        }
    }
    dq
}

fn query_unit(ctx: &Context<'_>, unit: &QueryUnit) -> Vec<f32> {
    let plan = ctx.plan;
    let inputs = ctx.inputs;
    let segment = segment_of(plan, unit.segment);
    let kv_head = plan.kv_head(unit.head);
    let dim = plan.head_dim;
    let mut dq = vec![0f32; unit.rows.len() * dim];

    for (local, i) in unit.rows.clone().enumerate() {
        let row = segment.q_start + i;
        let q_row = inputs.q.row(row, unit.head);
        let dout_row = inputs.dout.row(row, unit.head);
        let lse = ctx.lse(unit.head, row);
        let delta = ctx.delta(unit.head, row);
        let acc = &mut dq[local * dim..(local + 1) * dim];
        for j in segment.key_span(i) {
            let key_row = segment.k_start + j;
            let k_row = inputs.k.row(key_row, kv_head);
            let p = (plan.scale * dot(q_row, k_row) - lse).exp();
            let ds = p * (dot(dout_row, inputs.v.row(key_row, kv_head)) - delta);
            for (a, &value) in acc.iter_mut().zip(k_row) {
                *a += plan.scale * ds * value;
            }
        }
    }
    dq
}

fn add_into(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}
