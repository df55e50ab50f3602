//! Tiled online-softmax forward pass.

use std::ops::Range;

use rayon::prelude::*;

use super::plan::{dot, tiles, HostTensor, Plan};

/// Packed forward results: `out` is `[rows, heads, dim]`, `lse` is
/// `[heads, rows]`.
pub(crate) struct HostForward {
    pub out: HostTensor,
    pub lse: Vec<f32>,
}

/// Running softmax statistics for every row of one query head.
struct HeadState {
    max: Vec<f32>,
    sum: Vec<f32>,
    acc: Vec<f32>,
}

impl HeadState {
    fn new(rows: usize, dim: usize) -> Self {
        Self {
            max: vec![f32::NEG_INFINITY; rows],
            sum: vec![0.0; rows],
            acc: vec![0.0; rows * dim],
        }
    }
}

/// Query heads processed together, all reading the same key/value head.
struct Unit {
    heads: Range<usize>,
    kv_head: usize,
}

pub(crate) fn forward(plan: &Plan, q: &HostTensor, k: &HostTensor, v: &HostTensor) -> HostForward {
    let units: Vec<Unit> = if plan.gqa_parallel {
        (0..plan.num_kv_heads)
            .map(|kv_head| Unit {
                heads: plan.group(kv_head),
                kv_head,
            })
            .collect()
    } else {
        (0..plan.num_heads)
            .map(|head| Unit {
                heads: head..head + 1,
                kv_head: plan.kv_head(head),
            })
            .collect()
    };

    let states: Vec<(Range<usize>, Vec<HeadState>)> = units
        .par_iter()
        .map(|unit| (unit.heads.clone(), run_unit(plan, unit, q, k, v)))
        .collect();

    let dim = plan.head_dim;
    let mut out = HostTensor::zeros(plan.total_q, plan.num_heads, dim);
    let mut lse = vec![f32::INFINITY; plan.num_heads * plan.total_q];
    for (heads, head_states) in states {
        for (head, state) in heads.zip(head_states) {
            for row in 0..plan.total_q {
                let sum = state.sum[row];
                if sum <= 0.0 {
                    continue;
                }
                lse[head * plan.total_q + row] = state.max[row] + sum.ln();
                let acc = &state.acc[row * dim..(row + 1) * dim];
                for (dst, &value) in out.row_mut(row, head).iter_mut().zip(acc) {
                    *dst = value / sum;
                }
            }
        }
    }
    HostForward { out, lse }
}

fn run_unit(plan: &Plan, unit: &Unit, q: &HostTensor, k: &HostTensor, v: &HostTensor) -> Vec<HeadState> {
    let dim = plan.head_dim;
    let mut states: Vec<HeadState> = unit
        .heads
        .clone()
        .map(|_| HeadState::new(plan.total_q, dim))
        .collect();
    let mut scores = vec![0f32; plan.block_k];

    // Segments are visited in order so rows shared by overlapping ranges
    // merge their statistics deterministically.
    for segment in &plan.segments {
        for q_tile in tiles(0..segment.q_used, plan.block_q) {
            let span = segment.tile_span(q_tile.clone());
            for k_tile in tiles(span, plan.block_k) {
                for (state, head) in states.iter_mut().zip(unit.heads.clone()) {
                    for i in q_tile.clone() {
                        let visible = segment.key_span(i);
                        let lo = visible.start.max(k_tile.start);
                        let hi = visible.end.min(k_tile.end);
                        if lo >= hi {
                            continue;
                        }
                        let row = segment.q_start + i;
                        let q_row = q.row(row, head);
                        let tile_scores = &mut scores[..hi - lo];
                        let mut tile_max = f32::NEG_INFINITY;
                        for (slot, j) in tile_scores.iter_mut().zip(lo..hi) {
                            *slot = plan.scale * dot(q_row, k.row(segment.k_start + j, unit.kv_head));
                            tile_max = tile_max.max(*slot);
                        }

                        let prev_max = state.max[row];
                        let new_max = prev_max.max(tile_max);
                        let correction = (prev_max - new_max).exp();
                        let acc = &mut state.acc[row * dim..(row + 1) * dim];
                        if correction != 1.0 {
                            acc.iter_mut().for_each(|a| *a *= correction);
                        }
                        let mut sum = state.sum[row] * correction;
                        for (&s, j) in tile_scores.iter().zip(lo..hi) {
                            let p = (s - new_max).exp();
                            sum += p;
                            let v_row = v.row(segment.k_start + j, unit.kv_head);
                            for (a, &value) in acc.iter_mut().zip(v_row) {
                                *a += p * value;
                            }
                        }
                        state.sum[row] = sum;
                        state.max[row] = new_max;
                    }
                }
            }
        }
    }
    states
}
