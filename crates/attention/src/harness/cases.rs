//! Parameter grids swept by the suites.

use std::fmt;
use std::str::FromStr;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use super::config::HarnessConfig;

/// Query heads in every generated case.
pub const NUM_HEADS: usize = 6;
pub const DENSE_BATCH: usize = 4;
pub const VARLEN_BATCH: usize = 9;

pub const DENSE_SEQLENS: [(usize, usize); 17] = [
    (1, 1),
    (64, 128),
    (128, 128),
    (256, 256),
    (113, 203),
    (128, 217),
    (113, 211),
    (108, 256),
    (256, 512),
    (384, 256),
    (640, 128),
    (512, 256),
    (1024, 1024),
    (1023, 1024),
    (1024, 1023),
    (4096, 4096),
    (4224, 4224),
];

pub const VARLEN_SEQLENS: [(usize, usize); 19] = [
    (1, 1),
    (1, 3),
    (2, 1),
    (511, 1),
    (3, 513),
    (64, 128),
    (113, 203),
    (128, 128),
    (128, 217),
    (113, 211),
    (108, 256),
    (256, 512),
    (384, 256),
    (512, 256),
    (640, 128),
    (1024, 1024),
    (1023, 1024),
    (1024, 1023),
    (2048, 2048),
];

pub const FLEX_SEQLENS_Q: [usize; 5] = [8, 256, 551, 1234, 1999];
pub const FLEX_SEQLENS_K: [usize; 4] = [8, 256, 551, 1234];
pub const FLEX_BATCH_SIZES: [usize; 2] = [1, 2];

pub const DENSE_HEAD_DIMS: [usize; 3] = [64, 128, 256];
pub const PACKED_HEAD_DIMS: [usize; 2] = [64, 128];
pub const FP8_DESCALES: [f32; 3] = [1.0, 2.0, 3.0];

/// Gradients are only validated up to this head dimension.
pub const MAX_GRAD_HEAD_DIM: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suite {
    Dense,
    Fp8,
    Varlen,
    Flex,
}

impl Suite {
    pub const ALL: [Suite; 4] = [Suite::Dense, Suite::Fp8, Suite::Varlen, Suite::Flex];

    pub fn name(self) -> &'static str {
        match self {
            Suite::Dense => "dense",
            Suite::Fp8 => "fp8",
            Suite::Varlen => "varlen",
            Suite::Flex => "flex",
        }
    }

    /// Seed each case of the suite starts from unless the config overrides it.
    pub fn default_seed(self) -> u64 {
        match self {
            Suite::Varlen => 0,
            Suite::Dense | Suite::Fp8 | Suite::Flex => 42,
        }
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Suite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Suite::ALL
            .into_iter()
            .find(|suite| suite.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown suite '{s}', expected dense, fp8, varlen or flex"))
    }
}

/// Head layout: all, a third, or one key/value head for six query heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MhaType {
    Mha,
    Mqa,
    Gqa,
}

impl MhaType {
    pub const ALL: [MhaType; 3] = [MhaType::Mha, MhaType::Mqa, MhaType::Gqa];

    pub fn kv_heads(self) -> usize {
        match self {
            MhaType::Mha => NUM_HEADS,
            MhaType::Gqa => 2,
            MhaType::Mqa => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            MhaType::Mha => "mha",
            MhaType::Mqa => "mqa",
            MhaType::Gqa => "gqa",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    F32,
    F16,
    Bf16,
}

impl ElementType {
    pub const HALF: [ElementType; 2] = [ElementType::F16, ElementType::Bf16];

    pub fn dtype(self) -> DType {
        match self {
            ElementType::F32 => DType::F32,
            ElementType::F16 => DType::F16,
            ElementType::Bf16 => DType::BF16,
        }
    }

    /// Machine epsilon of the element type.
    pub fn epsilon(self) -> f32 {
        match self {
            ElementType::F32 => f32::EPSILON,
            ElementType::F16 => 0.000_976_562_5,
            ElementType::Bf16 => 0.007_812_5,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F16 => "f16",
            ElementType::Bf16 => "bf16",
        }
    }
}

/// Bytes held by the f64 reference for one case: scores, probabilities and
/// their gradients.
fn reference_bytes(batch: usize, seqlen_q: usize, seqlen_k: usize) -> u64 {
    const LIVE_SCORE_BUFFERS: u64 = 4;
    (batch * NUM_HEADS * seqlen_q * seqlen_k) as u64 * 8 * LIVE_SCORE_BUFFERS
}

fn flags(pairs: &[(bool, &str)]) -> String {
    pairs
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, name)| format!(" {name}"))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DenseCase {
    pub dtype: ElementType,
    pub mha: MhaType,
    pub causal: bool,
    pub local: bool,
    pub deterministic: bool,
    pub gqa_parallel: bool,
    pub head_dim: usize,
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub batch: usize,
}

impl DenseCase {
    pub fn label(&self) -> String {
        format!(
            "{} {}{} d={} sq={} sk={}",
            self.dtype.name(),
            self.mha.name(),
            flags(&[
                (self.causal, "causal"),
                (self.local, "local"),
                (self.deterministic, "det"),
                (self.gqa_parallel, "gqa_par"),
            ]),
            self.head_dim,
            self.seqlen_q,
            self.seqlen_k
        )
    }

    pub fn reference_bytes(&self) -> u64 {
        reference_bytes(self.batch, self.seqlen_q, self.seqlen_k)
    }

    pub fn checks_gradients(&self) -> bool {
        self.head_dim <= MAX_GRAD_HEAD_DIM
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fp8Case {
    pub mha: MhaType,
    pub causal: bool,
    pub local: bool,
    pub gqa_parallel: bool,
    pub head_dim: usize,
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub descale: f32,
    pub batch: usize,
}

impl Fp8Case {
    pub fn label(&self) -> String {
        format!(
            "e4m3 {}{} d={} descale={} sq={} sk={}",
            self.mha.name(),
            flags(&[
                (self.causal, "causal"),
                (self.local, "local"),
                (self.gqa_parallel, "gqa_par"),
            ]),
            self.head_dim,
            self.descale,
            self.seqlen_q,
            self.seqlen_k
        )
    }

    pub fn reference_bytes(&self) -> u64 {
        reference_bytes(self.batch, self.seqlen_q, self.seqlen_k)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarlenCase {
    pub dtype: ElementType,
    pub mha: MhaType,
    pub causal: bool,
    pub local: bool,
    pub deterministic: bool,
    pub add_unused: bool,
    pub head_dim: usize,
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub batch: usize,
}

impl VarlenCase {
    pub fn label(&self) -> String {
        format!(
            "{} {}{} d={} sq={} sk={}",
            self.dtype.name(),
            self.mha.name(),
            flags(&[
                (self.causal, "causal"),
                (self.local, "local"),
                (self.deterministic, "det"),
                (self.add_unused, "unused"),
            ]),
            self.head_dim,
            self.seqlen_q,
            self.seqlen_k
        )
    }

    pub fn reference_bytes(&self) -> u64 {
        reference_bytes(self.batch, self.seqlen_q, self.seqlen_k)
    }

    pub fn checks_gradients(&self) -> bool {
        self.head_dim <= MAX_GRAD_HEAD_DIM
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlexCase {
    pub dtype: ElementType,
    pub mha: MhaType,
    pub head_dim: usize,
    /// Per-sequence lengths; the packed buffers hold `bsz` times as many rows.
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub bsz: usize,
}

impl FlexCase {
    pub fn label(&self) -> String {
        format!(
            "{} {} d={} sq={} sk={} bsz={}",
            self.dtype.name(),
            self.mha.name(),
            self.head_dim,
            self.seqlen_q,
            self.seqlen_k,
            self.bsz
        )
    }

    pub fn total_q(&self) -> usize {
        self.seqlen_q * self.bsz
    }

    pub fn total_k(&self) -> usize {
        self.seqlen_k * self.bsz
    }

    pub fn reference_bytes(&self) -> u64 {
        reference_bytes(1, self.total_q(), self.total_k())
    }

    pub fn checks_kv_gradients(&self) -> bool {
        self.head_dim <= MAX_GRAD_HEAD_DIM
    }
}

/// Grid restrictions taken from [`HarnessConfig`].
struct Filter<'a> {
    config: &'a HarnessConfig,
}

impl Filter<'_> {
    fn seqlens(&self, pairs: &[(usize, usize)]) -> Vec<(usize, usize)> {
        pairs
            .iter()
            .copied()
            .filter(|&(q, k)| self.config.max_seqlen.map_or(true, |max| q.max(k) <= max))
            .collect()
    }

    fn head_dims(&self, dims: &[usize]) -> Vec<usize> {
        dims.iter()
            .copied()
            .filter(|d| {
                self.config
                    .head_dims
                    .as_ref()
                    .map_or(true, |allowed| allowed.contains(d))
            })
            .collect()
    }

    fn deterministic(&self) -> Vec<bool> {
        match self.config.deterministic {
            Some(only) => vec![only],
            None => BOOLS.to_vec(),
        }
    }

    fn dtypes(&self) -> Vec<ElementType> {
        match &self.config.dtypes {
            Some(dtypes) => dtypes.clone(),
            None => ElementType::HALF.to_vec(),
        }
    }
}

const BOOLS: [bool; 2] = [false, true];

pub fn dense_cases(config: &HarnessConfig) -> Vec<DenseCase> {
    let filter = Filter { config };
    let seqlens = filter.seqlens(&DENSE_SEQLENS);
    let mut cases = Vec::new();
    for &(seqlen_q, seqlen_k) in &seqlens {
        for head_dim in filter.head_dims(&DENSE_HEAD_DIMS) {
            for gqa_parallel in BOOLS {
                for deterministic in filter.deterministic() {
                    for local in BOOLS {
                        for causal in BOOLS {
                            for mha in MhaType::ALL {
                                for dtype in filter.dtypes() {
                                    cases.push(DenseCase {
                                        dtype,
                                        mha,
                                        causal,
                                        local,
                                        deterministic,
                                        gqa_parallel,
                                        head_dim,
                                        seqlen_q,
                                        seqlen_k,
                                        batch: DENSE_BATCH,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    cases
}

pub fn fp8_cases(config: &HarnessConfig) -> Vec<Fp8Case> {
    let filter = Filter { config };
    let seqlens = filter.seqlens(&DENSE_SEQLENS);
    let mut cases = Vec::new();
    for &(seqlen_q, seqlen_k) in &seqlens {
        for descale in FP8_DESCALES {
            for head_dim in filter.head_dims(&DENSE_HEAD_DIMS) {
                for gqa_parallel in BOOLS {
                    for local in BOOLS {
                        for causal in BOOLS {
                            for mha in MhaType::ALL {
                                cases.push(Fp8Case {
                                    mha,
                                    causal,
                                    local,
                                    gqa_parallel,
                                    head_dim,
                                    seqlen_q,
                                    seqlen_k,
                                    descale,
                                    batch: DENSE_BATCH,
                                });
                            }
                        }
                    }
                }
            }
        }
    }
    cases
}

pub fn varlen_cases(config: &HarnessConfig) -> Vec<VarlenCase> {
    let filter = Filter { config };
    let seqlens = filter.seqlens(&VARLEN_SEQLENS);
    let mut cases = Vec::new();
    for &(seqlen_q, seqlen_k) in &seqlens {
        for head_dim in filter.head_dims(&PACKED_HEAD_DIMS) {
            for add_unused in BOOLS {
                for deterministic in filter.deterministic() {
                    for local in BOOLS {
                        for causal in BOOLS {
                            for mha in MhaType::ALL {
                                for dtype in filter.dtypes() {
                                    cases.push(VarlenCase {
                                        dtype,
                                        mha,
                                        causal,
                                        local,
                                        deterministic,
                                        add_unused,
                                        head_dim,
                                        seqlen_q,
                                        seqlen_k,
                                        batch: VARLEN_BATCH,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    cases
}

pub fn flex_cases(config: &HarnessConfig) -> Vec<FlexCase> {
    let filter = Filter { config };
    let pairs: Vec<(usize, usize)> = FLEX_SEQLENS_Q
        .iter()
        .flat_map(|&q| FLEX_SEQLENS_K.iter().map(move |&k| (q, k)))
        .collect();
    let mut cases = Vec::new();
    for bsz in FLEX_BATCH_SIZES {
        for &(seqlen_q, seqlen_k) in &filter.seqlens(&pairs) {
            for head_dim in filter.head_dims(&PACKED_HEAD_DIMS) {
                for dtype in filter.dtypes() {
                    for mha in MhaType::ALL {
                        cases.push(FlexCase {
                            dtype,
                            mha,
                            head_dim,
                            seqlen_q,
                            seqlen_k,
                            bsz,
                        });
                    }
                }
            }
        }
    }
    cases
}
