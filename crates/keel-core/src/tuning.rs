//! Index parameter tuning for ivfflat and hnsw collections.
//!
//! Derives build parameters (ivf `lists`, graph `m`/`ef_construction`) from the
//! corpus size, and search breadth (ivf `probes`, graph `ef_search`) from the
//! recall target and corpus size.
//!
//! Reference: Malkov & Yashunin "HNSW"; pgvector ivfflat guidance
//! (lists = rows / 1000 up to 1M rows, sqrt(rows) beyond).

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::{IndexConfig, IndexType};

/// pgvector's upper bound on ivfflat lists.
const IVF_MAX_LISTS: i32 = 32_768;

/// Recall target levels for approximate search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallTarget {
    /// Fast search with moderate recall (~85%)
    Fast,
    /// Balanced recall/latency (~92%)
    #[default]
    Balanced,
    /// High recall (~96%)
    High,
    /// Exhaustive search for maximum recall (~99%)
    Exhaustive,
}

impl RecallTarget {
    /// Returns the base ef_search value for this recall target.
    pub fn base_ef(&self) -> i32 {
        match self {
            RecallTarget::Fast => 20,
            RecallTarget::Balanced => 40,
            RecallTarget::High => 100,
            RecallTarget::Exhaustive => 200,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecallTarget::Fast => "fast",
            RecallTarget::Balanced => "balanced",
            RecallTarget::High => "high",
            RecallTarget::Exhaustive => "exhaustive",
        }
    }
}

impl FromStr for RecallTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fast" => Ok(RecallTarget::Fast),
            "balanced" => Ok(RecallTarget::Balanced),
            "high" => Ok(RecallTarget::High),
            "exhaustive" => Ok(RecallTarget::Exhaustive),
            other => Err(Error::InvalidInput(format!("unknown recall target: {}", other))),
        }
    }
}

/// Configuration for index tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Scaling factor for corpus size adjustment of ef_search
    pub corpus_scale_factor: f32,
    /// Minimum ef_search value
    pub min_ef: i32,
    /// Maximum ef_search value (pgvector caps hnsw.ef_search at 1000)
    pub max_ef: i32,
    /// Graph degree for new hnsw indexes
    pub graph_m: i32,
    /// Build breadth for new hnsw indexes
    pub graph_ef_construction: i32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            corpus_scale_factor: 1.0,
            min_ef: 10,
            max_ef: 500,
            graph_m: defaults::GRAPH_M,
            graph_ef_construction: defaults::GRAPH_EF_CONSTRUCTION,
        }
    }
}

/// Number of ivf lists for a corpus of `rows` vectors.
///
/// rows / 1000 up to one million rows, sqrt(rows) beyond, never below 1.
pub fn ivf_lists(rows: i64) -> i32 {
    let lists = if rows <= defaults::IVF_LARGE_CORPUS_ROWS {
        rows / defaults::IVF_ROWS_PER_LIST
    } else {
        (rows as f64).sqrt().round() as i64
    };
    lists.clamp(1, IVF_MAX_LISTS as i64) as i32
}

/// Lists probed per query for the given recall target.
///
/// Starts at sqrt(lists) for `Fast`, doubling per level; `Exhaustive` probes
/// every list. Always within 1..=lists.
pub fn ivf_probes(lists: i32, target: RecallTarget) -> i32 {
    let lists = lists.max(1);
    let base = (lists as f64).sqrt().ceil() as i32;
    let probes = match target {
        RecallTarget::Fast => base,
        RecallTarget::Balanced => base.saturating_mul(2),
        RecallTarget::High => base.saturating_mul(4),
        RecallTarget::Exhaustive => lists,
    };
    probes.clamp(1, lists)
}

/// Computes hnsw ef_search based on recall target and corpus size.
///
/// # Algorithm
/// ef = base_ef * max(1.0, 1 + log2(corpus_size / 10000) * scale_factor)
/// Result is clamped to [min_ef, max_ef]
pub fn compute_ef(target: RecallTarget, corpus_size: i64, config: &TuningConfig) -> i32 {
    let base = target.base_ef() as f32;

    let size_ratio = corpus_size as f32 / 10000.0;
    let scale = if size_ratio > 1.0 {
        size_ratio.log2() * config.corpus_scale_factor
    } else {
        0.0
    };

    let ef = base * (1.0 + scale).max(1.0);
    let ef = ef.round() as i32;

    ef.clamp(config.min_ef, config.max_ef)
}

/// Derive a full index configuration for `index_type` over `rows` vectors.
///
/// Graph `m`/`ef_construction` already set in `current` are preserved, since
/// they describe how the existing graph was built.
pub fn derive_index_config(
    index_type: IndexType,
    rows: i64,
    target: RecallTarget,
    current: &IndexConfig,
    config: &TuningConfig,
) -> IndexConfig {
    match index_type {
        IndexType::Ivf => {
            let lists = ivf_lists(rows);
            IndexConfig {
                lists: Some(lists),
                probes: Some(ivf_probes(lists, target)),
                recall_target: target,
                ..Default::default()
            }
        }
        IndexType::Graph => IndexConfig {
            m: Some(current.m.unwrap_or(config.graph_m)),
            ef_construction: Some(current.ef_construction.unwrap_or(config.graph_ef_construction)),
            ef_search: Some(compute_ef(target, rows, config)),
            recall_target: target,
            ..Default::default()
        },
        IndexType::Exact | IndexType::None => IndexConfig {
            recall_target: target,
            ..Default::default()
        },
    }
}

/// Estimates graph recall rate for a given ef_search value.
///
/// # Formula
/// recall ≈ 1.0 - 1.0 / (1.0 + ef / 20.0)
///
/// This is a heuristic model based on empirical HNSW behavior.
pub fn estimated_recall(ef: i32) -> f32 {
    1.0 - 1.0 / (1.0 + (ef.max(0) as f32 / 20.0))
}

/// Estimates ivf recall when probing `probes` of `lists` lists.
///
/// Probing every list is an exact scan.
pub fn estimated_ivf_recall(probes: i32, lists: i32) -> f32 {
    if probes >= lists {
        return 1.0;
    }
    let relative = probes.max(1) as f32 / (lists.max(1) as f32).sqrt();
    1.0 - 1.0 / (1.0 + 2.0 * relative)
}

/// Estimated recall for a collection's configuration, `None` for exact scans.
pub fn estimated_recall_for(index_type: IndexType, config: &IndexConfig) -> Option<f32> {
    match index_type {
        IndexType::Ivf => Some(estimated_ivf_recall(
            config.probes.unwrap_or(1),
            config.lists.unwrap_or(1),
        )),
        IndexType::Graph => Some(estimated_recall(
            config.ef_search.unwrap_or(RecallTarget::default().base_ef()),
        )),
        IndexType::Exact | IndexType::None => None,
    }
}

/// Estimates graph search latency in milliseconds for given ef and corpus size.
///
/// # Formula
/// latency ≈ (ef / 40) * sqrt(corpus_size / 10000) * 4.0
pub fn estimated_latency_ms(ef: i32, corpus_size: i64) -> f32 {
    let ef_factor = ef as f32 / 40.0;
    let size_factor = (corpus_size as f32 / 10000.0).sqrt();
    ef_factor * size_factor * 4.0
}
