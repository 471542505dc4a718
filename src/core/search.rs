//! Two-nearest-neighbour lookup over one reference descriptor set.
//!
//! Brute force is exact. The approximate backend builds an HNSW graph per
//! reference set and falls back to a linear scan for sets too small for the
//! graph to pay off.

use crate::core::algorithm::{DescriptorMetric, SearchStrategy};
use crate::core::descriptor::{DescriptorError, DescriptorSet};
use hnsw_rs::prelude::*;
use std::sync::Arc;

/// Reference sets below this many rows are always scanned linearly.
const MIN_ANN_ROWS: usize = 64;
const HNSW_MAX_CONNECTIONS: usize = 16;
const HNSW_EF_CONSTRUCTION: usize = 200;
const HNSW_EF_SEARCH: usize = 50;

pub trait NeighborSearch: Send + Sync {
    /// Distances to the (up to) two closest reference rows, ascending.
    fn two_nearest(&self, query: &[f32]) -> Result<Vec<f32>, DescriptorError>;
}

pub fn distance(metric: DescriptorMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DescriptorMetric::L1 => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        DescriptorMetric::L2 => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    }
}

pub struct BruteForceSearch {
    reference: Arc<DescriptorSet>,
    metric: DescriptorMetric,
}

impl BruteForceSearch {
    pub fn new(reference: Arc<DescriptorSet>, metric: DescriptorMetric) -> Self {
        Self { reference, metric }
    }
}

impl NeighborSearch for BruteForceSearch {
    fn two_nearest(&self, query: &[f32]) -> Result<Vec<f32>, DescriptorError> {
        check_dims(self.reference.dims(), query)?;

        let mut first = f32::INFINITY;
        let mut second = f32::INFINITY;
        let mut seen = 0usize;
        for row in self.reference.rows() {
            let d = distance(self.metric, query, row);
            if d.is_nan() {
                return Err(DescriptorError::NonFiniteDistance);
            }
            if d < first {
                second = first;
                first = d;
            } else if d < second {
                second = d;
            }
            seen += 1;
        }

        Ok([first, second].into_iter().take(seen.min(2)).collect())
    }
}

/// HNSW-backed search. Construction cost is paid once per reference set.
pub struct ApproximateSearch<D>
where
    D: Distance<f32> + Send + Sync + 'static,
{
    dims: usize,
    index: Option<Hnsw<'static, f32, D>>,
    fallback: BruteForceSearch,
}

impl<D> ApproximateSearch<D>
where
    D: Distance<f32> + Send + Sync + 'static,
{
    pub fn new(reference: Arc<DescriptorSet>, metric: DescriptorMetric, dist: D) -> Self {
        let dims = reference.dims();
        let rows = reference.len();

        let index = if rows >= MIN_ANN_ROWS {
            let nb_layer = 16.min((rows as f32).ln().trunc() as usize).max(1);
            let hnsw = Hnsw::<f32, D>::new(HNSW_MAX_CONNECTIONS, rows, nb_layer, HNSW_EF_CONSTRUCTION, dist);
            let vectors: Vec<Vec<f32>> = reference.rows().map(<[f32]>::to_vec).collect();
            let data_for_insertion: Vec<(&Vec<f32>, usize)> =
                vectors.iter().enumerate().map(|(idx, v)| (v, idx)).collect();
            hnsw.parallel_insert(&data_for_insertion);
            Some(hnsw)
        } else {
            None
        };

        Self {
            dims,
            index,
            fallback: BruteForceSearch::new(reference, metric),
        }
    }
}

impl<D> NeighborSearch for ApproximateSearch<D>
where
    D: Distance<f32> + Send + Sync + 'static,
{
    fn two_nearest(&self, query: &[f32]) -> Result<Vec<f32>, DescriptorError> {
        let Some(hnsw) = &self.index else {
            return self.fallback.two_nearest(query);
        };
        check_dims(self.dims, query)?;

        let mut distances: Vec<f32> = hnsw
            .search(query, 2, HNSW_EF_SEARCH)
            .into_iter()
            .map(|n| n.distance)
            .collect();
        if distances.iter().any(|d| d.is_nan()) {
            return Err(DescriptorError::NonFiniteDistance);
        }
        distances.sort_by(f32::total_cmp);
        distances.truncate(2);
        Ok(distances)
    }
}

fn check_dims(expected: usize, query: &[f32]) -> Result<(), DescriptorError> {
    if query.len() != expected {
        return Err(DescriptorError::DimensionMismatch {
            expected,
            got: query.len(),
        });
    }
    Ok(())
}

/// Search structure for one reference set under the chosen strategy.
pub fn build_search(
    reference: Arc<DescriptorSet>,
    metric: DescriptorMetric,
    strategy: SearchStrategy,
) -> Box<dyn NeighborSearch> {
    match (strategy, metric) {
        (SearchStrategy::BruteForce, _) => Box::new(BruteForceSearch::new(reference, metric)),
        (SearchStrategy::Approximate, DescriptorMetric::L2) => {
            Box::new(ApproximateSearch::new(reference, metric, DistL2 {}))
        }
        (SearchStrategy::Approximate, DescriptorMetric::L1) => {
            Box::new(ApproximateSearch::new(reference, metric, DistL1 {}))
        }
    }
}
