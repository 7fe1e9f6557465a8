//! Pre-execution cost estimation.

use super::config::{complexity_multiplier, CostTable};
use crate::backend::GenerationOperation;

/// Estimates what an operation will cost before it is sent.
///
/// `estimate = base_cost[kind] * multiplier[complexity] * max(1, input_size / 1000)`
#[derive(Debug, Clone, Default)]
pub struct CostEstimator {
    table: CostTable,
}

impl CostEstimator {
    pub fn new(table: CostTable) -> Self {
        Self { table }
    }

    pub fn estimate(&self, operation: &GenerationOperation) -> f64 {
        let size_factor = (operation.input_size as f64 / 1000.0).max(1.0);
        self.table.base_cost(operation.kind) * complexity_multiplier(operation.complexity) * size_factor
    }

    /// Sum of estimates for a batch of operations.
    pub fn estimate_all<'a, I>(&self, operations: I) -> f64
    where
        I: IntoIterator<Item = &'a GenerationOperation>,
    {
        operations.into_iter().map(|op| self.estimate(op)).sum()
    }

    pub fn table(&self) -> &CostTable {
        &self.table
    }
}
