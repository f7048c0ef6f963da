//! Task distribution
//!
//! Fans one task out to one, several or all eligible pools and aggregates
//! the per-target outcomes under a `first_success`, `all` or `reduce` mode.

mod distributor;
pub mod functions;
mod strategy;

pub use distributor::{DistributionReport, DistributorConfig, TaskDistributor};
pub use functions::{
    ChunksSplitter, CollectReducer, ConcatReducer, FunctionRegistry, ItemsSplitter, SumReducer,
    TaskReducer, TaskSplitter,
};
pub use strategy::{AggregationMode, Assignment, DistributionPlan, DistributionStrategy};
