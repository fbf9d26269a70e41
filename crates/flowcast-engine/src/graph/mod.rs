//! Graph model: the store that owns nodes and links, the scheduler that
//! orders them, and the aggregator that gathers each node's upstream inputs.
//!
//! Every other component reads from a `GraphStore` and commits results back
//! through it; none keeps a long-lived mutable alias into the graph.

pub mod context;
pub mod scheduler;
pub mod store;

pub use context::{collect, UpstreamContext, UpstreamImage};
pub use scheduler::{ancestors, order};
pub use store::GraphStore;
