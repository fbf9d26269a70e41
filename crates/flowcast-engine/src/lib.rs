pub mod credits;
pub mod dispatch;
pub mod engine;
pub mod graph;
pub mod history;
pub mod persist;
pub mod project_store;

pub use credits::CreditLedger;
pub use dispatch::{DispatchInput, Dispatcher, NodeOutcome, Progress};
pub use engine::{Engine, NodeProgress, RunOptions};
pub use graph::{GraphStore, UpstreamContext, UpstreamImage};
pub use history::HistoryStack;
pub use persist::Persister;
pub use project_store::{SqliteProjectStore, StoredSnapshot};
