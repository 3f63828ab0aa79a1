pub mod schema;

pub use schema::{BindMount, IsolationConfig, ResourceLimits};
