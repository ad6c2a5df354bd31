pub mod backend;
pub mod context;
pub mod state;

pub use backend::{MemoryStateBackend, StateBackend};
pub use context::SessionContext;
pub use state::{BudgetRecord, FrequencyRecord, SessionState};

#[cfg(feature = "redis")]
pub use backend::RedisStateBackend;
