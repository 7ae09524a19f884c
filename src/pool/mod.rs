//! Shared worker and resource pools: the fixed thread pool driving
//! connection tasks, and the checkout pool guarding user-store handles.

mod users;
mod workers;

pub use users::{verify_user, ConnPool, MemoryStore, PooledConn, UserPool, UserStore};
pub use workers::ThreadPool;
