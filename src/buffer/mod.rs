pub mod claim;
pub mod inventory;
pub mod pool;

pub use claim::{ClaimMode, Session};
pub use pool::{BufferPool, PageGuard};
