pub mod ops;
pub mod tree;

pub use ops::{CursorPos, Direction};
pub use tree::Tree;
