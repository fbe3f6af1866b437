pub mod garbage;
pub mod volume;

pub use volume::{Volume, VolumeHeader};
