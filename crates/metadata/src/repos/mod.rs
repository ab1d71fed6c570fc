//! Repository traits for metadata operations.

pub mod blocks;
pub mod containers;

pub use blocks::BlockRepo;
pub use containers::ContainerRepo;
