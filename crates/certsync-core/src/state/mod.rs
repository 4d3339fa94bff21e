// # State Store Implementations
//
// Implementations of the LifecycleStore trait for different persistence
// strategies, plus the snapshot file helper they share with the agent.

pub mod file;
pub mod json_file;
pub mod memory;

pub use file::FileLifecycleStore;
pub use json_file::JsonSnapshotFile;
pub use memory::MemoryLifecycleStore;
