pub mod disk_manager;
pub mod memory;
pub mod tablespace;

pub use disk_manager::FileTablespace;
pub use memory::{MemoryTablespace, WriteEvent};
pub use tablespace::{Tablespace, TablespaceError, WriteKind};
