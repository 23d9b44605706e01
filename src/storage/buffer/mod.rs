//! Page cache: a fixed pool of frames, LRU replacement, write ordering
//! between dirty pages, and background flushing.

pub mod error;
mod flusher;
mod frame;
mod guard;
pub mod manager;
pub mod precedence;
mod replacer;

pub use error::BufferPoolError;
pub use flusher::CheckpointWaiter;
pub use frame::FrameInfo;
pub use guard::PageGuard;
pub use manager::{BufferCache, CacheStats};
pub use precedence::{PrecedenceError, PrecedenceGraph};
