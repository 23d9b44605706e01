pub mod error;
pub mod header;
pub mod layout;

pub use error::PageError;
pub use header::{PageHeader, PageType};
