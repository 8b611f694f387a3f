//! Output persistence.
//!
//! Fetch results go to one timestamped file each through a [`ResultSink`];
//! projected records are appended to JSON array files.

mod append;
mod file;
mod memory;
mod traits;

pub use append::*;
pub use file::*;
pub use memory::*;
pub use traits::*;
