//! Project Management
//!
//! Handles loading, diffing and watching the configuration files of a
//! project directory.

mod loader;
mod node;
mod settings;
mod sync;
mod watcher;

pub use loader::*;
pub use node::*;
pub use settings::*;
pub use sync::*;
pub use watcher::*;
