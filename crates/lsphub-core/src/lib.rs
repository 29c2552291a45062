pub mod config;
pub mod error;
pub mod pathmap;
pub mod uri;

pub use error::Error;
pub use pathmap::{PathMapper, is_within_allowed_directory, is_windows_abs_path};
