mod drop_path;

pub use drop_path::{DropPath, DropPathConfig};
