pub mod integrity;
pub mod read_only;

pub use integrity::*;
pub use read_only::*;
