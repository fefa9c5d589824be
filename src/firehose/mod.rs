pub mod source;
pub mod types;

pub use types::*;
