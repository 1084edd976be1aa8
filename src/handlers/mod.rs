pub mod config;
pub mod system;

pub use config::*;
pub use system::*;
