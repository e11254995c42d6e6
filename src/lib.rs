pub mod cli;
pub mod engine;
pub mod stats;
pub mod utils;
pub mod workload;

pub use engine::Engine;
pub use utils::parse_duration_str;
