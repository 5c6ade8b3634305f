pub mod aggregator;
pub mod controller;
pub mod features;
pub mod history;
pub mod persist;

pub use aggregator::*;
pub use controller::*;
pub use features::*;
pub use history::*;
pub use persist::Persistence;
