pub mod calendar;
pub mod observation;

pub use calendar::*;
pub use observation::*;
