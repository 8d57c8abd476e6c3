pub mod error;
pub mod indicators;
pub mod lifecycle;

pub use error::{Result, StateError};
pub use indicators::{IndicatorMap, IndicatorUpdate};
pub use lifecycle::{LifecycleState, Transition};
