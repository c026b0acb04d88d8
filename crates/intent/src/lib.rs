//! Intent classification and routing for MuseStudio chat
//!
//! Pure logic, no I/O: `classifier` maps free text to a generation intent,
//! `routing` maps that intent plus conversation context to a UI action.

pub mod classifier;
pub mod routing;

pub use classifier::{Classifier, AMBIGUOUS_CONFIDENCE, EXACT_CONFIDENCE};
pub use routing::{decide, RoutingContext, CONFIRMATION_THRESHOLD};
