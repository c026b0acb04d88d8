//! Token economy and access resolution for MuseStudio
//!
//! - `ledger`: pure accounting (grants, USD-to-token costs, monthly resets)
//! - `store`: the canonical profile store behind a trait seam
//! - `access`: cached, realtime-invalidated access resolution

pub mod access;
pub mod error;
pub mod ledger;
pub mod store;

pub use access::{AccessCache, AccessResolver, AccessSubscription, ChangeFeed, ProfileWatch};
pub use error::{TokenError, TokenResult};
pub use store::{
    deduct_for_completion, ensure_profile, DeductionOutcome, PgProfileStore, ProfileStore,
};
