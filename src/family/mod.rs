//! Family Member Coordinator
//!
//! Keeps the suppliers record of each customer this node supplies in step
//! with the other suppliers of the same customer:
//! - `merge` builds the next revision from the DHT record, the last
//!   committed revision and a pending request
//! - `review` asks the other suppliers to agree before a commit
//! - `contacts` answers reviews and position hints from peers
//! - `member` is the per-customer actor, `registry` owns the actors

pub mod contacts;
pub mod info;
pub mod member;
pub mod merge;
pub mod registry;
pub mod review;

pub use contacts::Verdict;
pub use info::{FamilyInfo, FamilyRequest, FamilyState};
pub use member::{
    FamilyConfig, FamilyError, FamilyMemberHandle, FamilySnapshot, TransitionRecord, Trigger,
    DHT_RECORD_REFRESH_INTERVAL,
};
pub use merge::MergeContext;
pub use registry::CustomerFamilies;
pub use review::{Outcome, ReviewResult, ReviewRound, REVIEW_TIMEOUT};
