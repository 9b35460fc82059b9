//! Tag propagation from ways onto their nodes.
//!
//! A [`RuleTable`] decides which way tags are copied onto which nodes. The
//! [`PropagationEngine`] turns the matching rules into spans over the way's
//! node list, allocating synthetic nodes where a span falls between two
//! nodes, and the [`PropagationIndex`] keeps every span for the rest of the
//! run.

mod engine;
mod index;
mod rules;

pub use engine::{PropagatedSpan, PropagatedWay, PropagationEngine, PropagationError};
pub use index::PropagationIndex;
pub use rules::{Placement, Predicate, PropagateRule, RuleTable, RuleTableError};
