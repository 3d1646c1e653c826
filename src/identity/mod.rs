pub mod cache;
pub mod resolver;

pub use cache::{IdentityCache, LinkOutcome};
pub use resolver::{synthetic_key, IdentityResolver, MatchKind, ResolveRequest, Resolution};
