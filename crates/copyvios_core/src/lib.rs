pub mod checker;
pub mod config;
pub mod error;
pub mod exclusions;
pub mod fetch;
pub mod markov;
pub mod mediawiki;
pub mod parsers;
pub mod result;
pub mod runtime;
pub mod search;
pub mod workspace;

pub use checker::{CheckOptions, CompareOptions, CopyvioChecker};
pub use result::{CopyvioCheckResult, SourceSummary};
pub use workspace::{globalize, is_globalized, localize};
