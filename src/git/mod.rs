pub mod executor;
pub mod shadow;

pub use executor::{GitExecutor, GitOutput};
pub use shadow::{CommitOutcome, ShadowBranchManager};
