mod merge;
mod model;

pub use merge::{MergeOutcome, merge, merge_outcome};
pub use model::{Collection, Episode, Podcast};
