pub mod hash;
pub mod catalog;
pub mod acquire;
pub mod encode;
pub mod batch;
#[cfg(feature = "facial-recognition")]
pub mod face;

/// Where a pipeline run currently is. Logged on every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Indexing,
    Acquiring,
    Encoding,
    Committing,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Indexing => "indexing",
            Stage::Acquiring => "acquiring",
            Stage::Encoding => "encoding",
            Stage::Committing => "committing",
            Stage::Done => "done",
        }
    }
}
