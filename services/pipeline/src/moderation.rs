//! Moderation decisions.
//!
//! Both classifiers reduce annotator output to a set of ratings on the
//! [`Likelihood`] scale and quarantine when any rating reaches
//! [`QUARANTINE_THRESHOLD`](crate::likelihood::QUARANTINE_THRESHOLD).

use crate::annotation::SafeSearchAnnotation;
use crate::likelihood::Likelihood;

/// Aggregate verdict over every frame of a video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameAggregate {
    /// Highest rating seen on any frame, UNKNOWN when there were none
    pub adult: Likelihood,
    pub quarantine: bool,
}

/// Reduce per-frame pornography ratings to one verdict.
///
/// The quarantine flag latches on the first frame at or above the threshold,
/// independently of the running maximum.
pub fn aggregate_frames<I>(frames: I) -> FrameAggregate
where
    I: IntoIterator<Item = Likelihood>,
{
    frames
        .into_iter()
        .fold(FrameAggregate::default(), |aggregate, frame| FrameAggregate {
            adult: aggregate.adult.max(frame),
            quarantine: aggregate.quarantine || frame.is_flagged(),
        })
}

/// Whether any of an image's four ratings requires quarantine
pub fn image_requires_quarantine(safe_search: &SafeSearchAnnotation) -> bool {
    safe_search
        .ratings()
        .iter()
        .any(|(_, likelihood)| likelihood.is_flagged())
}
