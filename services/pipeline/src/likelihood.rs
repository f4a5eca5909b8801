//! Ordinal likelihood scale used by every moderation rating.
//!
//! Image annotations report one rating per [`LikelihoodCategory`]; video
//! annotations report a pornography rating per frame on the same six-point
//! scale. Annotation services disagree on the wire form (display names from
//! the REST surfaces, integer ranks from the gRPC-derived clients), so
//! [`Likelihood`] accepts both and always writes the display name.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Six-point ordered likelihood rating
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Likelihood {
    #[default]
    Unknown = 0,
    VeryUnlikely = 1,
    Unlikely = 2,
    Possible = 3,
    Likely = 4,
    VeryLikely = 5,
}

/// Ratings at or above this level send an object to quarantine.
pub const QUARANTINE_THRESHOLD: Likelihood = Likelihood::Possible;

const BY_RANK: [Likelihood; 6] = [
    Likelihood::Unknown,
    Likelihood::VeryUnlikely,
    Likelihood::Unlikely,
    Likelihood::Possible,
    Likelihood::Likely,
    Likelihood::VeryLikely,
];

impl Likelihood {
    /// Ordinal rank, 0 (UNKNOWN) through 5 (VERY_LIKELY)
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Look up a rating by ordinal rank
    pub fn from_rank(rank: u64) -> Option<Self> {
        usize::try_from(rank)
            .ok()
            .and_then(|index| BY_RANK.get(index))
            .copied()
    }

    /// Look up a rating by display name.
    ///
    /// `LIKELIHOOD_UNSPECIFIED` is the video API's spelling of UNKNOWN. It is
    /// normalized on purpose: downstream records only ever carry `UNKNOWN` for
    /// a frame the annotator did not rate, so the name does not round-trip.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "UNKNOWN" | "LIKELIHOOD_UNSPECIFIED" => Some(Likelihood::Unknown),
            "VERY_UNLIKELY" => Some(Likelihood::VeryUnlikely),
            "UNLIKELY" => Some(Likelihood::Unlikely),
            "POSSIBLE" => Some(Likelihood::Possible),
            "LIKELY" => Some(Likelihood::Likely),
            "VERY_LIKELY" => Some(Likelihood::VeryLikely),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Likelihood::Unknown => "UNKNOWN",
            Likelihood::VeryUnlikely => "VERY_UNLIKELY",
            Likelihood::Unlikely => "UNLIKELY",
            Likelihood::Possible => "POSSIBLE",
            Likelihood::Likely => "LIKELY",
            Likelihood::VeryLikely => "VERY_LIKELY",
        }
    }

    /// Whether this rating alone is enough to quarantine an object
    pub fn is_flagged(self) -> bool {
        self >= QUARANTINE_THRESHOLD
    }
}

impl fmt::Display for Likelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Likelihood {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

struct LikelihoodVisitor;

impl<'de> Visitor<'de> for LikelihoodVisitor {
    type Value = Likelihood;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a likelihood name such as \"POSSIBLE\" or a rank between 0 and 5")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Likelihood, E> {
        Likelihood::from_name(value)
            .ok_or_else(|| E::invalid_value(de::Unexpected::Str(value), &self))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Likelihood, E> {
        Likelihood::from_rank(value)
            .ok_or_else(|| E::invalid_value(de::Unexpected::Unsigned(value), &self))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Likelihood, E> {
        u64::try_from(value)
            .ok()
            .and_then(Likelihood::from_rank)
            .ok_or_else(|| E::invalid_value(de::Unexpected::Signed(value), &self))
    }
}

impl<'de> Deserialize<'de> for Likelihood {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(LikelihoodVisitor)
    }
}

/// Moderation category a rating applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LikelihoodCategory {
    Adult,
    Violence,
    Spoof,
    Medical,
}

impl LikelihoodCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            LikelihoodCategory::Adult => "adult",
            LikelihoodCategory::Violence => "violence",
            LikelihoodCategory::Spoof => "spoof",
            LikelihoodCategory::Medical => "medical",
        }
    }
}

impl fmt::Display for LikelihoodCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
