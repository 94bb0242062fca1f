//! Priority bands.
//!
//! Bands are ordered from `Top` down to `Lowest`. The order drives two things:
//! the drainer serves higher bands first, and shared quota may only be borrowed
//! from the bucket's own band or bands below it.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of priority bands, including `Lowest`.
pub const BAND_COUNT: usize = 6;

/// A priority band a bucket belongs to.
///
/// `Lowest` is not configurable; it exists for the built-in catch-all bucket
/// that absorbs unmatched traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PriorityBand {
    Top,
    High,
    Medium,
    Normal,
    Low,
    Lowest,
}

impl PriorityBand {
    /// Every band, highest priority first.
    pub const ALL: [PriorityBand; BAND_COUNT] = [
        PriorityBand::Top,
        PriorityBand::High,
        PriorityBand::Medium,
        PriorityBand::Normal,
        PriorityBand::Low,
        PriorityBand::Lowest,
    ];

    /// Position in [`PriorityBand::ALL`]; `0` is the highest priority.
    pub fn rank(self) -> usize {
        match self {
            PriorityBand::Top => 0,
            PriorityBand::High => 1,
            PriorityBand::Medium => 2,
            PriorityBand::Normal => 3,
            PriorityBand::Low => 4,
            PriorityBand::Lowest => 5,
        }
    }

    /// Bands whose shared pool a bucket in `self` may draw from, in the order
    /// they are tried: its own band first, then each strictly lower band.
    pub fn borrow_order(self) -> &'static [PriorityBand] {
        &Self::ALL[self.rank()..]
    }

    /// True if `self` is served before `other`.
    pub fn outranks(self, other: PriorityBand) -> bool {
        self.rank() < other.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityBand::Top => "Top",
            PriorityBand::High => "High",
            PriorityBand::Medium => "Medium",
            PriorityBand::Normal => "Normal",
            PriorityBand::Low => "Low",
            PriorityBand::Lowest => "Lowest",
        }
    }
}

impl fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses the configurable bands. `Lowest` is rejected because it is reserved
/// for the catch-all bucket.
impl FromStr for PriorityBand {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Top" => Ok(PriorityBand::Top),
            "High" => Ok(PriorityBand::High),
            "Medium" => Ok(PriorityBand::Medium),
            "Normal" => Ok(PriorityBand::Normal),
            "Low" => Ok(PriorityBand::Low),
            other => Err(ConfigError::UnknownPriority(other.to_string())),
        }
    }
}

/// Decodes any band, `Lowest` included, so that serialized catch-all buckets
/// read back. Whether a bucket may use `Lowest` is checked by the bucket decoder.
impl TryFrom<String> for PriorityBand {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "Lowest" => Ok(PriorityBand::Lowest),
            other => other.parse(),
        }
    }
}

impl From<PriorityBand> for String {
    fn from(band: PriorityBand) -> Self {
        band.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_sorted_by_rank() {
        for (i, band) in PriorityBand::ALL.iter().enumerate() {
            assert_eq!(band.rank(), i);
        }
    }

    #[test]
    fn borrow_order_starts_at_own_band_and_only_goes_down() {
        assert_eq!(PriorityBand::Top.borrow_order(), &PriorityBand::ALL[..]);
        assert_eq!(
            PriorityBand::Low.borrow_order(),
            &[PriorityBand::Low, PriorityBand::Lowest]
        );
        assert_eq!(PriorityBand::Lowest.borrow_order(), &[PriorityBand::Lowest]);

        for band in PriorityBand::ALL {
            for lender in band.borrow_order() {
                assert!(!lender.outranks(band), "{band} must not borrow from {lender}");
            }
        }
    }

    #[test]
    fn lowest_is_not_configurable() {
        assert_eq!("High".parse::<PriorityBand>().unwrap(), PriorityBand::High);
        assert!(matches!(
            "Lowest".parse::<PriorityBand>(),
            Err(ConfigError::UnknownPriority(name)) if name == "Lowest"
        ));
        assert!("top".parse::<PriorityBand>().is_err());
    }

    #[test]
    fn every_band_survives_serde() {
        for band in PriorityBand::ALL {
            let encoded = serde_json::to_string(&band).unwrap();
            let decoded: PriorityBand = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, band);
        }
        assert!(serde_json::from_str::<PriorityBand>(r#""lowest""#).is_err());
    }
}
