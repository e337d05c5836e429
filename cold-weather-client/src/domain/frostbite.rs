use std::fmt;

/// Time to frostbite on exposed skin, banded by wind chill (°C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrostbiteRisk {
    /// Wind chill >= -10.
    Low,
    /// -25 <= wind chill < -10.
    TenToThirtyMinutes,
    /// -35 <= wind chill < -25.
    FiveToTenMinutes,
    /// -48 <= wind chill < -35.
    FiveMinutesOrLess,
    /// Wind chill < -48.
    UnderFiveMinutes,
    /// Fallback for an undefined wind chill.
    NoRisk,
}

impl FrostbiteRisk {
    /// Label stored in `derived_metrics.frostbite_risk`.
    pub fn as_str(self) -> &'static str {
        match self {
            FrostbiteRisk::Low => ">30 minutes (low risk)",
            FrostbiteRisk::TenToThirtyMinutes => "10-30 minutes",
            FrostbiteRisk::FiveToTenMinutes => "5-10 minutes",
            FrostbiteRisk::FiveMinutesOrLess => "5 minutes or less",
            FrostbiteRisk::UnderFiveMinutes => "<5 minutes",
            FrostbiteRisk::NoRisk => "No risk",
        }
    }
}

impl fmt::Display for FrostbiteRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
