use serde::{Deserialize, Serialize};

use crate::domain::customer::CustomerId;
use crate::domain::feature::AxisName;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Dominant,
    StrengthBinned,
    FuzzyTop2,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dominant => "dominant",
            Self::StrengthBinned => "strength_binned",
            Self::FuzzyTop2 => "fuzzy_top2",
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dominant" => Ok(Self::Dominant),
            "strength_binned" | "binned" => Ok(Self::StrengthBinned),
            "fuzzy_top2" | "top2" => Ok(Self::FuzzyTop2),
            other => Err(format!(
                "unsupported archetype granularity `{other}` (expected dominant|strength_binned|fuzzy_top2)"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrengthBin {
    Weak,
    Balanced,
    Strong,
}

impl StrengthBin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weak => "weak",
            Self::Balanced => "balanced",
            Self::Strong => "strong",
        }
    }
}

/// Per-axis part of a signature.
///
/// Rounded memberships are stored as integers in units of `10^-precision` so signatures
/// compare and hash exactly. `Top2` keeps the dominant strength bin so it only ever splits
/// strength-binned archetypes, whatever the rounding.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum SignatureComponent {
    Dominant { axis: AxisName, segment: usize },
    Binned { axis: AxisName, segment: usize, strength: StrengthBin },
    Top2 {
        axis: AxisName,
        strength: StrengthBin,
        precision: u32,
        segments: Vec<(usize, u32)>,
    },
}

impl SignatureComponent {
    pub fn axis(&self) -> &AxisName {
        match self {
            Self::Dominant { axis, .. } | Self::Binned { axis, .. } | Self::Top2 { axis, .. } => {
                axis
            }
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Dominant { axis, segment } => format!("{axis}={segment}"),
            Self::Binned { axis, segment, strength } => {
                format!("{axis}={segment}:{}", strength.as_str())
            }
            Self::Top2 { axis, strength, precision, segments } => {
                let scale = 10f64.powi(*precision as i32);
                let parts: Vec<String> = segments
                    .iter()
                    .map(|(segment, units)| {
                        format!(
                            "{segment}@{:.*}",
                            *precision as usize,
                            f64::from(*units) / scale
                        )
                    })
                    .collect();
                format!("{axis}={}:{}", parts.join("+"), strength.as_str())
            }
        }
    }
}

/// Components ordered by axis name; two customers with equal signatures share an archetype.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchetypeSignature {
    pub components: Vec<SignatureComponent>,
}

impl ArchetypeSignature {
    pub fn new(mut components: Vec<SignatureComponent>) -> Self {
        components.sort_by(|left, right| left.axis().cmp(right.axis()));
        Self { components }
    }

    /// Stable textual key, e.g. `frequency=2|spend=0`.
    pub fn key(&self) -> String {
        self.components.iter().map(SignatureComponent::render).collect::<Vec<_>>().join("|")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Archetype {
    pub signature: ArchetypeSignature,
    pub key: String,
    pub member_count: usize,
    pub population_share: f64,
    pub member_ids: Vec<CustomerId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchetypeStatistics {
    pub archetype_count: usize,
    pub customer_count: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub median_size: f64,
    pub mean_size: f64,
    pub singleton_count: usize,
    /// Population share covered by the ten largest archetypes.
    pub top10_coverage: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchetypeReport {
    pub granularity: Granularity,
    /// Sorted by member count descending, then by key.
    pub archetypes: Vec<Archetype>,
    pub statistics: ArchetypeStatistics,
    /// Customers lacking a membership on at least one axis; excluded from all archetypes.
    pub incomplete_customers: Vec<CustomerId>,
}

impl ArchetypeReport {
    pub fn find(&self, key: &str) -> Option<&Archetype> {
        self.archetypes.iter().find(|archetype| archetype.key == key)
    }

    pub fn top(&self, limit: usize) -> &[Archetype] {
        &self.archetypes[..limit.min(self.archetypes.len())]
    }
}
