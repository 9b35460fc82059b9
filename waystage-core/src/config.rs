//! Build-time configuration for a staging run.
//!
//! The configuration is fixed for the lifetime of a run. With the `serde`
//! feature it can be read from JSON; every field has a default, so partial
//! documents are accepted.

use thiserror::Error;

use crate::ids::{IdConversion, SHIFT_ID};

/// Bits of id space kept free for real node ids below the synthetic base.
pub const MIN_REAL_ID_BITS: u32 = 36;
use crate::tags::DEFAULT_IGNORED_TAGS;

/// Rows buffered across the three row families before a flush and commit.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// How a second sighting of an internal id within one run is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DuplicatePolicy {
    /// Upsert over the previous rows. Stale way or relation rows at higher
    /// ordinals survive when the redefinition is shorter.
    Overwrite,
    /// Flush, delete the previous rows, commit, then write the new definition.
    #[default]
    Replace,
    /// Abort the run on the first redefinition.
    Reject,
}

/// Layout of the synthetic node id range.
///
/// A synthetic id is `(1 << base_bit) + (way_id << per_way_bits) + counter`,
/// so every synthetic node id is at least `1 << base_bit` and encodes the way
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SyntheticIds {
    /// Bit marking the start of the synthetic range.
    pub base_bit: u32,
    /// Bits reserved for the per-way counter.
    pub per_way_bits: u32,
    /// Synthetic nodes allowed for one way before propagation is abandoned.
    pub max_per_way: u32,
}

impl Default for SyntheticIds {
    fn default() -> Self {
        Self {
            base_bit: 50,
            per_way_bits: 11,
            max_per_way: (1 << 11) - 1,
        }
    }
}

impl SyntheticIds {
    /// First id of the synthetic range.
    pub const fn base(&self) -> i64 {
        1_i64 << self.base_bit
    }

    /// Whether an id lies in the synthetic range.
    pub const fn contains(&self, id: i64) -> bool {
        id >= self.base()
    }

    /// Allocate the `counter`-th synthetic id of a way.
    ///
    /// Returns `None` when the way id is negative, the counter exceeds the
    /// per-way field or the id would overflow.
    pub fn allocate(&self, way_id: i64, counter: u32) -> Option<i64> {
        if way_id < 0 || u64::from(counter) >= (1_u64 << self.per_way_bits) {
            return None;
        }
        let limit = (i64::MAX - self.base()) >> self.per_way_bits;
        if way_id > limit {
            return None;
        }
        Some(self.base() + (way_id << self.per_way_bits) + i64::from(counter))
    }

    /// Every id a way could ever be allocated, first and last inclusive.
    ///
    /// Returns `None` when the way cannot own synthetic ids.
    pub fn way_range(&self, way_id: i64) -> Option<(i64, i64)> {
        let last = u32::try_from((1_u64 << self.per_way_bits) - 1).ok()?;
        Some((self.allocate(way_id, 0)?, self.allocate(way_id, last)?))
    }

    /// Way id encoded in a synthetic id.
    pub const fn way_of(&self, id: i64) -> Option<i64> {
        if !self.contains(id) {
            return None;
        }
        Some((id - self.base()) >> self.per_way_bits)
    }
}

/// Configuration for a staging run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StagingConfig {
    /// Rows buffered before a flush and commit.
    pub batch_size: usize,
    /// Id conversion parameters.
    pub ids: IdConversion,
    /// Synthetic node id range.
    pub synthetic: SyntheticIds,
    /// Run the propagation engine on ways.
    pub propagate: bool,
    /// Redefinition handling.
    pub duplicates: DuplicatePolicy,
    /// Tag keys dropped before staging.
    pub ignored_tags: Vec<String>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            ids: IdConversion::default(),
            synthetic: SyntheticIds::default(),
            propagate: true,
            duplicates: DuplicatePolicy::default(),
            ignored_tags: DEFAULT_IGNORED_TAGS.iter().map(|tag| (*tag).to_owned()).collect(),
        }
    }
}

/// Errors raised when a configuration is unusable.
#[derive(Debug, Error)]
pub enum StagingConfigError {
    /// The batch threshold was zero.
    #[error("batch size must be positive")]
    ZeroBatchSize,
    /// The displacement shift cannot be applied to any id.
    #[error("id shift of {shift_bits} bits leaves no room for ids")]
    ShiftTooLarge {
        /// Configured shift.
        shift_bits: u32,
    },
    /// Converted node ids could reach the synthetic range.
    #[error(
        "id shift of {shift_bits} bits leaves fewer than {min} bits below synthetic base bit \
         {base_bit}",
        min = MIN_REAL_ID_BITS
    )]
    IdRoom {
        /// Shift applied to non-negative node ids.
        shift_bits: u32,
        /// Configured synthetic base bit.
        base_bit: u32,
    },
    /// The displacement addition was negative.
    #[error("id addition must not be negative, got {addition}")]
    NegativeAddition {
        /// Configured addition.
        addition: i64,
    },
    /// The synthetic range does not fit or overlaps the counter field.
    #[error("synthetic id range (base bit {base_bit}, {per_way_bits} counter bits) is invalid")]
    SyntheticRange {
        /// Configured base bit.
        base_bit: u32,
        /// Configured counter bits.
        per_way_bits: u32,
    },
    /// The per-way cap does not fit the counter field.
    #[error("per-way synthetic cap {max_per_way} exceeds the {per_way_bits}-bit counter")]
    SyntheticCap {
        /// Configured cap.
        max_per_way: u32,
        /// Configured counter bits.
        per_way_bits: u32,
    },
    /// The JSON document could not be parsed.
    #[cfg(feature = "serde")]
    #[error("failed to parse staging configuration")]
    Parse {
        /// Source error from `serde_json`.
        #[source]
        source: serde_json::Error,
    },
}

impl StagingConfig {
    /// Check the configuration for values that would corrupt ids.
    pub fn validate(&self) -> Result<(), StagingConfigError> {
        if self.batch_size == 0 {
            return Err(StagingConfigError::ZeroBatchSize);
        }
        if self.ids.shift_bits >= 62 || (self.ids.geo_hash && self.ids.shift_bits > 62 - SHIFT_ID)
        {
            return Err(StagingConfigError::ShiftTooLarge {
                shift_bits: self.ids.shift_bits,
            });
        }
        if self.ids.addition < 0 {
            return Err(StagingConfigError::NegativeAddition {
                addition: self.ids.addition,
            });
        }
        let SyntheticIds {
            base_bit,
            per_way_bits,
            max_per_way,
        } = self.synthetic;
        if base_bit >= 62 || per_way_bits == 0 || per_way_bits >= base_bit {
            return Err(StagingConfigError::SyntheticRange {
                base_bit,
                per_way_bits,
            });
        }
        if u64::from(max_per_way) >= (1_u64 << per_way_bits) {
            return Err(StagingConfigError::SyntheticCap {
                max_per_way,
                per_way_bits,
            });
        }
        let shift_bits = self.ids.positive_shift();
        if base_bit < shift_bits + MIN_REAL_ID_BITS {
            return Err(StagingConfigError::IdRoom {
                shift_bits,
                base_bit,
            });
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration document.
    ///
    /// # Examples
    /// ```
    /// use waystage_core::{DuplicatePolicy, StagingConfig};
    ///
    /// let config = StagingConfig::from_json_str(
    ///     r#"{"batch_size": 500, "duplicates": "reject", "ids": {"geo_hash": false}}"#,
    /// )
    /// .expect("valid configuration");
    /// assert_eq!(config.batch_size, 500);
    /// assert_eq!(config.duplicates, DuplicatePolicy::Reject);
    /// assert!(config.propagate, "unspecified fields keep their defaults");
    /// ```
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self, StagingConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|source| StagingConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON configuration from a reader.
    #[cfg(feature = "serde")]
    pub fn from_json_reader<R: std::io::Read>(reader: R) -> Result<Self, StagingConfigError> {
        let config: Self = serde_json::from_reader(reader)
            .map_err(|source| StagingConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }
}
