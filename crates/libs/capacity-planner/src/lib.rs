//! Capacity Planner
//!
//! Maps a camera count to the smallest host capacity tier able to serve it.
//! Tiers are an ordered table (ascending by `max_camera_capacity`); the
//! planner is pure and is consulted when provisioning a gateway host, not on
//! every boot.
//!
//! # Usage
//!
//! ```rust
//! use camfleet_capacity_planner::{select_tier, CapacityTier};
//!
//! let tiers = vec![
//!     CapacityTier::new("A", 5),
//!     CapacityTier::new("B", 10),
//!     CapacityTier::new("C", 20),
//! ];
//!
//! assert_eq!(select_tier(&tiers, 7).unwrap().name, "B");
//! assert!(select_tier(&tiers, 25).is_err());
//! ```

use serde::{Deserialize, Serialize};

/// A named capacity bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityTier {
    /// Tier name (usually the host instance type)
    pub name: String,

    /// Maximum number of cameras a host of this tier serves
    pub max_camera_capacity: u32,
}

impl CapacityTier {
    /// Create a new tier
    pub fn new(name: impl Into<String>, max_camera_capacity: u32) -> Self {
        Self {
            name: name.into(),
            max_camera_capacity,
        }
    }
}

/// Select the smallest tier whose capacity covers `camera_count`.
///
/// `tiers` must be sorted ascending by `max_camera_capacity`; the first
/// satisfying entry is returned. Use [`TierTable`] to have the ordering
/// checked up front.
pub fn select_tier(tiers: &[CapacityTier], camera_count: u32) -> Result<&CapacityTier, CapacityError> {
    tiers
        .iter()
        .find(|tier| tier.max_camera_capacity >= camera_count)
        .ok_or_else(|| CapacityError::CapacityExceeded {
            camera_count,
            largest_capacity: tiers.last().map(|t| t.max_camera_capacity),
        })
}

/// A validated, ascending tier table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierTable {
    tiers: Vec<CapacityTier>,
}

impl TierTable {
    /// Build a table, rejecting empty, unsorted or duplicate-named input
    pub fn new(tiers: Vec<CapacityTier>) -> Result<Self, CapacityError> {
        if tiers.is_empty() {
            return Err(CapacityError::EmptyTable);
        }

        for pair in tiers.windows(2) {
            if pair[1].max_camera_capacity <= pair[0].max_camera_capacity {
                return Err(CapacityError::Unsorted {
                    previous: pair[0].name.clone(),
                    next: pair[1].name.clone(),
                });
            }
        }

        for (i, tier) in tiers.iter().enumerate() {
            if tiers[..i].iter().any(|t| t.name == tier.name) {
                return Err(CapacityError::DuplicateTier(tier.name.clone()));
            }
        }

        Ok(Self { tiers })
    }

    /// Default host table for relay workloads (one relay process per camera)
    pub fn standard() -> Self {
        Self {
            tiers: vec![
                CapacityTier::new("t3.medium", 4),
                CapacityTier::new("t3.large", 8),
                CapacityTier::new("c5.xlarge", 16),
                CapacityTier::new("c5.2xlarge", 32),
                CapacityTier::new("c5.4xlarge", 64),
            ],
        }
    }

    /// Select the smallest tier covering `camera_count`
    pub fn select(&self, camera_count: u32) -> Result<&CapacityTier, CapacityError> {
        select_tier(&self.tiers, camera_count)
    }

    /// Largest capacity in the table
    pub fn max_capacity(&self) -> u32 {
        self.tiers.last().map(|t| t.max_camera_capacity).unwrap_or(0)
    }

    /// Tiers in ascending order
    pub fn tiers(&self) -> &[CapacityTier] {
        &self.tiers
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Capacity planning errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapacityError {
    #[error("Capacity exceeded: {camera_count} cameras, largest tier holds {}", .largest_capacity.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    CapacityExceeded {
        camera_count: u32,
        largest_capacity: Option<u32>,
    },

    #[error("Tier table is empty")]
    EmptyTable,

    #[error("Tier table not ascending: {next} does not exceed {previous}")]
    Unsorted { previous: String, next: String },

    #[error("Duplicate tier name: {0}")]
    DuplicateTier(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc() -> Vec<CapacityTier> {
        vec![
            CapacityTier::new("A", 5),
            CapacityTier::new("B", 10),
            CapacityTier::new("C", 20),
        ]
    }

    #[test]
    fn test_select_between_tiers() {
        let tiers = abc();
        assert_eq!(select_tier(&tiers, 7).unwrap().name, "B");
    }

    #[test]
    fn test_select_exact_boundary() {
        let tiers = abc();
        assert_eq!(select_tier(&tiers, 5).unwrap().name, "A");
        assert_eq!(select_tier(&tiers, 10).unwrap().name, "B");
        assert_eq!(select_tier(&tiers, 20).unwrap().name, "C");
    }

    #[test]
    fn test_zero_cameras_gets_smallest() {
        let tiers = abc();
        assert_eq!(select_tier(&tiers, 0).unwrap().name, "A");
    }

    #[test]
    fn test_capacity_exceeded() {
        let tiers = abc();
        match select_tier(&tiers, 25) {
            Err(CapacityError::CapacityExceeded {
                camera_count,
                largest_capacity,
            }) => {
                assert_eq!(camera_count, 25);
                assert_eq!(largest_capacity, Some(20));
            }
            other => panic!("Expected CapacityExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_slice_always_exceeded() {
        let err = select_tier(&[], 0).unwrap_err();
        assert_eq!(
            err,
            CapacityError::CapacityExceeded {
                camera_count: 0,
                largest_capacity: None
            }
        );
    }

    #[test]
    fn test_selection_is_smallest_sufficient_for_all_counts() {
        let table = TierTable::standard();
        for count in 0..=table.max_capacity() + 5 {
            match table.select(count) {
                Ok(tier) => {
                    assert!(tier.max_camera_capacity >= count);
                    // no smaller tier would have fit
                    for smaller in table
                        .tiers()
                        .iter()
                        .filter(|t| t.max_camera_capacity < tier.max_camera_capacity)
                    {
                        assert!(smaller.max_camera_capacity < count);
                    }
                }
                Err(CapacityError::CapacityExceeded { .. }) => {
                    assert!(count > table.max_capacity());
                }
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
    }

    #[test]
    fn test_table_rejects_unsorted() {
        let result = TierTable::new(vec![
            CapacityTier::new("big", 20),
            CapacityTier::new("small", 5),
        ]);
        assert_eq!(
            result.unwrap_err(),
            CapacityError::Unsorted {
                previous: "big".to_string(),
                next: "small".to_string()
            }
        );
    }

    #[test]
    fn test_table_rejects_equal_capacities() {
        let result = TierTable::new(vec![CapacityTier::new("a", 5), CapacityTier::new("b", 5)]);
        assert!(matches!(result, Err(CapacityError::Unsorted { .. })));
    }

    #[test]
    fn test_table_rejects_empty_and_duplicates() {
        assert_eq!(TierTable::new(vec![]).unwrap_err(), CapacityError::EmptyTable);

        let result = TierTable::new(vec![CapacityTier::new("a", 5), CapacityTier::new("a", 10)]);
        assert_eq!(result.unwrap_err(), CapacityError::DuplicateTier("a".to_string()));
    }

    #[test]
    fn test_tiers_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            tiers: Vec<CapacityTier>,
        }

        let doc: Doc = toml::from_str(
            r#"
[[tiers]]
name = "small"
max_camera_capacity = 2

[[tiers]]
name = "large"
max_camera_capacity = 12
"#,
        )
        .unwrap();

        let table = TierTable::new(doc.tiers).unwrap();
        assert_eq!(table.select(3).unwrap().name, "large");
        assert_eq!(table.max_capacity(), 12);
    }

    #[test]
    fn test_error_message_names_count() {
        let err = TierTable::standard().select(1000).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Capacity exceeded: 1000 cameras, largest tier holds 64"
        );
    }
}
