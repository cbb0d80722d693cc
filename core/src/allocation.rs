//! Unit selection for reservations
//!
//! Pure functions only: the caller supplies a snapshot of candidate units and
//! the remaining headroom of every capacity group, and gets back the units to
//! lease. Nothing here touches storage, so the same inputs always produce the
//! same selection.

use std::collections::{BTreeMap, HashMap};

use crate::{Error, RequestedCounts, Result};

/// Anything the allocator can pick
pub trait Allocatable {
    fn unit_id(&self) -> &str;
    fn unit_type(&self) -> &str;
    fn capacity_group(&self) -> Option<&str>;
}

/// Remaining lease slots per capacity group. Groups absent from the map are unbounded.
pub type GroupHeadroom = HashMap<String, u32>;

/// Reject empty requests and zero counts
pub fn validate_request(requested: &RequestedCounts) -> Result<()> {
    if requested.is_empty() {
        return Err(Error::InvalidRequest(
            "requested_counts must name at least one unit type".to_string(),
        ));
    }

    if let Some((unit_type, _)) = requested.iter().find(|(_, count)| **count == 0) {
        return Err(Error::InvalidRequest(format!(
            "requested count for '{}' must be greater than zero",
            unit_type
        )));
    }

    Ok(())
}

/// Tally units by type
pub fn count_by_type<U: Allocatable>(units: &[U]) -> BTreeMap<&str, u32> {
    let mut counts = BTreeMap::new();
    for unit in units {
        *counts.entry(unit.unit_type()).or_insert(0) += 1;
    }
    counts
}

/// Requested types the given units cannot cover, as `(type, have, need)`
pub fn shortfall<'r, U: Allocatable>(
    units: &[U],
    requested: &'r RequestedCounts,
) -> Vec<(&'r str, u32, u32)> {
    let counts = count_by_type(units);

    requested
        .iter()
        .filter_map(|(unit_type, need)| {
            let have = counts.get(unit_type.as_str()).copied().unwrap_or(0);
            (have < *need).then_some((unit_type.as_str(), have, *need))
        })
        .collect()
}

/// Whether the given units could cover the request, ignoring group bounds
pub fn is_enough<U: Allocatable>(units: &[U], requested: &RequestedCounts) -> bool {
    shortfall(units, requested).is_empty()
}

/// Human readable shortfall, e.g. `tedix-v1-02: 1/2`
pub fn describe_shortfall(missing: &[(&str, u32, u32)]) -> String {
    missing
        .iter()
        .map(|(unit_type, have, need)| format!("{}: {}/{}", unit_type, have, need))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Choose units satisfying `requested` from `candidates`.
///
/// Candidates are scanned in ascending id order and each one is taken while
/// its type still has an outstanding need and its capacity group (if any) has
/// headroom left. Fails with `InsufficientResources` without selecting
/// anything if the request cannot be fully met.
pub fn select_units<'a, U: Allocatable>(
    requested: &RequestedCounts,
    candidates: &'a [U],
    headroom: &GroupHeadroom,
) -> Result<Vec<&'a U>> {
    validate_request(requested)?;

    let missing = shortfall(candidates, requested);
    if !missing.is_empty() {
        return Err(Error::InsufficientResources(format!(
            "not enough available units ({})",
            describe_shortfall(&missing)
        )));
    }

    let mut ordered: Vec<&U> = candidates.iter().collect();
    ordered.sort_by(|a, b| a.unit_id().cmp(b.unit_id()));

    let mut remaining: BTreeMap<&str, u32> = requested
        .iter()
        .map(|(unit_type, count)| (unit_type.as_str(), *count))
        .collect();
    let mut group_left = headroom.clone();
    let mut selected = Vec::new();

    for unit in ordered {
        let Some(need) = remaining.get_mut(unit.unit_type()) else {
            continue;
        };
        if *need == 0 {
            continue;
        }

        if let Some(group) = unit.capacity_group() {
            if let Some(left) = group_left.get_mut(group) {
                if *left == 0 {
                    continue;
                }
                *left -= 1;
            }
        }

        *need -= 1;
        selected.push(unit);
    }

    let unmet: Vec<(&str, u32)> = remaining
        .into_iter()
        .filter(|(_, left)| *left > 0)
        .collect();
    if !unmet.is_empty() {
        let detail = unmet
            .iter()
            .map(|(unit_type, left)| format!("{}: {} short", unit_type, left))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(Error::InsufficientResources(format!(
            "capacity group bound prevents allocation ({})",
            detail
        )));
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct TestUnit {
        id: String,
        unit_type: String,
        group: Option<String>,
    }

    impl Allocatable for TestUnit {
        fn unit_id(&self) -> &str {
            &self.id
        }
        fn unit_type(&self) -> &str {
            &self.unit_type
        }
        fn capacity_group(&self) -> Option<&str> {
            self.group.as_deref()
        }
    }

    fn unit(id: &str, unit_type: &str) -> TestUnit {
        TestUnit {
            id: id.to_string(),
            unit_type: unit_type.to_string(),
            group: None,
        }
    }

    fn pin(id: &str, group: &str) -> TestUnit {
        TestUnit {
            id: id.to_string(),
            unit_type: "power".to_string(),
            group: Some(group.to_string()),
        }
    }

    fn request(pairs: &[(&str, u32)]) -> RequestedCounts {
        pairs.iter().map(|(t, c)| (t.to_string(), *c)).collect()
    }

    fn ids(selected: &[&TestUnit]) -> Vec<String> {
        selected.iter().map(|u| u.id.clone()).collect()
    }

    #[test]
    fn test_selects_exact_counts_in_id_order() {
        let pool = vec![
            unit("a3", "A"),
            unit("b1", "B"),
            unit("a1", "A"),
            unit("a2", "A"),
            unit("b2", "B"),
        ];

        let selected = select_units(&request(&[("A", 2), ("B", 1)]), &pool, &GroupHeadroom::new())
            .unwrap();
        assert_eq!(ids(&selected), vec!["a1", "a2", "b1"]);
    }

    #[test]
    fn test_selection_is_deterministic_regardless_of_input_order() {
        let forward = vec![unit("d1", "A"), unit("d2", "A"), unit("d3", "A")];
        let mut reversed = forward.clone();
        reversed.reverse();

        let req = request(&[("A", 2)]);
        let first = ids(&select_units(&req, &forward, &GroupHeadroom::new()).unwrap());
        let second = ids(&select_units(&req, &reversed, &GroupHeadroom::new()).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_shortfall_fails_immediately() {
        let pool = vec![unit("a1", "A"), unit("b1", "B")];

        let err = select_units(&request(&[("A", 2)]), &pool, &GroupHeadroom::new()).unwrap_err();
        assert!(matches!(err, Error::InsufficientResources(_)));
        assert!(err.to_string().contains("A: 1/2"));

        let err = select_units(&request(&[("C", 1)]), &pool, &GroupHeadroom::new()).unwrap_err();
        assert!(matches!(err, Error::InsufficientResources(_)));
    }

    #[test]
    fn test_rejects_empty_and_zero_requests() {
        let pool = vec![unit("a1", "A")];
        assert!(matches!(
            select_units(&RequestedCounts::new(), &pool, &GroupHeadroom::new()),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            select_units(&request(&[("A", 0)]), &pool, &GroupHeadroom::new()),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_group_headroom_limits_assignment() {
        let pool = vec![
            pin("p1", "bolid-1"),
            pin("p2", "bolid-1"),
            pin("p3", "bolid-2"),
        ];
        let mut headroom = GroupHeadroom::new();
        headroom.insert("bolid-1".to_string(), 1);
        headroom.insert("bolid-2".to_string(), 4);

        // p2 is skipped because bolid-1 has a single free slot
        let selected = select_units(&request(&[("power", 2)]), &pool, &headroom).unwrap();
        assert_eq!(ids(&selected), vec!["p1", "p3"]);

        headroom.insert("bolid-2".to_string(), 0);
        let err = select_units(&request(&[("power", 2)]), &pool, &headroom).unwrap_err();
        assert!(matches!(err, Error::InsufficientResources(_)));
    }

    #[test]
    fn test_is_enough_counts_whole_inventory() {
        let pool = vec![unit("a1", "A"), unit("a2", "A"), unit("b1", "B")];
        assert!(is_enough(&pool, &request(&[("A", 2), ("B", 1)])));
        assert!(!is_enough(&pool, &request(&[("A", 3)])));
        assert_eq!(
            describe_shortfall(&shortfall(&pool, &request(&[("A", 3), ("B", 2)]))),
            "A: 2/3, B: 1/2"
        );
    }
}
