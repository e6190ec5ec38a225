//! VMID allocation.

use std::collections::BTreeSet;

use crate::pool::{Vmid, VmidRange};

/// Lowest VMID in `range` not present in `existing`.
pub fn allocate(range: VmidRange, existing: &BTreeSet<Vmid>) -> Option<Vmid> {
    range.iter().find(|vmid| !existing.contains(vmid))
}

/// Allocate and reserve a VMID in `existing` in one step.
///
/// Successive calls against the same set never hand out the same VMID.
pub fn reserve(range: VmidRange, existing: &mut BTreeSet<Vmid>) -> Option<Vmid> {
    let vmid = allocate(range, existing)?;
    existing.insert(vmid);
    Some(vmid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(ids: &[u32]) -> BTreeSet<Vmid> {
        ids.iter().copied().map(Vmid::new).collect()
    }

    #[test]
    fn test_allocate_lowest_free() {
        let range = VmidRange::new(200, 209).unwrap();
        assert_eq!(allocate(range, &set(&[])), Some(Vmid::new(200)));
        assert_eq!(allocate(range, &set(&[200, 201, 203])), Some(Vmid::new(202)));
    }

    #[test]
    fn test_allocate_ignores_ids_outside_range() {
        let range = VmidRange::new(200, 201).unwrap();
        assert_eq!(allocate(range, &set(&[100, 199, 202])), Some(Vmid::new(200)));
    }

    #[test]
    fn test_allocate_exhausted() {
        let range = VmidRange::new(200, 202).unwrap();
        assert_eq!(allocate(range, &set(&[200, 201, 202])), None);
    }

    #[test]
    fn test_reserve_marks_vmid_used() {
        let range = VmidRange::new(200, 201).unwrap();
        let mut existing = set(&[]);
        assert_eq!(reserve(range, &mut existing), Some(Vmid::new(200)));
        assert_eq!(reserve(range, &mut existing), Some(Vmid::new(201)));
        assert_eq!(reserve(range, &mut existing), None);
    }

    proptest! {
        #[test]
        fn prop_reserve_is_injective(
            taken in prop::collection::btree_set(190u32..230, 0..30),
            attempts in 0usize..25,
        ) {
            let range = VmidRange::new(200, 219).unwrap();
            let mut existing: BTreeSet<Vmid> = taken.iter().copied().map(Vmid::new).collect();
            let before = existing.clone();

            let mut handed_out = BTreeSet::new();
            for _ in 0..attempts {
                match reserve(range, &mut existing) {
                    Some(vmid) => {
                        prop_assert!(range.contains(vmid));
                        prop_assert!(!before.contains(&vmid));
                        prop_assert!(handed_out.insert(vmid));
                    }
                    None => {
                        prop_assert!(range.iter().all(|v| existing.contains(&v)));
                    }
                }
            }
        }
    }
}
