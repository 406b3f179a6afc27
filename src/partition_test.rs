//! Tests for partition sets.

use crate::error::GraphError;
use crate::partition::{PartId, PartitionDescriptor, PartitionSet};
use proptest::prelude::*;

#[test]
fn test_all_includes_every_id() {
  let set = PartitionSet::all(70);
  assert_eq!(set.full_count(), 70);
  assert_eq!(set.used_count(), 70);
  assert!(set.is_used(0));
  assert!(set.is_used(64));
  assert!(set.is_used(69));
  assert!(!set.is_used(70));
}

#[test]
fn test_single() {
  let set = PartitionSet::single();
  assert_eq!(set.full_count(), 1);
  assert_eq!(set.iter().collect::<Vec<_>>(), vec![0]);
}

#[test]
fn test_empty_ids_means_all() {
  let set = PartitionSet::from_ids(4, &[]).unwrap();
  assert_eq!(set, PartitionSet::all(4));
  let set = PartitionSet::from_descriptor(&PartitionDescriptor::all(3)).unwrap();
  assert_eq!(set.used_count(), 3);
}

#[test]
fn test_sparse_ids() {
  let set = PartitionSet::from_ids(10, &[7, 1, 7, 3]).unwrap();
  assert_eq!(set.used_count(), 3);
  assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 3, 7]);
  assert_eq!(set.used_id_at(2), Some(7));
  assert_eq!(set.used_id_at(3), None);
  assert_eq!(set.used_index_of(3), Some(1));
  assert_eq!(set.used_index_of(2), None);
}

#[test]
fn test_out_of_range_id_rejected() {
  let err = PartitionSet::from_ids(4, &[1, 4]).unwrap_err();
  assert!(matches!(err, GraphError::PartIdOverflow { id: 4, count: 4 }));
}

#[test]
fn test_check() {
  let set = PartitionSet::from_ids(8, &[2, 5]).unwrap();
  assert!(set.check(5).is_ok());
  assert!(matches!(
    set.check(3),
    Err(GraphError::PartIdOverflow { id: 3, count: 8 })
  ));
  assert!(set.check(100).is_err());
}

#[test]
fn test_fill_descriptor_lists_ids() {
  let set = PartitionSet::all(3);
  assert_eq!(
    set.fill_descriptor(),
    PartitionDescriptor {
      part_count: 3,
      part_ids: vec![0, 1, 2],
    }
  );
}

#[test]
fn test_descriptor_serde() {
  let desc: PartitionDescriptor = serde_json::from_str(r#"{ "part_count": 6 }"#).unwrap();
  assert_eq!(desc, PartitionDescriptor::all(6));
}

proptest! {
  #[test]
  fn test_descriptor_round_trip(
    full_count in 1u32..300,
    raw in proptest::collection::vec(0u32..300, 1..40)
  ) {
    let ids: Vec<PartId> = raw.into_iter().filter(|id| *id < full_count).collect();
    prop_assume!(!ids.is_empty());
    let set = PartitionSet::from_ids(full_count, &ids).unwrap();
    let again = PartitionSet::from_descriptor(&set.fill_descriptor()).unwrap();
    prop_assert_eq!(&again, &set);

    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    prop_assert_eq!(set.iter().collect::<Vec<_>>(), sorted.clone());
    prop_assert_eq!(set.used_count(), sorted.len());
    for (index, id) in sorted.iter().enumerate() {
      prop_assert_eq!(set.used_index_of(*id), Some(index));
      prop_assert_eq!(set.used_id_at(index), Some(*id));
    }
  }
}
