//! Tests for the atomic bitmap.

use crate::bitmap::AtomicBitmap;
use std::sync::Arc;
use std::thread;

#[test]
fn test_set_returns_previous() {
  let bitmap = AtomicBitmap::new(100);
  assert!(!bitmap.set(65));
  assert!(bitmap.set(65));
  assert!(bitmap.test(65));
  assert!(bitmap.clear(65));
  assert!(!bitmap.clear(65));
  assert!(!bitmap.test(65));
}

#[test]
fn test_out_of_range_is_noop() {
  let bitmap = AtomicBitmap::new(3);
  assert!(!bitmap.set(3));
  assert!(!bitmap.test(3));
  assert_eq!(bitmap.count(), 0);
}

#[test]
fn test_all_and_any() {
  let bitmap = AtomicBitmap::new(70);
  assert!(!bitmap.any());
  assert!(!bitmap.all());
  bitmap.set_all();
  assert!(bitmap.all());
  assert_eq!(bitmap.count(), 70);
  assert!(AtomicBitmap::new(0).all());
}

#[test]
fn test_concurrent_set_claims_each_bit_once() {
  let bitmap = Arc::new(AtomicBitmap::new(128));
  let handles: Vec<_> = (0..4)
    .map(|_| {
      let bitmap = Arc::clone(&bitmap);
      thread::spawn(move || (0..128).filter(|&index| !bitmap.set(index)).count())
    })
    .collect();
  let claimed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
  assert_eq!(claimed, 128);
  assert!(bitmap.all());
}
