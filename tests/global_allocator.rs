//! Runs the whole test binary, harness included, on top of a `LockedHeap`.

use std::collections::{BTreeMap, HashMap};

use rtsalloc::LockedHeap;

#[global_allocator]
static GLOBAL: LockedHeap = LockedHeap::new(64 << 20);

#[test]
fn std_collections_draw_from_the_arena() {
  let mut words: HashMap<String, usize> = HashMap::new();
  let text = "the quick brown fox jumps over the lazy dog the end";
  for w in text.split_whitespace() {
    *words.entry(w.to_owned()).or_default() += 1;
  }
  assert_eq!(words["the"], 3);

  let squares: Vec<u64> = (0..10_000).map(|i| i * i).collect();
  assert_eq!(squares[9_999], 9_999 * 9_999);

  let mut tree = BTreeMap::new();
  for i in (0..2_000).rev() {
    tree.insert(i, format!("value-{i}"));
  }
  assert_eq!(tree.first_key_value().map(|(k, _)| *k), Some(0));

  // Other tests run concurrently, so only the watermarks are stable here.
  let during = GLOBAL.diagnostics().unwrap();
  assert!(during.allocated > 0);
  assert!(during.peak_request_size >= 10_000 * 8);

  drop(words);
  drop(squares);
  drop(tree);
  assert!(GLOBAL.check_heap_corruption());
}

#[test]
fn growing_vec_reallocates_through_the_arena() {
  let mut v: Vec<u32> = Vec::new();
  for i in 0..50_000 {
    v.push(i);
  }
  assert_eq!(v.iter().map(|&x| x as u64).sum::<u64>(), 49_999 * 50_000 / 2);

  v.truncate(10);
  v.shrink_to_fit();
  assert_eq!(v, (0..10).collect::<Vec<_>>());
  assert!(GLOBAL.check_heap_corruption());
}

#[test]
fn threads_share_the_global_heap() {
  let handles: Vec<_> = (0..4)
    .map(|t| {
      std::thread::spawn(move || {
        let mut acc = Vec::new();
        for i in 0..500 {
          acc.push(vec![t as u8; 16 + i % 200]);
          if acc.len() > 32 {
            acc.remove(0);
          }
        }
        acc.len()
      })
    })
    .collect();

  for h in handles {
    assert_eq!(h.join().unwrap(), 32);
  }
  assert!(GLOBAL.check_fragment_chain());
}
