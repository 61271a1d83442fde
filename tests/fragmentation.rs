use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rtsalloc::{ALIGNMENT, FRAGMENT_SIZE_MIN, Heap};

struct Live {
  ptr: *mut u8,
  len: usize,
  tag: u8,
}

fn fill(live: &Live) {
  unsafe { live.ptr.write_bytes(live.tag, live.len) };
}

fn intact(live: &Live) -> bool {
  (0..live.len).all(|i| unsafe { *live.ptr.add(i) } == live.tag)
}

fn overlaps(a: &Live, b: &Live) -> bool {
  let (a0, a1) = (a.ptr as usize, a.ptr as usize + a.len);
  let (b0, b1) = (b.ptr as usize, b.ptr as usize + b.len);
  a0 < b1 && b0 < a1
}

fn assert_invariants(heap: &Heap) {
  let diag = heap.diagnostics();
  assert!(diag.allocated <= diag.capacity);
  assert!(diag.peak_allocated >= diag.allocated);
  assert_eq!(heap.fragments().map(|f| f.size).sum::<usize>(), diag.capacity);
  assert!(heap.check_heap_corruption());
  assert!(heap.check_fragment_chain());
}

/// Random allocate/free mix; live blocks are tagged and verified before release.
fn churn(seed: u64, region: usize, max_request: usize, steps: usize) {
  let mut rng = StdRng::seed_from_u64(seed);
  let mut heap = Heap::new(region).unwrap();
  let mut live: Vec<Live> = Vec::new();

  for step in 0..steps {
    let allocate = live.is_empty() || rng.gen_bool(0.55);
    if allocate {
      let len = rng.gen_range(1..=max_request);
      let Some(p) = heap.allocate(len) else {
        continue;
      };
      let block = Live {
        ptr: p.as_ptr(),
        len,
        tag: (step % 251) as u8 + 1,
      };
      assert_eq!(block.ptr as usize % ALIGNMENT, 0);
      assert!(live.iter().all(|other| !overlaps(&block, other)));
      fill(&block);
      live.push(block);
    } else {
      let victim = live.swap_remove(rng.gen_range(0..live.len()));
      assert!(intact(&victim), "block {:p} was overwritten", victim.ptr);
      unsafe { heap.free(victim.ptr) };
    }

    if step % 16 == 0 {
      assert_invariants(&heap);
    }
  }

  live.shuffle(&mut rng);
  for block in live.drain(..) {
    assert!(intact(&block));
    unsafe { heap.free(block.ptr) };
  }

  assert_invariants(&heap);
  assert_eq!(heap.diagnostics().allocated, 0);
  let frags: Vec<_> = heap.fragments().collect();
  assert_eq!(frags.len(), 1);
  assert_eq!(frags[0].size, heap.capacity());
  assert!(!frags[0].used);
}

#[test]
fn churn_small_requests() {
  churn(0x5eed_0001, 64 * 1024, 256, 20_000);
}

#[test]
fn churn_mixed_requests() {
  churn(0x5eed_0002, 256 * 1024, 8 * 1024, 20_000);
}

#[test]
fn churn_under_memory_pressure() {
  // Requests regularly fail here, exercising the OOM path alongside splits.
  churn(0x5eed_0003, 16 * 1024, 4 * 1024, 10_000);
}

#[test]
fn exhaust_then_release_in_random_order() {
  for seed in 0..8u64 {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut heap = Heap::new(128 * 1024).unwrap();

    let mut ptrs = Vec::new();
    loop {
      let len = rng.gen_range(1..=2048);
      match heap.allocate(len) {
        Some(p) => ptrs.push(p.as_ptr()),
        // Fill the gaps with the smallest class until nothing is left.
        None => match heap.allocate(1) {
          Some(p) => ptrs.push(p.as_ptr()),
          None => break,
        },
      }
    }
    assert_eq!(heap.diagnostics().allocated, heap.capacity());

    ptrs.shuffle(&mut rng);
    for p in ptrs {
      unsafe { heap.free(p) };
    }

    let frags: Vec<_> = heap.fragments().collect();
    assert_eq!(frags.len(), 1, "seed {seed} left {} fragments", frags.len());
    assert_eq!(frags[0].size, heap.capacity());
    assert!(heap.check_heap_corruption());
  }
}

#[test]
fn checkerboard_holes_serve_only_small_requests() {
  let mut heap = Heap::new(64 * 1024).unwrap();

  let mut ptrs = Vec::new();
  while let Some(p) = heap.allocate(FRAGMENT_SIZE_MIN - ALIGNMENT) {
    ptrs.push(p.as_ptr());
  }
  for p in ptrs.iter().step_by(2) {
    unsafe { heap.free(*p) };
  }
  let free_bytes = heap.capacity() - heap.diagnostics().allocated;
  assert!(free_bytes >= heap.capacity() / 2 - FRAGMENT_SIZE_MIN);

  // Plenty of free bytes, but no hole bigger than one fragment.
  let oom_before = heap.diagnostics().oom_count;
  assert!(heap.allocate(FRAGMENT_SIZE_MIN).is_none());
  assert_eq!(heap.diagnostics().oom_count, oom_before + 1);
  assert!(heap.allocate(FRAGMENT_SIZE_MIN - ALIGNMENT).is_some());
  assert!(heap.check_fragment_chain());
}
