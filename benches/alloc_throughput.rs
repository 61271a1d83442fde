use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rtsalloc::Heap;
use std::hint::black_box;

const OPS: u64 = 100_000;

/// rtsalloc allocate/free throughput.
fn rtsalloc_allocate_free(heap: &mut Heap, size: usize) {
  for _ in 0..OPS {
    let ptr = heap.allocate(size);
    black_box(ptr);
    if let Some(p) = ptr {
      unsafe { heap.free(p.as_ptr()) };
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Interleaved sizes with a sliding window of live blocks, so frees coalesce.
fn rtsalloc_fragmented(heap: &mut Heap) {
  const SIZES: [usize; 7] = [24, 200, 64, 1000, 16, 4000, 480];
  let mut live = [core::ptr::null_mut::<u8>(); 16];
  for i in 0..OPS as usize {
    let slot = i % live.len();
    unsafe { heap.free(live[slot]) };
    live[slot] = heap
      .allocate(SIZES[i % SIZES.len()])
      .map_or(core::ptr::null_mut(), |p| p.as_ptr());
  }
  for p in live {
    unsafe { heap.free(p) };
  }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("alloc_throughput");
  let mut heap = Heap::new(1 << 20).expect("map bench heap");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("rtsalloc", size), &size, |b, &size| {
      b.iter(|| rtsalloc_allocate_free(&mut heap, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.throughput(Throughput::Elements(OPS));
  group.bench_function("rtsalloc_fragmented", |b| {
    b.iter(|| rtsalloc_fragmented(&mut heap))
  });

  group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
