//! An allocating logger at trace level, with every allocation served by a `LockedHeap`.
#![cfg(not(feature = "trace-calls"))]

use std::sync::Mutex;

use log::{LevelFilter, Log, Metadata, Record};
use rtsalloc::LockedHeap;

#[global_allocator]
static GLOBAL: LockedHeap = LockedHeap::new(16 << 20);

static LINES: Mutex<Vec<String>> = Mutex::new(Vec::new());

struct Capture;

impl Log for Capture {
  fn enabled(&self, _: &Metadata) -> bool {
    true
  }

  fn log(&self, record: &Record) {
    let line = format!("{} {}", record.level(), record.args());
    if let Ok(mut lines) = LINES.lock() {
      lines.push(line);
    }
  }

  fn flush(&self) {}
}

static LOGGER: Capture = Capture;

#[test]
fn allocating_logger_at_trace_level() {
  log::set_logger(&LOGGER).unwrap();
  log::set_max_level(LevelFilter::Trace);

  let squares: Vec<u64> = (0..100).map(|i| i * i).collect();
  let joined = squares
    .iter()
    .map(u64::to_string)
    .collect::<Vec<_>>()
    .join(",");
  log::info!("sum={} len={}", squares.iter().sum::<u64>(), joined.len());
  drop(joined);
  drop(squares);

  let lines = LINES.lock().unwrap();
  assert!(lines.iter().any(|l| l.starts_with("INFO sum=328350 ")));
  drop(lines);

  assert_eq!(GLOBAL.dropped_frees(), 0);
  assert!(GLOBAL.check_heap_corruption());
  assert!(GLOBAL.check_fragment_chain());
}
