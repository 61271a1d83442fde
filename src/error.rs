use thiserror::Error;

/// Why a backing buffer was rejected by [`RtsAlloc::init`](crate::RtsAlloc::init).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
  #[error("arena base pointer is null")]
  NullBase,
  #[error("arena base {addr:#x} is not aligned to {align} bytes")]
  Misaligned { addr: usize, align: usize },
  #[error("arena of {size} bytes is smaller than the minimum of {min} bytes")]
  TooSmall { size: usize, min: usize },
}

/// Failure to source or set up the memory behind a [`Heap`](crate::Heap).
#[derive(Debug, Error)]
pub enum HeapError {
  #[error("mmap of {size} bytes failed: {source}")]
  Map {
    size: usize,
    #[source]
    source: std::io::Error,
  },
  #[error(transparent)]
  Init(#[from] InitError),
}
