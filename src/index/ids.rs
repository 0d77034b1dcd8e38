use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Issues strictly increasing point ids seeded from the wall clock.
///
/// `next = max(now_micros, last + 1)`, so ids never repeat within a process and
/// a restart resumes above earlier ids unless the clock went backwards.
/// Allocators in different processes do not coordinate; one writer per
/// collection is assumed.
#[derive(Debug, Default)]
pub struct PointIdAllocator {
    last: AtomicU64,
}

impl PointIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        let now = now_micros();
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current.saturating_add(1));
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }

    /// Reserves `count` consecutive ids.
    pub fn next_ids(&self, count: usize) -> Vec<u64> {
        if count == 0 {
            return Vec::new();
        }
        let span = count as u64;
        let now = now_micros();
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let first = now.max(current.saturating_add(1));
            let last = first.saturating_add(span - 1);
            match self
                .last
                .compare_exchange_weak(current, last, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return (first..=last).collect(),
                Err(observed) => current = observed,
            }
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
