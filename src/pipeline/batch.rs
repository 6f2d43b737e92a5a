//! Bounded in-memory row buffer.

use std::time::{Duration, Instant};

use crate::types::TransformedRow;

/// Rows buffered before the sequencer flushes a batch.
pub const FLUSH_THRESHOLD: usize = 50_000;

/// Buffers transformed rows until the sequencer flushes them.
///
/// The accumulator also owns the start of the current accumulation window, so each flush can
/// report how long its rows took to gather.
#[derive(Debug)]
pub struct BatchAccumulator {
    rows: Vec<TransformedRow>,
    threshold: usize,
    window_start: Instant,
}

impl BatchAccumulator {
    /// # Panics
    ///
    /// Panics if `threshold == 0`.
    pub fn new(threshold: usize) -> Self {
        assert!(threshold > 0, "flush threshold must be > 0");
        Self {
            rows: Vec::new(),
            threshold,
            window_start: Instant::now(),
        }
    }

    pub fn push(&mut self, row: TransformedRow) {
        self.rows.push(row);
    }

    /// True once the buffer holds `threshold` rows.
    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.threshold
    }

    /// Move the buffered rows out and start a new window. The buffer is empty afterwards.
    pub fn take(&mut self) -> (Vec<TransformedRow>, Duration) {
        let elapsed = self.window_start.elapsed();
        let rows = std::mem::replace(&mut self.rows, Vec::with_capacity(self.threshold.min(4_096)));
        self.window_start = Instant::now();
        (rows, elapsed)
    }

    /// Start a new window without touching the buffer.
    pub fn restart_window(&mut self) {
        self.window_start = Instant::now();
    }
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        Self::new(FLUSH_THRESHOLD)
    }
}

/// `"850ms"` below one second, `"1.25s"` otherwise.
pub fn format_elapsed(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    if ms < 1_000 {
        format!("{ms}ms")
    } else {
        format!("{:.2}s", elapsed.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{format_elapsed, BatchAccumulator};
    use crate::types::Value;

    #[test]
    fn fills_at_threshold_and_take_empties() {
        let mut acc = BatchAccumulator::new(2);
        acc.push(vec![Value::Number(1.0)]);
        assert!(!acc.is_full());
        acc.push(vec![Value::Number(2.0)]);
        assert!(acc.is_full());

        let (rows, _) = acc.take();
        assert_eq!(rows.len(), 2);
        assert!(!acc.is_full());
        assert!(acc.take().0.is_empty());
    }

    #[test]
    #[should_panic(expected = "flush threshold must be > 0")]
    fn zero_threshold_is_rejected() {
        let _ = BatchAccumulator::new(0);
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(Duration::from_millis(850)), "850ms");
        assert_eq!(format_elapsed(Duration::from_millis(1_250)), "1.25s");
    }
}
