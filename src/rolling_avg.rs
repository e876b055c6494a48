use crate::circular_queue::CircularQueue;
use crate::math;

/// Short window of recent scalar samples (processing times, movement magnitudes).
#[derive(Debug, Clone)]
pub struct RollingAvg {
    history: CircularQueue<f64>,
}

impl RollingAvg {
    pub fn new(hcount: usize) -> Self {
        Self {
            history: CircularQueue::with_capacity(hcount),
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.history.clear();
    }

    #[inline]
    pub fn push(&mut self, value: f64) {
        if value.is_finite() {
            self.history.push(value);
        }
    }

    #[inline]
    pub fn mean(&self) -> Option<f64> {
        math::mean(self.history.iter().copied())
    }

    #[inline]
    pub fn percentile(&self, q: f64) -> Option<f64> {
        math::percentile(self.history.iter().copied(), q)
    }

    #[inline]
    pub fn last(&self) -> Option<f64> {
        self.history.newest().copied()
    }

    #[inline]
    pub fn num_samples(&self) -> usize {
        self.history.len()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }
}

/// Timestamped samples; rate is derived from the span between oldest and newest.
#[derive(Debug, Clone)]
pub struct RateMeter {
    stamps: CircularQueue<f64>,
}

impl RateMeter {
    pub fn new(hcount: usize) -> Self {
        Self {
            stamps: CircularQueue::with_capacity(hcount.max(2)),
        }
    }

    #[inline]
    pub fn tick(&mut self, ts: f64) {
        self.stamps.push(ts);
    }

    pub fn rate(&self) -> Option<f64> {
        let first = self.stamps.oldest()?;
        let last = self.stamps.newest()?;
        let dt = last - first;

        if self.stamps.len() < 2 || dt <= 0.0 {
            return None;
        }

        Some((self.stamps.len() - 1) as f64 / dt)
    }

    #[inline]
    pub fn clear(&mut self) {
        self.stamps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_forgets_old_samples() {
        let mut avg = RollingAvg::new(3);
        for v in [100.0, 1.0, 2.0, 3.0] {
            avg.push(v);
        }

        assert_eq!(avg.num_samples(), 3);
        assert_eq!(avg.mean(), Some(2.0));
        assert_eq!(avg.last(), Some(3.0));
    }

    #[test]
    fn rate_from_evenly_spaced_ticks() {
        let mut m = RateMeter::new(10);
        assert_eq!(m.rate(), None);

        for i in 0..5 {
            m.tick(i as f64 * 0.1);
        }

        approx::assert_abs_diff_eq!(m.rate().unwrap(), 10.0, epsilon = 1e-9);
    }
}
