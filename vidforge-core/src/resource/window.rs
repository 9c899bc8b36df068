use std::collections::VecDeque;

/// Rolling window of samples. The controller keeps ~120 samples at a 5s
/// interval, i.e. a 10 minute window.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_sample_past_capacity() {
        let mut w = RollingWindow::new(3);
        w.push(1.0);
        w.push(2.0);
        w.push(3.0);
        assert_eq!(w.average(), 2.0);
        w.push(9.0);
        assert_eq!(w.len(), 3);
        assert_eq!(w.average(), (2.0 + 3.0 + 9.0) / 3.0);
    }

    #[test]
    fn empty_window_averages_to_zero() {
        let w = RollingWindow::new(10);
        assert_eq!(w.average(), 0.0);
    }
}
