use std::collections::VecDeque;

/// Sliding window of request outcomes. Bootstrap backs off while no request
/// in the window has succeeded.
pub struct Throttle {
    samples: VecDeque<bool>,
    successes: usize,
}

impl Throttle {
    pub fn new(size: usize) -> Self {
        debug_assert!(size > 0);
        Self {
            samples: std::iter::repeat(true).take(size).collect(),
            successes: size,
        }
    }

    pub fn throttled(&self) -> bool {
        self.successes == 0
    }

    pub fn add(&mut self, sample: bool) {
        debug_assert!(!self.samples.is_empty());
        self.pop();
        self.samples.push_back(sample);
        if sample {
            self.successes += 1;
        }
    }

    /// Shrinking pops the oldest samples; growing appends failures.
    pub fn resize(&mut self, size: usize) {
        debug_assert!(size > 0);
        while size < self.samples.len() {
            self.pop();
        }
        while size > self.samples.len() {
            self.samples.push_back(false);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn successes(&self) -> usize {
        self.successes
    }

    fn pop(&mut self) {
        if let Some(sample) = self.samples.pop_front() {
            if sample {
                self.successes -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unthrottled() {
        let throttle = Throttle::new(2);
        assert!(!throttle.throttled());
        assert_eq!(throttle.successes(), 2);
    }

    #[test]
    fn throttles_after_window_of_failures() {
        let mut throttle = Throttle::new(2);
        throttle.add(false);
        assert!(!throttle.throttled());
        throttle.add(false);
        assert!(throttle.throttled());
    }

    #[test]
    fn resize_up_appends_failures() {
        let mut throttle = Throttle::new(2);
        throttle.add(false);
        throttle.resize(4);
        assert!(!throttle.throttled());
        throttle.add(false);
        assert!(throttle.throttled());
    }

    #[test]
    fn resize_down_pops_oldest() {
        let mut throttle = Throttle::new(4);
        throttle.add(false);
        assert!(!throttle.throttled());
        throttle.resize(2);
        assert!(!throttle.throttled());
        throttle.add(false);
        assert!(throttle.throttled());
    }

    #[test]
    fn success_resets_backoff() {
        let mut throttle = Throttle::new(2);
        throttle.add(false);
        throttle.add(false);
        assert!(throttle.throttled());
        throttle.add(true);
        assert!(!throttle.throttled());
    }
}
