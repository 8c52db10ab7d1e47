use std::time::Duration;

/// Running statistics of a series of timings.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Statistics {
    pub n: usize,
    sum: f64,
    sum_sq: f64,
}

impl Statistics {
    pub fn add(&mut self, value: f64) {
        self.n += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn add_duration(&mut self, elapsed: Duration) {
        self.add(elapsed.as_secs_f64() * 1e3);
    }

    pub fn merge(&mut self, other: &Statistics) {
        self.n += other.n;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.sum / self.n as f64
    }

    pub fn rms(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_sq / self.n as f64 - mean * mean).max(0.0).sqrt()
    }

    /// Standard error of the mean.
    pub fn error(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.rms() / (self.n as f64).sqrt()
    }
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:8.3} +- {:7.3} ms  RMS: {:7.3} ms  N: {}",
            self.mean(),
            self.error(),
            self.rms(),
            self.n
        )
    }
}
