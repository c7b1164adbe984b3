//! Insert/sample rate limiting
//!
//! Couples producer and consumer throughput. Below `min_size_to_sample` items the
//! limiter admits every insert and refuses every sample. Above it, the running error
//! `inserts × samples_per_insert − samples` must stay inside
//! `[offset − error_buffer, offset + error_buffer]` where
//! `offset = samples_per_insert × min_size_to_sample`; the side that would push the
//! error outside that window is held back.

use relay_common::StoreError;
use serde::{Deserialize, Serialize};

/// Rate limiter policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimiterConfig {
    /// Block sampling until the table holds `min_size` items; never block inserts
    MinSize { min_size: u64 },
    /// Hold the sample:insert ratio near `samples_per_insert`
    SampleToInsertRatio {
        samples_per_insert: f64,
        min_size_to_sample: u64,
        error_buffer: f64,
    },
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig::MinSize { min_size: 1 }
    }
}

/// Completed-call counters and the admission window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiter {
    samples_per_insert: f64,
    min_size_to_sample: u64,
    min_diff: f64,
    max_diff: f64,
    inserts: u64,
    samples: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self, StoreError> {
        let limiter = match config {
            RateLimiterConfig::MinSize { min_size } => Self {
                samples_per_insert: 1.0,
                min_size_to_sample: min_size,
                min_diff: f64::MIN,
                max_diff: f64::MAX,
                inserts: 0,
                samples: 0,
            },
            RateLimiterConfig::SampleToInsertRatio {
                samples_per_insert,
                min_size_to_sample,
                error_buffer,
            } => {
                if samples_per_insert.is_nan() || samples_per_insert <= 0.0 {
                    return Err(StoreError::InvalidConfig(format!(
                        "samples_per_insert must be positive, got {samples_per_insert}"
                    )));
                }
                let offset = samples_per_insert * min_size_to_sample as f64;
                let min_diff = offset - error_buffer;
                let max_diff = offset + error_buffer;
                let required = 2.0 * samples_per_insert.max(1.0);
                if max_diff - min_diff < required {
                    return Err(StoreError::InvalidConfig(format!(
                        "error_buffer {error_buffer} too small: window {} must be at least {required}",
                        max_diff - min_diff
                    )));
                }
                Self {
                    samples_per_insert,
                    min_size_to_sample,
                    min_diff,
                    max_diff,
                    inserts: 0,
                    samples: 0,
                }
            }
        };

        if limiter.min_size_to_sample == 0 {
            return Err(StoreError::InvalidConfig(
                "min_size_to_sample must be at least 1".into(),
            ));
        }
        Ok(limiter)
    }

    /// Whether one more insert may proceed with the table holding `size` items
    pub fn can_insert(&self, size: u64) -> bool {
        if size < self.min_size_to_sample {
            return true;
        }
        let diff = (self.inserts + 1) as f64 * self.samples_per_insert - self.samples as f64;
        diff <= self.max_diff
    }

    /// Whether one more sample may proceed with the table holding `size` items
    pub fn can_sample(&self, size: u64) -> bool {
        if size < self.min_size_to_sample {
            return false;
        }
        let diff = self.inserts as f64 * self.samples_per_insert - (self.samples + 1) as f64;
        diff >= self.min_diff
    }

    /// Most samples that can ever be admitted back to back without an insert in between
    pub fn max_sample_burst(&self) -> f64 {
        (self.max_diff - self.min_diff).floor()
    }

    pub fn on_insert(&mut self) {
        self.inserts += 1;
    }

    pub fn on_sample(&mut self) {
        self.samples += 1;
    }

    pub fn inserts(&self) -> u64 {
        self.inserts
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn min_size_to_sample(&self) -> u64 {
        self.min_size_to_sample
    }

    pub fn reset(&mut self) {
        self.inserts = 0;
        self.samples = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ratio(spi: f64, min_size: u64, error_buffer: f64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig::SampleToInsertRatio {
            samples_per_insert: spi,
            min_size_to_sample: min_size,
            error_buffer,
        })
        .unwrap()
    }

    #[test]
    fn test_min_size_never_blocks_inserts() {
        let mut limiter = RateLimiter::new(RateLimiterConfig::MinSize { min_size: 3 }).unwrap();
        for size in 0..100 {
            assert!(limiter.can_insert(size));
            limiter.on_insert();
        }
        assert!(!limiter.can_sample(2));
        assert!(limiter.can_sample(3));
    }

    #[test]
    fn test_max_sample_burst() {
        // window [-1, 3]: from the top, four samples fit before the floor
        let mut limiter = ratio(1.0, 1, 2.0);
        assert_eq!(limiter.max_sample_burst(), 4.0);
        for _ in 0..3 {
            limiter.on_insert();
        }
        let mut burst = 0;
        while limiter.can_sample(3) {
            limiter.on_sample();
            burst += 1;
        }
        assert_eq!(burst, 4);

        let min_size = RateLimiter::new(RateLimiterConfig::MinSize { min_size: 1 }).unwrap();
        assert!(min_size.max_sample_burst() > 1e12);
    }

    #[test]
    fn test_ratio_blocks_inserts_past_error_buffer() {
        // offset 1, window [-1, 3]
        let mut limiter = ratio(1.0, 1, 2.0);
        let mut size = 0;
        for _ in 0..3 {
            assert!(limiter.can_insert(size));
            limiter.on_insert();
            size += 1;
        }
        assert!(!limiter.can_insert(size));

        assert!(limiter.can_sample(size));
        limiter.on_sample();
        assert!(limiter.can_insert(size));
    }

    #[test]
    fn test_ratio_blocks_samples_when_consumer_ahead() {
        let mut limiter = ratio(1.0, 1, 2.0);
        limiter.on_insert();
        // diff after k samples is 1 - k; allowed while >= -1
        assert!(limiter.can_sample(1));
        limiter.on_sample();
        assert!(limiter.can_sample(1));
        limiter.on_sample();
        assert!(!limiter.can_sample(1));
    }

    #[test]
    fn test_small_error_buffer_rejected() {
        let err = RateLimiter::new(RateLimiterConfig::SampleToInsertRatio {
            samples_per_insert: 4.0,
            min_size_to_sample: 1,
            error_buffer: 3.0,
        });
        assert!(matches!(err, Err(StoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_min_size_rejected() {
        assert!(RateLimiter::new(RateLimiterConfig::MinSize { min_size: 0 }).is_err());
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut limiter = ratio(1.0, 1, 2.0);
        limiter.on_insert();
        limiter.on_sample();
        limiter.reset();
        assert_eq!((limiter.inserts(), limiter.samples()), (0, 0));
    }
}
