//! Retransmission timeout estimate

use std::time::Duration;

/// Floor of the variance term
const CLOCK_GRANULARITY: Duration = Duration::from_millis(10);

/// Jacobson/Karels round trip estimator
///
/// `RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - R|`, `SRTT = 7/8 SRTT + 1/8 R`,
/// `RTO = SRTT + max(G, 4 RTTVAR)`, clamped to `[min, max]`.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min: Duration,
    max: Duration,
}

impl RttEstimator {
    /// Create an estimator with no samples
    pub fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial.clamp(min, max),
            min,
            max,
        }
    }

    /// Current retransmission timeout
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed round trip time, if any sample was taken
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Feed one round trip sample
    pub fn update(&mut self, sample: Duration) {
        let srtt = match self.srtt {
            None => {
                self.rttvar = sample / 2;
                sample
            }
            Some(srtt) => {
                let diff = if srtt > sample {
                    srtt - sample
                } else {
                    sample - srtt
                };
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
                srtt * 7 / 8 + sample / 8
            }
        };
        self.srtt = Some(srtt);
        self.rto = (srtt + (self.rttvar * 4).max(CLOCK_GRANULARITY)).clamp(self.min, self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> RttEstimator {
        RttEstimator::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_initial_rto() {
        let rtt = estimator();
        assert_eq!(rtt.rto(), Duration::from_millis(100));
        assert!(rtt.srtt().is_none());
    }

    #[test]
    fn test_smoothing() {
        let mut rtt = estimator();
        rtt.update(Duration::from_millis(200));
        assert_eq!(rtt.srtt(), Some(Duration::from_millis(200)));
        // 200 + 4 * 100
        assert_eq!(rtt.rto(), Duration::from_millis(600));

        rtt.update(Duration::from_millis(280));
        let srtt = rtt.srtt().unwrap();
        assert!(srtt > Duration::from_millis(200));
        assert!(srtt < Duration::from_millis(280));
    }

    #[test]
    fn test_clamped() {
        let mut rtt = estimator();
        rtt.update(Duration::from_millis(1));
        assert_eq!(rtt.rto(), Duration::from_millis(100));

        rtt.update(Duration::from_secs(5));
        assert_eq!(rtt.rto(), Duration::from_secs(1));
    }
}
