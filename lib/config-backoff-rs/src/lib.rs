use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoff;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Controls an exponential backoff that can be loaded from a config file
#[derive(Default, Debug, Deserialize, Clone)]
pub struct Backoff {
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub multiplier: f64,
}

impl Backoff {
    pub fn build(&self) -> ExponentialBackoff {
        self.into()
    }
}

impl<'a> Into<ExponentialBackoff> for &'a Backoff {
    fn into(self) -> ExponentialBackoff {
        let mut eb = ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            max_elapsed_time: Some(self.duration),
            ..ExponentialBackoff::default()
        };
        eb.reset();
        eb
    }
}

/// Error returned once a backoff policy has elapsed its maximum duration
/// without the wrapped operation recovering
#[derive(Debug, thiserror::Error)]
#[error("backoff policy elapsed its maximum duration without recovering")]
pub struct BackoffExhausted;

/// Represents a reconnection backoff utility wrapper
/// for a long-running task that should use an exponential backoff
/// when multiple failures occur in short succession,
/// but reset the backoff if the task has been running for a long time
/// (greater than the threshold)
#[derive(Debug)]
pub struct ReconnectionState {
    current: ExponentialBackoff,
    last_start: Option<Instant>,
    threshold: Duration,
}

impl ReconnectionState {
    pub const fn new(source: ExponentialBackoff, threshold: Duration) -> Self {
        Self {
            current: source,
            last_start: None,
            threshold,
        }
    }

    /// Produces the delay to sleep for before the next attempt,
    /// or `None` if the attempt should be made immediately
    /// (which is always the case for the very first attempt).
    /// Marks the start of the next iteration as a side effect.
    pub fn next_delay(&mut self) -> Result<Option<Duration>, BackoffExhausted> {
        let delay = match self.last_start {
            None => None,
            Some(last_start) => {
                let running_time = Instant::now().duration_since(last_start);
                if running_time > self.threshold {
                    // The running time was longer than the threshold to use the old backoff,
                    // so reset it with the source backoff (from the config)
                    self.current.reset();
                }

                match self.current.next_backoff() {
                    None => return Err(BackoffExhausted),
                    Some(backoff) => Some(backoff),
                }
            }
        };

        // Mark the start of the next iteration
        self.last_start = Some(Instant::now());
        Ok(delay)
    }
}
