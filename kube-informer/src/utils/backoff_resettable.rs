use std::time::Duration;

use backon::{Backoff, BackoffBuilder, ExponentialBuilder};

/// A [`Backoff`] that starts over from its shortest delay once the reflector makes progress
pub trait ResettableBackoff: Backoff {
    /// Start over from the shortest delay
    fn reset(&mut self);
}

/// Builds a fresh [`Backoff`] from `B` on the first delay after every [`reset`](ResettableBackoff::reset)
#[derive(Debug)]
pub struct ResettableBackoffWrapper<B: BackoffBuilder> {
    backoff_builder: B,
    current_backoff: Option<B::Backoff>,
}

impl<B: BackoffBuilder> ResettableBackoffWrapper<B> {
    /// Wrap `backoff_builder`, building a fresh backoff after every reset
    pub fn new(backoff_builder: B) -> Self {
        Self {
            backoff_builder,
            current_backoff: None,
        }
    }
}

impl<B: BackoffBuilder + Clone> Iterator for ResettableBackoffWrapper<B> {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.current_backoff
            .get_or_insert_with(|| self.backoff_builder.clone().build())
            .next()
    }
}

impl<B: BackoffBuilder + Clone> ResettableBackoff for ResettableBackoffWrapper<B> {
    fn reset(&mut self) {
        self.current_backoff = None;
    }
}

/// Capped, jittered exponential backoff used between failed list and watch attempts
///
/// Starts at `min`, doubles on every consecutive failure up to `max`, and never gives up.
#[derive(Debug, Clone)]
pub struct DefaultBackoff(ExponentialBuilder);

impl DefaultBackoff {
    /// Backoff bounded by `min` and `max`
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self(
            ExponentialBuilder::default()
                .with_min_delay(min)
                .with_max_delay(max)
                .with_factor(2.0)
                .without_max_times()
                .with_jitter(),
        )
    }

    /// Wrap into a backoff that can be [reset](ResettableBackoff::reset) after a success
    #[must_use]
    pub fn resettable(self) -> ResettableBackoffWrapper<ExponentialBuilder> {
        ResettableBackoffWrapper::new(self.0)
    }
}

impl Default for DefaultBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(800), Duration::from_secs(30))
    }
}
