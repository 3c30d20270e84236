use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::error::Result;

/// Sliding-window memory of applied event fingerprints
#[async_trait]
pub trait EventFlagger: Send + Sync {
    /// Record a sighting of `fingerprint`
    ///
    /// Returns `false` without recording when the fingerprint has already been
    /// seen the threshold number of times inside the window.
    async fn check_and_flag(&self, fingerprint: &str) -> Result<bool>;

    /// Forget the most recent sighting, used when applying the event failed
    async fn unflag(&self, fingerprint: &str) -> Result<()>;
}

/// In-memory flagger with a time window and a bounded number of sightings
pub struct MessageFlagger {
    clock: Arc<dyn Clock>,
    window: Duration,
    capacity: usize,
    threshold: u32,
    state: Mutex<FlagState>,
}

#[derive(Default)]
struct FlagState {
    seen: HashMap<String, VecDeque<DateTime<Utc>>>,
    order: VecDeque<(DateTime<Utc>, String)>,
}

impl FlagState {
    fn forget_oldest(&mut self) {
        if let Some((at, fingerprint)) = self.order.pop_front() {
            if let Some(sightings) = self.seen.get_mut(&fingerprint) {
                if sightings.front() == Some(&at) {
                    sightings.pop_front();
                }
                if sightings.is_empty() {
                    self.seen.remove(&fingerprint);
                }
            }
        }
    }
}

impl MessageFlagger {
    pub fn new(clock: Arc<dyn Clock>, window: std::time::Duration, capacity: usize, threshold: u32) -> Self {
        Self {
            clock,
            window: crate::clock::chrono_duration(window),
            capacity: capacity.max(1),
            threshold: threshold.max(1),
            state: Mutex::new(FlagState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FlagState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventFlagger for MessageFlagger {
    async fn check_and_flag(&self, fingerprint: &str) -> Result<bool> {
        let now = self.clock.now();
        let cutoff = now - self.window;
        let mut state = self.state();

        while matches!(state.order.front(), Some((at, _)) if *at <= cutoff) {
            state.forget_oldest();
        }

        let count = state.seen.get(fingerprint).map_or(0, VecDeque::len);
        if count >= self.threshold as usize {
            return Ok(false);
        }

        state
            .seen
            .entry(fingerprint.to_string())
            .or_default()
            .push_back(now);
        state.order.push_back((now, fingerprint.to_string()));
        while state.order.len() > self.capacity {
            state.forget_oldest();
        }
        Ok(true)
    }

    async fn unflag(&self, fingerprint: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(sightings) = state.seen.get_mut(fingerprint) {
            sightings.pop_back();
            if sightings.is_empty() {
                state.seen.remove(fingerprint);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration as StdDuration;

    fn flagger(threshold: u32, capacity: usize) -> (MessageFlagger, ManualClock) {
        let clock = ManualClock::default();
        let flagger = MessageFlagger::new(
            Arc::new(clock.clone()),
            StdDuration::from_secs(60),
            capacity,
            threshold,
        );
        (flagger, clock)
    }

    #[tokio::test]
    async fn test_duplicate_inside_window_is_flagged() {
        let (flagger, clock) = flagger(1, 100);

        assert!(flagger.check_and_flag("fp").await.unwrap());
        clock.advance(Duration::seconds(59));
        assert!(!flagger.check_and_flag("fp").await.unwrap());
        assert!(flagger.check_and_flag("other").await.unwrap());
    }

    #[tokio::test]
    async fn test_window_expiry_allows_reapplication() {
        let (flagger, clock) = flagger(1, 100);

        assert!(flagger.check_and_flag("fp").await.unwrap());
        clock.advance(Duration::seconds(60));
        assert!(flagger.check_and_flag("fp").await.unwrap());
    }

    #[tokio::test]
    async fn test_threshold_counts_sightings() {
        let (flagger, _clock) = flagger(2, 100);

        assert!(flagger.check_and_flag("fp").await.unwrap());
        assert!(flagger.check_and_flag("fp").await.unwrap());
        assert!(!flagger.check_and_flag("fp").await.unwrap());
    }

    #[tokio::test]
    async fn test_unflag_forgets_latest_sighting() {
        let (flagger, _clock) = flagger(1, 100);

        assert!(flagger.check_and_flag("fp").await.unwrap());
        flagger.unflag("fp").await.unwrap();
        assert!(flagger.check_and_flag("fp").await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let (flagger, clock) = flagger(1, 2);

        flagger.check_and_flag("a").await.unwrap();
        clock.advance(Duration::seconds(1));
        flagger.check_and_flag("b").await.unwrap();
        clock.advance(Duration::seconds(1));
        flagger.check_and_flag("c").await.unwrap();

        assert_eq!(flagger.len(), 2);
        assert!(flagger.check_and_flag("a").await.unwrap());
        assert!(!flagger.check_and_flag("c").await.unwrap());
    }
}
