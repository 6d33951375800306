use std::time::Duration;

use tokio::time::Instant;

/// Single-shot deadline. Stopping an idle timer is a no-op and restarting a
/// running one replaces its deadline.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub(crate) struct Timer(Option<Instant>);

impl Timer {
    /// Starts or restarts the timer.
    #[inline]
    pub fn start(&mut self, d: Duration) {
        self.0 = Some(Instant::now() + d);
    }

    /// Starts the timer unless it is already running. This is used for
    /// debouncing, where repeated triggers must not postpone the first one.
    #[inline]
    pub fn start_once(&mut self, d: Duration) {
        if self.0.is_none() {
            self.start(d);
        }
    }

    /// Stops the timer.
    #[inline(always)]
    pub fn stop(&mut self) {
        self.0 = None;
    }

    /// Returns whether the timer is running.
    #[inline(always)]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.0.is_some()
    }

    /// Returns the current deadline.
    #[inline(always)]
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.0
    }

    /// Stops the timer and returns `true` if its deadline is at or before
    /// `now`.
    #[inline]
    pub fn expire(&mut self, now: Instant) -> bool {
        let exp = matches!(self.0, Some(t) if t <= now);
        if exp {
            self.0 = None;
        }
        exp
    }
}

/// Returns the earliest of the specified deadlines.
#[inline]
pub(crate) fn earliest(it: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    it.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer() {
        let mut t = Timer::default();
        assert!(!t.is_active());
        assert!(!t.expire(Instant::now()));

        t.start(Duration::from_secs(10));
        let d = t.deadline().unwrap();
        t.start_once(Duration::from_secs(1));
        assert_eq!(t.deadline(), Some(d));
        assert!(!t.expire(Instant::now()));
        assert!(t.expire(d));
        assert!(!t.is_active());
        t.stop();

        assert_eq!(earliest([None, Some(d), None]), Some(d));
        assert_eq!(earliest([None]), None);
    }
}
