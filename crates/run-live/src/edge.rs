//! Falling-edge trigger for reconnect logic.
//!
//! A channel's setup step is keyed on `count()`, never on the raw connected
//! flag it writes itself; keying on the flag would re-run setup on every
//! observation and never settle.

#[derive(Debug, Clone, Default)]
pub struct FallingEdge {
    previous: bool,
    fired: u64,
}

impl FallingEdge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current value; returns `true` only on a `true -> false` transition.
    pub fn observe(&mut self, current: bool) -> bool {
        let fell = self.previous && !current;
        self.previous = current;
        if fell {
            self.fired += 1;
        }
        fell
    }

    /// Overwrite the remembered value without firing, for transitions the
    /// owner caused itself (deliberate close).
    pub fn reset(&mut self, current: bool) {
        self.previous = current;
    }

    /// Monotonic number of falling edges seen so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_falling_edge() {
        let mut edge = FallingEdge::new();
        let fired: Vec<bool> = [true, true, false, false, true]
            .into_iter()
            .map(|value| edge.observe(value))
            .collect();
        assert_eq!(fired, vec![false, false, true, false, false]);
        assert_eq!(edge.count(), 1);
    }

    #[test]
    fn initial_false_is_not_an_edge() {
        let mut edge = FallingEdge::new();
        assert!(!edge.observe(false));
        assert!(!edge.observe(false));
        assert_eq!(edge.count(), 0);
    }

    #[test]
    fn reset_suppresses_self_inflicted_edge() {
        let mut edge = FallingEdge::new();
        edge.observe(true);
        edge.reset(false);
        assert!(!edge.observe(false));
        edge.observe(true);
        assert!(edge.observe(false));
        assert_eq!(edge.count(), 1);
    }
}
