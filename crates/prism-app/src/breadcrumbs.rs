//! Fixed-size trail of the most recent frame steps.
//!
//! Every step of the frame loop drops a breadcrumb. When the device is lost
//! the trail is dumped to the log so the last thing the CPU asked of the GPU
//! is visible.

use tracing::error;

/// Capacity of the trail (must be power of 2).
const TRAIL_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breadcrumb {
    pub frame: u64,
    pub slot: usize,
    pub step: &'static str,
}

impl Breadcrumb {
    const EMPTY: Self = Self {
        frame: 0,
        slot: 0,
        step: "",
    };
}

/// Ring of breadcrumbs that overwrites the oldest entry once full.
pub struct Breadcrumbs {
    trail: [Breadcrumb; TRAIL_SIZE],
    head: usize,
    len: usize,
}

impl Default for Breadcrumbs {
    fn default() -> Self {
        Self::new()
    }
}

impl Breadcrumbs {
    #[must_use]
    pub fn new() -> Self {
        Self {
            trail: [Breadcrumb::EMPTY; TRAIL_SIZE],
            head: 0,
            len: 0,
        }
    }

    pub fn record(&mut self, frame: u64, slot: usize, step: &'static str) {
        self.trail[self.head] = Breadcrumb { frame, slot, step };
        self.head = (self.head + 1) & (TRAIL_SIZE - 1);
        self.len = (self.len + 1).min(TRAIL_SIZE);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Most recent breadcrumb.
    #[must_use]
    pub fn last(&self) -> Option<&Breadcrumb> {
        if self.len == 0 {
            return None;
        }
        Some(&self.trail[self.head.wrapping_sub(1) & (TRAIL_SIZE - 1)])
    }

    /// Breadcrumbs from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Breadcrumb> {
        let start = self.head.wrapping_sub(self.len) & (TRAIL_SIZE - 1);
        (0..self.len).map(move |i| &self.trail[(start + i) & (TRAIL_SIZE - 1)])
    }

    /// Log the whole trail at error level.
    pub fn dump(&self) {
        error!("Last {} frame steps before device loss:", self.len);
        for crumb in self.iter() {
            error!("  frame {} slot {}: {}", crumb.frame, crumb.slot, crumb.step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let mut crumbs = Breadcrumbs::new();
        assert!(crumbs.is_empty());
        assert!(crumbs.last().is_none());

        crumbs.record(0, 0, "wait");
        crumbs.record(0, 0, "acquire");
        crumbs.record(0, 0, "submit");

        let steps: Vec<_> = crumbs.iter().map(|c| c.step).collect();
        assert_eq!(steps, ["wait", "acquire", "submit"]);
        assert_eq!(crumbs.last().unwrap().step, "submit");
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut crumbs = Breadcrumbs::new();
        for frame in 0..(TRAIL_SIZE as u64 + 10) {
            crumbs.record(frame, (frame % 3) as usize, "present");
        }

        assert_eq!(crumbs.len(), TRAIL_SIZE);
        let frames: Vec<_> = crumbs.iter().map(|c| c.frame).collect();
        assert_eq!(frames.first(), Some(&10));
        assert_eq!(frames.last(), Some(&(TRAIL_SIZE as u64 + 9)));
        assert!(frames.windows(2).all(|w| w[0] + 1 == w[1]));
    }
}
