//! Software trigger edge detection over calibrated sample windows.
//!
//! A classic Schmitt comparator: the detector fires once when the signal
//! crosses the threshold in the configured direction and re-arms only after
//! the signal has left the hysteresis band on the other side. This keeps a
//! noisy signal hovering around the threshold from producing a burst of
//! spurious edges.
//!
//! The comparator state is a single bit carried by the caller across
//! windows, so overlapping or re-presented windows can be rescanned with a
//! state seeded from the first sample instead of the stale carry-over.

use scope_core::config::TriggerDirection;

/// Which side of the threshold the comparator last settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    /// Below threshold, armed for a rising edge.
    ArmedLow,
    /// At or above threshold, armed for a falling edge.
    ArmedHigh,
}

impl TriggerState {
    /// Derive the state implied by the first sample of a window.
    ///
    /// Used when a window is re-presented after a partial consume: an edge
    /// strictly inside the window is still found, while a signal that starts
    /// already beyond the threshold does not fire at offset zero.
    pub fn seeded_from(first_sample: f32, threshold: f32) -> Self {
        if first_sample >= threshold {
            TriggerState::ArmedHigh
        } else {
            TriggerState::ArmedLow
        }
    }
}

/// Hysteresis edge detector for one trigger source.
#[derive(Debug, Clone, Copy)]
pub struct EdgeDetector {
    pub threshold: f32,
    /// Width of the hysteresis band below (rising) or above (falling) the
    /// threshold that the signal must leave before the comparator re-arms.
    pub band: f32,
    pub direction: TriggerDirection,
}

impl EdgeDetector {
    pub fn new(threshold: f32, band: f32, direction: TriggerDirection) -> Self {
        Self {
            threshold,
            band,
            direction,
        }
    }

    /// Scan `window` and return the offsets of qualifying edges,
    /// updating `state` in place.
    ///
    /// Single pass, no look-ahead. `High` behaves like `Rising` and `Low`
    /// like `Falling`; they exist so configs can express level-style intent.
    pub fn scan(&self, window: &[f32], state: &mut TriggerState) -> Vec<usize> {
        let mut edges = Vec::new();
        match self.direction {
            TriggerDirection::Rising | TriggerDirection::High => {
                for (i, &s) in window.iter().enumerate() {
                    match *state {
                        TriggerState::ArmedLow => {
                            if s >= self.threshold {
                                edges.push(i);
                                *state = TriggerState::ArmedHigh;
                            }
                        }
                        TriggerState::ArmedHigh => {
                            if s <= self.threshold - self.band {
                                *state = TriggerState::ArmedLow;
                            }
                        }
                    }
                }
            }
            TriggerDirection::Falling | TriggerDirection::Low => {
                for (i, &s) in window.iter().enumerate() {
                    match *state {
                        TriggerState::ArmedHigh => {
                            if s <= self.threshold {
                                edges.push(i);
                                *state = TriggerState::ArmedLow;
                            }
                        }
                        TriggerState::ArmedLow => {
                            if s >= self.threshold + self.band {
                                *state = TriggerState::ArmedHigh;
                            }
                        }
                    }
                }
            }
        }
        edges
    }
}
