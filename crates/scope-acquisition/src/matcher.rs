//! Incremental matching of timing-bus events to hardware trigger pulses.
//!
//! Events arrive over a timing bus with a global timestamp; pulses are
//! sample offsets detected in the acquired signal. The matcher pairs them
//! one-to-one, tolerating clock drift, pulses without events, events without
//! pulses, and events whose pulse has not been sampled yet.
//!
//! ```text
//!  idx                  123456789012345678901234567890
//!                              ┌─┐       ┌─┐      ┌──┐
//!  pulse                ───────┘ └───────┘ └──────┘  └─
//!  pulse offsets               2                  3
//!  event                x   x  x    x             xx       x
//!  evt0 ────────────────┘   │  │    │             ││       │  outdated, dropped with a diagnostic
//!  evtA ────────────────────┘  │    │             ││       │  no pulse expected and no anchor yet: held
//!  evt1 ───────────────────────┘    │             ││       │  regular match, becomes the anchor
//!  evtB ────────────────────────────┘             ││       │  no pulse expected, realigned against the anchor
//!                                        !        ││       │  pulse without event, published as UNKNOWN_EVENT
//!  evt4 ──────────────────────────────────────────┘│       │  first of two overlapping pulses, regular match
//!  evt5 ───────────────────────────────────────────┘       │  overlapping, realigned against the anchor
//!  evt6 ───────────────────────────────────────────────────┘  pulse not yet sampled, retained for the next chunk
//! ```
//!
//! The only state carried across calls is the anchor: the last matched
//! (pulse index, event bus time) pair, re-based to the next chunk's origin
//! before each return. Everything at or past the returned
//! `processed_samples` boundary must be re-presented on the next call.

use scope_core::data::{Tag, TagPayload, TimingEvent};
use serde_json::Value;
use tracing::trace;

/// How far the pulse index realigned from the anchor may deviate from the
/// actually detected pulse before a mis-anchoring diagnostic is emitted.
const INDEX_TOLERANCE: u64 = 3;

/// Outcome of one [`TimingMatcher::match_chunk`] pass.
#[derive(Debug, Default)]
pub struct MatchResult {
    /// Leading events the caller may drop from its pending list.
    pub processed_events: usize,
    /// Samples the caller may advance past; everything at or beyond this
    /// boundary must be re-presented unmodified on the next call.
    pub processed_samples: usize,
    /// Output tags, indices relative to the current chunk, non-decreasing.
    pub tags: Vec<Tag>,
    /// Diagnostics for dropped, malformed or suspicious inputs.
    pub messages: Vec<String>,
}

/// Events examined but not yet consumable because no anchor exists.
///
/// Held entries stay front-contiguous with the unconsumed prefix of the
/// input slice so `processed_events` can remain a plain prefix length.
/// `Drop` marks an entry (malformed or outdated) that is consumed without
/// producing a tag once the entries before it are resolved.
enum Held {
    Realign(TimingEvent),
    Drop,
}

/// Stateful event/pulse matcher for one trigger-channel pipeline.
pub struct TimingMatcher {
    /// Maximum clock skew between an event's bus timestamp and its pulse.
    pub timeout_ns: u64,
    /// Acquisition sample rate in Hz.
    pub sample_rate: f64,
    /// Anchor: index of the last matched pulse relative to the next
    /// unprocessed chunk, and the matched event's bus time in ns.
    last_matched: Option<(i64, u64)>,
}

impl TimingMatcher {
    pub fn new(timeout_ns: u64, sample_rate: f64) -> Self {
        Self {
            timeout_ns,
            sample_rate,
            last_matched: None,
        }
    }

    /// Forget the anchor. Must be called when the sample stream has a gap
    /// (dropped samples, overrun, re-arm), since the anchor index is only
    /// meaningful over a contiguous stream.
    pub fn reset(&mut self) {
        self.last_matched = None;
    }

    /// Place an event relative to the anchor by linear extrapolation over
    /// the bus timebase. Returns the chunk-relative index and the
    /// fractional sample remainder, or `None` when the event falls before
    /// the current chunk or no anchor exists.
    fn align_to_anchor(&self, event: &TimingEvent) -> Option<(u64, f32)> {
        let (anchor_idx, anchor_time_ns) = self.last_matched?;
        let target_ns = event.time_ns as f64 + f64::from(event.offset_ns);
        let delta_samples = (target_ns - anchor_time_ns as f64) * 1e-9 * self.sample_rate;
        let delta_idx = delta_samples.floor() as i64;
        let frac = (delta_samples - delta_idx as f64) as f32;
        let idx = anchor_idx + delta_idx;
        if idx < 0 {
            return None;
        }
        Some((idx as u64, frac))
    }

    /// Split the event's sub-sample offset into a whole-sample shift and a
    /// fractional remainder in `[0, 1)` samples.
    fn offset_adjusted_tag(&self, flank_index: usize, event: TimingEvent) -> Tag {
        let delta_samples = f64::from(event.offset_ns) * 1e-9 * self.sample_rate;
        let mut offset_idx = delta_samples.trunc() as i64;
        let mut frac = (delta_samples - offset_idx as f64) as f32;
        if frac < 0.0 {
            offset_idx -= 1;
            frac += 1.0;
        }
        let index = (flank_index as i64 + offset_idx).max(0) as u64;
        Tag::new(
            index,
            TagPayload::Timing {
                event,
                offset_samples: frac,
            },
        )
    }

    fn unknown_event_tag(index: usize, local_time_ns: u64) -> Tag {
        Tag::new(index as u64, TagPayload::UnknownEvent { local_time_ns })
    }

    /// Match pending `events` against the `pulses` detected in the current
    /// chunk of `n_samples` samples starting at `chunk_start_ns`.
    ///
    /// Single pass over two cursors. Never fails: malformed input degrades
    /// to a diagnostic message, not an error.
    pub fn match_chunk(
        &mut self,
        events: &[Value],
        pulses: &[usize],
        n_samples: usize,
        chunk_start_ns: u64,
    ) -> MatchResult {
        let mut result = MatchResult::default();
        let ts_ns = 1e9 / self.sample_rate;
        let timeout_samples = (self.timeout_ns as f64 * 1e-9 * self.sample_rate) as usize;
        // consume at least everything before the matching deadline
        let safe_samples = n_samples.saturating_sub(timeout_samples);
        result.processed_samples = safe_samples;
        let chunk_end_ns = chunk_start_ns + (n_samples as f64 * ts_ns) as u64;

        let mut pulse_cursor = 0usize;
        let mut held: Vec<Held> = Vec::new();

        while result.processed_events + held.len() < events.len() || pulse_cursor < pulses.len() {
            if result.processed_events + held.len() >= events.len() {
                // all events examined, only pulses left
                let flank_index = pulses[pulse_cursor];
                let flank_time_ns = chunk_start_ns + (ts_ns * flank_index as f64) as u64;
                if flank_index >= safe_samples {
                    // too recent, its event may still arrive
                    break;
                }
                match result.tags.last() {
                    Some(last) if last.index > flank_index as u64 => {
                        // a realigned event already claimed a later position
                        result.messages.push(format!(
                            "cannot publish UNKNOWN_EVENT at {flank_index}, a tag was already published at {}",
                            last.index
                        ));
                    }
                    _ => result
                        .tags
                        .push(Self::unknown_event_tag(flank_index, flank_time_ns)),
                }
                pulse_cursor += 1;
                continue;
            }

            let raw = &events[result.processed_events + held.len()];
            let event = match TimingEvent::from_value(raw) {
                Ok(event) => event,
                Err(e) => {
                    result.messages.push(format!("invalid timing event: {e}"));
                    if held.is_empty() {
                        result.processed_events += 1;
                    } else {
                        held.push(Held::Drop);
                    }
                    continue;
                }
            };

            if pulse_cursor >= pulses.len() {
                // events left but no more pulses in this chunk
                if event.local_time_ns.saturating_add(self.timeout_ns) < chunk_end_ns {
                    // the pulse cannot still arrive
                    if self.last_matched.is_some() {
                        match self.align_to_anchor(&event) {
                            Some((idx, _)) if idx as usize >= result.processed_samples => {
                                // lands beyond this chunk, handle next call
                                break;
                            }
                            Some((idx, frac)) => {
                                result.processed_samples =
                                    result.processed_samples.max(idx as usize);
                                result.tags.push(Tag::new(
                                    idx,
                                    TagPayload::Timing {
                                        event,
                                        offset_samples: frac,
                                    },
                                ));
                            }
                            None => result
                                .messages
                                .push(format!("failed to realign event '{}'", event.name)),
                        }
                        result.processed_events += 1;
                    } else {
                        held.push(Held::Realign(event));
                    }
                    continue;
                }
                // deadline not reached, retain for the next chunk
                break;
            }

            let flank_index = pulses[pulse_cursor];
            let flank_time_ns = chunk_start_ns + (ts_ns * flank_index as f64) as u64;

            if event.local_time_ns.saturating_add(self.timeout_ns) < chunk_start_ns {
                // event predates the chunk, can never be matched
                result
                    .messages
                    .push(format!("dropping outdated event '{}'", event.name));
                if held.is_empty() {
                    result.processed_events += 1;
                } else {
                    held.push(Held::Drop);
                }
                continue;
            }

            if !event.hw_trigger
                || event.local_time_ns.saturating_add(self.timeout_ns) < flank_time_ns
            {
                // no pulse expected, or the next pulse is too far away
                if self.last_matched.is_some() {
                    match self.align_to_anchor(&event) {
                        Some((idx, frac)) => {
                            result.processed_samples = result.processed_samples.max(idx as usize);
                            result.tags.push(Tag::new(
                                idx,
                                TagPayload::Timing {
                                    event,
                                    offset_samples: frac,
                                },
                            ));
                        }
                        None => result
                            .messages
                            .push(format!("failed to realign event '{}'", event.name)),
                    }
                    result.processed_events += 1;
                } else {
                    held.push(Held::Realign(event));
                }
                continue;
            }

            if flank_time_ns.saturating_add(self.timeout_ns) < event.local_time_ns {
                // pulse with no event within the timeout
                result
                    .tags
                    .push(Self::unknown_event_tag(flank_index, flank_time_ns));
                result.processed_samples = result.processed_samples.max(flank_index);
                pulse_cursor += 1;
                continue;
            }

            // regular match: this pulse belongs to this event
            if let Some((diag_idx, _)) = self.align_to_anchor(&event) {
                if diag_idx.abs_diff(flank_index as u64) > INDEX_TOLERANCE {
                    result.messages.push(format!(
                        "possible mis-anchoring: realigned index {diag_idx} deviates from pulse index {flank_index} by more than {INDEX_TOLERANCE}"
                    ));
                }
            }
            self.last_matched = Some((flank_index as i64, event.time_ns));
            trace!(
                event = %event.name,
                pulse_index = flank_index,
                "matched timing event to hardware pulse"
            );
            // retroactively realign everything held back until this anchor
            for entry in held.drain(..) {
                if let Held::Realign(held_event) = entry {
                    match self.align_to_anchor(&held_event) {
                        Some((idx, frac)) => result.tags.push(Tag::new(
                            idx,
                            TagPayload::Timing {
                                event: held_event,
                                offset_samples: frac,
                            },
                        )),
                        None => result
                            .messages
                            .push(format!("failed to realign event '{}'", held_event.name)),
                    }
                }
                result.processed_events += 1;
            }
            result.tags.push(self.offset_adjusted_tag(flank_index, event));
            result.processed_samples = result.processed_samples.max(flank_index);
            result.processed_events += 1;
            pulse_cursor += 1;
        }

        result.processed_samples = result.processed_samples.min(n_samples);

        // re-express the anchor relative to the start of the next chunk
        if let Some((idx, _)) = self.last_matched.as_mut() {
            *idx -= result.processed_samples as i64;
        }

        // drop held events that are too old to ever find an anchor; the
        // threshold is twice the timeout since one timeout is already spent
        // inside the unconsumed tail of this chunk
        let mut consumable = 0usize;
        for entry in &held {
            match entry {
                Held::Drop => consumable += 1,
                Held::Realign(event) => {
                    if event.local_time_ns.saturating_add(2 * self.timeout_ns) < chunk_end_ns {
                        result
                            .messages
                            .push(format!("dropping outdated unmatched event '{}'", event.name));
                        consumable += 1;
                    } else {
                        break;
                    }
                }
            }
        }
        result.processed_events += consumable;

        result
    }
}
