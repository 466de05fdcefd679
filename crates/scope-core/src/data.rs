//! Data model shared between the acquisition engine, the timing matcher,
//! and downstream consumers.
//!
//! Raw ADC data enters as [`RawChunk`]s, timing-bus messages enter as
//! loosely-typed JSON values and are structurally validated into
//! [`TimingEvent`]s, and everything the core publishes alongside the sample
//! streams is a [`Tag`].

use serde_json::Value;
use thiserror::Error;

// =============================================================================
// Raw sample chunks
// =============================================================================

/// One batch of raw ADC samples delivered by a driver in a single poll.
///
/// `samples` holds one vector of ADC codes per hardware channel (indexed by
/// driver channel index, not by configured channel id). All per-channel
/// vectors have the same length. `overflow` is a per-channel bitmask set
/// when the hardware's own buffer wrapped before retrieval.
#[derive(Debug, Clone, Default)]
pub struct RawChunk {
    pub samples: Vec<Vec<i16>>,
    /// Absolute sample offset of the first sample in this chunk.
    pub start_sample: u64,
    pub overflow: u16,
}

impl RawChunk {
    /// Number of samples per channel in this chunk.
    pub fn len(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Timing events
// =============================================================================

/// A timing event cannot be used because its wire representation does not
/// match the expected schema. Diagnostic only, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed timing event: {0}")]
pub struct MalformedTimingEvent(pub String);

/// A validated timing-bus message.
///
/// Wire schema (JSON object):
/// `{ "name": string, "time": u64 ns, "offset": f32 ns,
///    "meta": { "LOCAL-TIME": u64, "HW-TRIGGER": bool } }`
///
/// `time_ns` is the globally distributed trigger timestamp, `offset_ns` a
/// sub-sample shift the sender asks to be applied relative to the hardware
/// pulse, `local_time_ns` the timestamp on the acquisition host's clock, and
/// `hw_trigger` whether a corresponding hardware pulse is expected at all.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingEvent {
    pub name: String,
    pub time_ns: u64,
    pub offset_ns: f32,
    pub local_time_ns: u64,
    pub hw_trigger: bool,
}

impl TimingEvent {
    /// Structurally validates a raw bus message.
    ///
    /// All required fields must be present with the right types; anything
    /// else yields a [`MalformedTimingEvent`] naming the first missing or
    /// mistyped field.
    pub fn from_value(value: &Value) -> Result<Self, MalformedTimingEvent> {
        let obj = value
            .as_object()
            .ok_or_else(|| MalformedTimingEvent("payload is not an object".into()))?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| MalformedTimingEvent("missing or non-string 'name'".into()))?;
        let time_ns = obj
            .get("time")
            .and_then(Value::as_u64)
            .ok_or_else(|| MalformedTimingEvent("missing or non-u64 'time'".into()))?;
        let offset_ns = obj
            .get("offset")
            .and_then(Value::as_f64)
            .ok_or_else(|| MalformedTimingEvent("missing or non-numeric 'offset'".into()))?;
        let meta = obj
            .get("meta")
            .and_then(Value::as_object)
            .ok_or_else(|| MalformedTimingEvent("missing or non-object 'meta'".into()))?;
        let local_time_ns = meta
            .get("LOCAL-TIME")
            .and_then(Value::as_u64)
            .ok_or_else(|| MalformedTimingEvent("missing or non-u64 meta 'LOCAL-TIME'".into()))?;
        let hw_trigger = meta
            .get("HW-TRIGGER")
            .and_then(Value::as_bool)
            .ok_or_else(|| MalformedTimingEvent("missing or non-bool meta 'HW-TRIGGER'".into()))?;

        Ok(Self {
            name: name.to_string(),
            time_ns,
            offset_ns: offset_ns as f32,
            local_time_ns,
            hw_trigger,
        })
    }

    /// Serializes back to the wire schema. Used by timing-bus publishers and
    /// tests.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "time": self.time_ns,
            "offset": self.offset_ns,
            "meta": {
                "LOCAL-TIME": self.local_time_ns,
                "HW-TRIGGER": self.hw_trigger,
            },
        })
    }
}

// =============================================================================
// Tags
// =============================================================================

/// Static description of a channel, emitted once per (re)arm at the first
/// published sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    pub name: String,
    pub unit: String,
    pub sample_rate: f64,
    /// Lowest representable physical value (`offset - range`).
    pub signal_min: f32,
    /// Highest representable physical value (`offset + range`).
    pub signal_max: f32,
}

/// Payload attached to a sample index on a channel's tag stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TagPayload {
    /// One-time channel metadata after (re)arming.
    ChannelDescriptor(ChannelDescriptor),
    /// A timing event attributed to this sample position.
    ///
    /// `offset_samples` is the sub-sample remainder in `[0, 1)` left after
    /// mapping the event time onto the sample grid.
    Timing {
        event: TimingEvent,
        offset_samples: f32,
    },
    /// A hardware trigger pulse for which no timing event arrived within the
    /// matcher timeout. `local_time_ns` is the pulse time on the local clock.
    UnknownEvent { local_time_ns: u64 },
}

/// A sample-indexed annotation on a channel stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Sample index the payload refers to. Relative to the current chunk in
    /// matcher output, absolute once published by the engine.
    pub index: u64,
    pub payload: TagPayload,
}

impl Tag {
    pub fn new(index: u64, payload: TagPayload) -> Self {
        Self { index, payload }
    }

    /// The event name carried by this tag, if any.
    pub fn event_name(&self) -> Option<&str> {
        match &self.payload {
            TagPayload::Timing { event, .. } => Some(&event.name),
            TagPayload::UnknownEvent { .. } => Some("UNKNOWN_EVENT"),
            TagPayload::ChannelDescriptor(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_event() -> Value {
        serde_json::json!({
            "name": "EVT_CMD1",
            "time": 123_456_789u64,
            "offset": -300.0,
            "meta": { "LOCAL-TIME": 123_456_789u64, "HW-TRIGGER": true },
        })
    }

    #[test]
    fn timing_event_round_trip() {
        let parsed = TimingEvent::from_value(&valid_event()).unwrap();
        assert_eq!(parsed.name, "EVT_CMD1");
        assert_eq!(parsed.time_ns, 123_456_789);
        assert!(parsed.hw_trigger);
        let reparsed = TimingEvent::from_value(&parsed.to_value()).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn timing_event_rejects_missing_meta_field() {
        let mut value = valid_event();
        value["meta"]
            .as_object_mut()
            .unwrap()
            .remove("HW-TRIGGER")
            .unwrap();
        let err = TimingEvent::from_value(&value).unwrap_err();
        assert!(err.0.contains("HW-TRIGGER"));
    }

    #[test]
    fn timing_event_rejects_wrong_type() {
        let mut value = valid_event();
        value["time"] = Value::String("not a number".into());
        assert!(TimingEvent::from_value(&value).is_err());
    }

    #[test]
    fn raw_chunk_len_is_per_channel() {
        let chunk = RawChunk {
            samples: vec![vec![0; 16], vec![0; 16]],
            start_sample: 0,
            overflow: 0,
        };
        assert_eq!(chunk.len(), 16);
        assert!(!chunk.is_empty());
    }
}
