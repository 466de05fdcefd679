//! Device-agnostic acquisition lifecycle and per-chunk processing.
//!
//! The engine sits between a [`DigitizerDriver`] and downstream consumers:
//! it owns the channel configuration, drives the
//! `initialize -> configure -> arm -> capture -> disarm -> close` state
//! machine, calibrates raw ADC codes to volts, finds trigger edges, runs the
//! [`TimingMatcher`] and publishes calibrated samples plus tags into
//! per-channel ring channels.
//!
//! Two polling realizations are supported without code change: a host
//! scheduler may call [`AcquisitionEngine::poll_once`] periodically, or
//! [`AcquisitionEngine::run`] drives the same method from its own tokio
//! sleep loop. Cancellation is cooperative through a [`ShutdownHandle`]
//! checked at the top of every poll.

use crate::matcher::TimingMatcher;
use crate::ring::{ring_channel, RingConsumer, RingProducer};
use crate::trigger::{EdgeDetector, TriggerState};
use scope_core::config::{AcquisitionConfig, AcquisitionMode, ChannelConfig};
use scope_core::data::{ChannelDescriptor, RawChunk, Tag, TagPayload};
use scope_core::driver::{DigitizerDriver, DriverSetup};
use scope_core::error::{AcqResult, AcquisitionError, DriverError, DriverErrorKind, ErrorRecord};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// =============================================================================
// Lifecycle
// =============================================================================

/// Engine lifecycle states. Transitions are enforced by the mutating
/// operations; illegal transitions fail with
/// [`AcquisitionError::InvalidState`] and leave the engine unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initialized,
    Configured,
    Armed,
    Capturing,
    Disarmed,
    Closed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Configured => "configured",
            Self::Armed => "armed",
            Self::Capturing => "capturing",
            Self::Disarmed => "disarmed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What a single poll accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No new data from the driver.
    Idle,
    /// This many samples were published per channel.
    Processed(usize),
    /// Rapid-block with `trigger_once` completed all captures; the caller
    /// must stop polling and disarm or close.
    Finished,
    /// Shutdown was requested; the caller must close the engine.
    Stopped,
}

/// Cooperative cancellation flag, cloneable across tasks.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// Channel plumbing
// =============================================================================

/// Consumer-side handles for one configured channel.
pub struct ChannelOutput {
    pub id: String,
    pub samples: RingConsumer<f32>,
    pub tags: RingConsumer<Tag>,
}

/// Producer-side state for one configured channel.
struct ChannelPipeline {
    config: ChannelConfig,
    driver_index: usize,
    scale: f32,
    sample_tx: RingProducer<f32>,
    tag_tx: RingProducer<Tag>,
    descriptor_published: bool,
    /// Calibrated samples past the matcher boundary, re-presented with the
    /// next chunk.
    carry: Vec<f32>,
}

impl ChannelPipeline {
    fn calibrate_into(&self, raw: &[i16], out: &mut Vec<f32>) {
        out.extend(
            raw.iter()
                .map(|&code| self.config.offset + f32::from(code) * self.scale),
        );
    }

    fn descriptor(&self, sample_rate: f64) -> ChannelDescriptor {
        ChannelDescriptor {
            name: self.config.signal_name().to_string(),
            unit: self.config.unit.clone(),
            sample_rate,
            signal_min: self.config.offset - self.config.range,
            signal_max: self.config.offset + self.config.range,
        }
    }
}

// =============================================================================
// Acquisition engine
// =============================================================================

pub struct AcquisitionEngine {
    driver: Arc<dyn DigitizerDriver>,
    config: AcquisitionConfig,
    state: EngineState,
    pipelines: Vec<ChannelPipeline>,
    outputs: Option<Vec<ChannelOutput>>,

    /// Position of the trigger source within `pipelines`, if configured.
    trigger_pipeline: Option<usize>,
    detector: Option<EdgeDetector>,
    matcher: TimingMatcher,

    /// Timing-bus events received but not yet consumed by the matcher.
    pending_events: Vec<Value>,
    timing_rx: mpsc::UnboundedReceiver<Value>,
    timing_tx: mpsc::UnboundedSender<Value>,

    error_tx: mpsc::UnboundedSender<ErrorRecord>,
    error_rx: Option<mpsc::UnboundedReceiver<ErrorRecord>>,

    /// Latched after the first diagnostic about timing events arriving
    /// while no trigger source is configured.
    timing_discard_warned: bool,

    /// Absolute sample index of the first carry/window sample.
    published_base: u64,
    /// Absolute driver sample index expected next; a jump means the driver
    /// dropped samples and the matcher anchor is void.
    expected_next_sample: Option<u64>,

    shutdown: ShutdownHandle,
}

impl AcquisitionEngine {
    pub fn new(driver: Arc<dyn DigitizerDriver>, config: AcquisitionConfig) -> Self {
        let (timing_tx, timing_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let matcher = TimingMatcher::new(config.matcher_timeout_ns, config.sample_rate);
        Self {
            driver,
            config,
            state: EngineState::Uninitialized,
            pipelines: Vec::new(),
            outputs: None,
            trigger_pipeline: None,
            detector: None,
            matcher,
            pending_events: Vec::new(),
            timing_rx,
            timing_tx,
            error_tx,
            error_rx: Some(error_rx),
            timing_discard_warned: false,
            published_base: 0,
            expected_next_sample: None,
            shutdown: ShutdownHandle::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Sender for timing-bus events, cloneable into the bus receiver task.
    pub fn timing_sender(&self) -> mpsc::UnboundedSender<Value> {
        self.timing_tx.clone()
    }

    /// The process-wide error stream. Can only be taken once.
    pub fn error_stream(&mut self) -> Option<mpsc::UnboundedReceiver<ErrorRecord>> {
        self.error_rx.take()
    }

    /// Consumer handles for every enabled channel, in configuration order.
    /// Available after a successful [`configure`](Self::configure); taking
    /// them twice returns `None`.
    pub fn take_outputs(&mut self) -> Option<Vec<ChannelOutput>> {
        self.outputs.take()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    fn invalid_state(&self, operation: &'static str) -> AcquisitionError {
        AcquisitionError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle operations
    // -------------------------------------------------------------------------

    pub async fn initialize(&mut self) -> AcqResult<()> {
        if self.state != EngineState::Uninitialized {
            return Err(self.invalid_state("initialize"));
        }
        self.driver.initialize().await?;
        self.state = EngineState::Initialized;
        info!("digitizer initialized");
        Ok(())
    }

    /// Validate the configuration against the driver, program the hardware
    /// and rebuild all channel pipelines.
    ///
    /// Applied swap-on-success: any failure leaves the previous pipelines,
    /// outputs and hardware configuration in place. Reconfiguring an armed
    /// device is an error; disarm first.
    pub async fn configure(&mut self) -> AcqResult<()> {
        match self.state {
            EngineState::Initialized | EngineState::Configured | EngineState::Disarmed => {}
            _ => return Err(self.invalid_state("configure")),
        }

        let enabled: Vec<ChannelConfig> = self.config.enabled_channels().cloned().collect();
        let max_adc = f32::from(self.driver.max_adc_code());

        // validate before touching hardware or pipelines
        let mut driver_indices = Vec::with_capacity(enabled.len());
        for channel in &enabled {
            let index = self
                .driver
                .channel_index(&channel.id)
                .ok_or_else(|| AcquisitionError::UnknownChannel(channel.id.clone()))?;
            driver_indices.push(index);
        }
        let mut trigger_pipeline = None;
        let mut detector = None;
        if let Some(trigger) = &self.config.trigger {
            let position = enabled
                .iter()
                .position(|c| c.id == trigger.source)
                .ok_or_else(|| AcquisitionError::UnknownTriggerSource(trigger.source.clone()))?;
            let band = trigger
                .band
                .unwrap_or(enabled[position].range / 100.0);
            detector = Some(EdgeDetector::new(
                trigger.threshold,
                band,
                trigger.direction,
            ));
            trigger_pipeline = Some(position);
        }

        let setup = DriverSetup {
            sample_rate: self.config.sample_rate,
            channels: enabled.clone(),
            trigger: self.config.trigger.clone(),
            mode: self.config.mode.clone(),
        };
        self.driver.configure(&setup).await?;

        // hardware accepted the configuration, swap in the new pipelines
        let mut pipelines = Vec::with_capacity(enabled.len());
        let mut outputs = Vec::with_capacity(enabled.len());
        for (channel, driver_index) in enabled.into_iter().zip(driver_indices) {
            let (sample_tx, sample_rx) = ring_channel(self.config.buffer_samples);
            let (tag_tx, tag_rx) = ring_channel((self.config.buffer_samples / 64).max(16));
            outputs.push(ChannelOutput {
                id: channel.id.clone(),
                samples: sample_rx,
                tags: tag_rx,
            });
            pipelines.push(ChannelPipeline {
                scale: channel.range / max_adc,
                config: channel,
                driver_index,
                sample_tx,
                tag_tx,
                descriptor_published: false,
                carry: Vec::new(),
            });
        }
        self.pipelines = pipelines;
        self.outputs = Some(outputs);
        self.trigger_pipeline = trigger_pipeline;
        self.detector = detector;
        self.matcher = TimingMatcher::new(self.config.matcher_timeout_ns, self.config.sample_rate);
        self.pending_events.clear();
        self.timing_discard_warned = false;
        self.published_base = 0;
        self.expected_next_sample = None;
        self.state = EngineState::Configured;
        debug!(channels = self.pipelines.len(), "acquisition configured");
        Ok(())
    }

    /// Bring a fresh engine all the way up: initialize, configure and, when
    /// `auto_arm` is set, arm.
    pub async fn start(&mut self) -> AcqResult<()> {
        self.initialize().await?;
        self.configure().await?;
        if self.config.auto_arm {
            self.arm().await?;
        }
        Ok(())
    }

    pub async fn arm(&mut self) -> AcqResult<()> {
        match self.state {
            EngineState::Configured | EngineState::Disarmed => {}
            _ => return Err(self.invalid_state("arm")),
        }
        self.driver.arm().await?;
        for pipeline in &mut self.pipelines {
            pipeline.descriptor_published = false;
            pipeline.carry.clear();
        }
        self.matcher.reset();
        self.expected_next_sample = None;
        self.state = EngineState::Armed;
        info!("acquisition armed");
        Ok(())
    }

    /// Stop the acquisition, best effort. Teardown failures are reported to
    /// the error stream but never prevent reaching `Disarmed`.
    pub async fn disarm(&mut self) -> AcqResult<()> {
        if self.state == EngineState::Closed {
            return Err(self.invalid_state("disarm"));
        }
        if let Err(e) = self.driver.disarm().await {
            warn!(error = %e, "driver disarm failed");
            self.record_error(e);
        }
        self.state = EngineState::Disarmed;
        Ok(())
    }

    /// Release the device. Reachable from any state and idempotent; driver
    /// teardown failures are reported, not raised.
    pub async fn close(&mut self) -> AcqResult<()> {
        if self.state == EngineState::Closed {
            return Ok(());
        }
        if let Err(e) = self.driver.close().await {
            warn!(error = %e, "driver close failed");
            self.record_error(e);
        }
        self.state = EngineState::Closed;
        info!("digitizer closed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Polling
    // -------------------------------------------------------------------------

    /// One scheduler-driven processing iteration.
    ///
    /// Checks the shutdown flag, drains pending timing events, fetches new
    /// data from the driver and runs the per-chunk hot path. Driver poll
    /// errors are recorded on the error stream and reported as `Idle` so a
    /// transient fault does not kill the acquisition loop.
    pub async fn poll_once(&mut self) -> AcqResult<PollOutcome> {
        if self.shutdown.is_stopped() {
            return Ok(PollOutcome::Stopped);
        }
        match self.state {
            EngineState::Armed | EngineState::Capturing => {}
            _ => return Err(self.invalid_state("poll")),
        }
        self.drain_timing_events();

        match self.config.mode {
            AcquisitionMode::Streaming { .. } => self.poll_streaming(),
            AcquisitionMode::RapidBlock {
                n_captures,
                trigger_once,
                ..
            } => self.poll_rapid_block(n_captures, trigger_once).await,
        }
    }

    /// Drive [`poll_once`](Self::poll_once) from an internal sleep loop
    /// until shutdown is requested or rapid-block acquisition finishes.
    /// Closes the engine before returning.
    pub async fn run(&mut self) -> AcqResult<()> {
        if self.config.auto_arm && self.state == EngineState::Configured {
            self.arm().await?;
        }
        let interval = match self.config.mode {
            AcquisitionMode::Streaming { poll_interval_ms } => {
                Duration::from_millis(poll_interval_ms)
            }
            AcquisitionMode::RapidBlock { .. } => Duration::from_millis(1),
        };
        loop {
            match self.poll_once().await? {
                PollOutcome::Stopped | PollOutcome::Finished => break,
                PollOutcome::Idle => tokio::time::sleep(interval).await,
                PollOutcome::Processed(_) => {}
            }
        }
        self.close().await
    }

    fn poll_streaming(&mut self) -> AcqResult<PollOutcome> {
        let chunk = match self.driver.poll_streaming() {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(PollOutcome::Idle),
            Err(e) => {
                self.record_error(e);
                return Ok(PollOutcome::Idle);
            }
        };
        if chunk.is_empty() {
            return Ok(PollOutcome::Idle);
        }
        self.state = EngineState::Capturing;

        // a jump in the driver's sample counter means dropped samples; the
        // matcher anchor is meaningless across the gap
        if let Some(expected) = self.expected_next_sample {
            if chunk.start_sample != expected {
                warn!(
                    expected,
                    actual = chunk.start_sample,
                    "sample gap detected, resetting matcher"
                );
                self.matcher.reset();
                self.record_error(DriverError::new(
                    "engine",
                    DriverErrorKind::Overrun,
                    format!(
                        "driver dropped samples: expected {expected}, got {}",
                        chunk.start_sample
                    ),
                ));
            }
        }
        self.expected_next_sample = Some(chunk.start_sample + chunk.len() as u64);

        let published = self.process_chunk(&chunk, false)?;
        Ok(PollOutcome::Processed(published))
    }

    async fn poll_rapid_block(
        &mut self,
        n_captures: u32,
        trigger_once: bool,
    ) -> AcqResult<PollOutcome> {
        match self.driver.block_ready() {
            Ok(true) => {}
            Ok(false) => return Ok(PollOutcome::Idle),
            Err(e) => {
                self.record_error(e);
                return Ok(PollOutcome::Idle);
            }
        }
        self.state = EngineState::Capturing;
        let mut published = 0usize;
        for capture in 0..n_captures {
            let chunk = match self.driver.rapid_block_capture(capture) {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.record_error(e);
                    continue;
                }
            };
            // captures are independent trigger-aligned windows; the anchor
            // must not leak from one into the next
            self.matcher.reset();
            published += self.process_chunk(&chunk, true)?;
        }
        if trigger_once {
            debug!("rapid block finished, trigger_once set");
            return Ok(PollOutcome::Finished);
        }
        // re-arm for the next set of captures; the descriptor and carry
        // state survive, only the hardware needs a fresh trigger
        if let Err(e) = self.driver.arm().await {
            self.record_error(e);
        } else {
            self.state = EngineState::Armed;
        }
        Ok(PollOutcome::Processed(published))
    }

    // -------------------------------------------------------------------------
    // Per-chunk hot path
    // -------------------------------------------------------------------------

    /// Calibrate, detect edges, match timing events and publish.
    ///
    /// The window handed to edge detection and the matcher is the carry
    /// from the previous call plus the new chunk; only the prefix the
    /// matcher declares processed is published, the rest becomes the new
    /// carry. With `consume_all` (rapid block) the whole window is
    /// published unconditionally.
    fn process_chunk(&mut self, chunk: &RawChunk, consume_all: bool) -> AcqResult<usize> {
        let n_new = chunk.len();
        if chunk.overflow != 0 {
            self.record_error(DriverError::overrun(
                "driver",
                format!("overflow bitmask {:#06x}", chunk.overflow),
            ));
            self.matcher.reset();
        }

        // extend every channel's carry with the calibrated new samples
        for pipeline in &mut self.pipelines {
            let raw = chunk
                .samples
                .get(pipeline.driver_index)
                .map_or(&[][..], Vec::as_slice);
            let mut window = std::mem::take(&mut pipeline.carry);
            pipeline.calibrate_into(raw, &mut window);
            pipeline.carry = window;
        }

        let window_len = self
            .pipelines
            .first()
            .map_or(0, |p| p.carry.len());
        if window_len == 0 {
            return Ok(0);
        }

        // window start on the local clock, counted back from now
        let period_ns = self.config.sample_period_ns();
        let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64;
        let window_start_ns = now_ns.saturating_sub((window_len as f64 * period_ns) as u64);

        let (processed, tags) = match (self.trigger_pipeline, self.detector) {
            (Some(trigger_idx), Some(detector)) => {
                let window = &self.pipelines[trigger_idx].carry;
                let mut state = TriggerState::seeded_from(window[0], detector.threshold);
                let pulses = detector.scan(window, &mut state);
                let result = self.matcher.match_chunk(
                    &self.pending_events,
                    &pulses,
                    window_len,
                    window_start_ns,
                );
                self.pending_events.drain(..result.processed_events);
                for message in &result.messages {
                    debug!(%message, "timing matcher");
                }
                (result.processed_samples, result.tags)
            }
            // no trigger source: nothing to match, publish everything
            _ => (window_len, Vec::new()),
        };
        // rapid-block captures are self-contained windows, never carried
        let processed = if consume_all { window_len } else { processed };

        if processed == 0 {
            return Ok(0);
        }

        let sample_rate = self.config.sample_rate;
        let base = self.published_base;
        for pipeline in &mut self.pipelines {
            if !pipeline.descriptor_published {
                let descriptor = pipeline.descriptor(sample_rate);
                if let Err(e) = pipeline
                    .tag_tx
                    .publish_one(Tag::new(base, TagPayload::ChannelDescriptor(descriptor)))
                {
                    self.error_tx
                        .send(ErrorRecord {
                            sample_offset: base,
                            error: DriverError::new(
                                "engine",
                                DriverErrorKind::Overrun,
                                format!("channel {} tag queue: {e}", pipeline.config.id),
                            ),
                        })
                        .ok();
                }
                pipeline.descriptor_published = true;
            }

            // matched tags fan out to every channel's tag stream, so each
            // consumer can correlate its samples by index on its own
            for tag in &tags {
                let index = base + tag.index;
                if let Err(e) = pipeline.tag_tx.publish_one(Tag::new(index, tag.payload.clone())) {
                    self.error_tx
                        .send(ErrorRecord {
                            sample_offset: index,
                            error: DriverError::new(
                                "engine",
                                DriverErrorKind::Overrun,
                                format!("channel {} tag queue: {e}", pipeline.config.id),
                            ),
                        })
                        .ok();
                }
            }

            match pipeline.sample_tx.publish(&pipeline.carry[..processed]) {
                Ok(()) => {
                    pipeline.carry.drain(..processed);
                }
                Err(overrun) => {
                    // drop the whole window for this channel rather than
                    // publish a partial range; the consumer sees a gap plus
                    // an error record instead of corrupted data
                    pipeline.carry.clear();
                    self.error_tx
                        .send(ErrorRecord {
                            sample_offset: base,
                            error: DriverError::new(
                                "engine",
                                DriverErrorKind::Overrun,
                                format!("channel {}: {overrun}", pipeline.config.id),
                            ),
                        })
                        .ok();
                    self.matcher.reset();
                }
            }
        }
        self.published_base += processed as u64;
        debug!(
            published = processed,
            base = self.published_base,
            new = n_new,
            "chunk processed"
        );
        Ok(processed)
    }

    /// Number of timing-bus events waiting for the matcher.
    pub fn pending_timing_events(&self) -> usize {
        self.pending_events.len()
    }

    fn drain_timing_events(&mut self) {
        while let Ok(event) = self.timing_rx.try_recv() {
            self.pending_events.push(event);
        }
        // without a trigger source there is no matcher to consume these;
        // holding them would grow without bound over a long acquisition
        if self.trigger_pipeline.is_none() && !self.pending_events.is_empty() {
            if !self.timing_discard_warned {
                warn!(
                    count = self.pending_events.len(),
                    "discarding timing events: no trigger source is configured"
                );
                self.timing_discard_warned = true;
            }
            self.pending_events.clear();
        }
    }

    fn record_error(&self, error: DriverError) {
        self.error_tx
            .send(ErrorRecord {
                sample_offset: self.published_base,
                error,
            })
            .ok();
    }
}
