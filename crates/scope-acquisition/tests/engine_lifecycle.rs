//! Engine lifecycle and data-path tests against the simulated digitizer.

use scope_acquisition::scope_core::config::AcquisitionConfig;
use scope_acquisition::scope_core::data::TagPayload;
use scope_acquisition::scope_core::error::{AcquisitionError, DriverErrorKind};
use scope_acquisition::{AcquisitionEngine, PollOutcome};
use scope_driver_sim::{SimDigitizer, SimDigitizerConfig};
use std::sync::Arc;

fn sim(config: SimDigitizerConfig) -> Arc<SimDigitizer> {
    Arc::new(SimDigitizer::with_config(config))
}

fn config(toml: &str) -> AcquisitionConfig {
    AcquisitionConfig::from_toml_str(toml).expect("test config must parse")
}

fn streaming_config() -> AcquisitionConfig {
    config(
        r#"
        sample_rate = 1e6

        [[channels]]
        id = "A"
        range = 5.0
        "#,
    )
}

#[tokio::test]
async fn lifecycle_rejects_out_of_order_operations() {
    let driver = sim(SimDigitizerConfig::default());
    let mut engine = AcquisitionEngine::new(driver, streaming_config());

    assert!(matches!(
        engine.configure().await,
        Err(AcquisitionError::InvalidState {
            operation: "configure",
            ..
        })
    ));
    assert!(matches!(
        engine.arm().await,
        Err(AcquisitionError::InvalidState { operation: "arm", .. })
    ));

    engine.initialize().await.unwrap();
    engine.configure().await.unwrap();
    // polling an unarmed engine is a caller bug
    assert!(matches!(
        engine.poll_once().await,
        Err(AcquisitionError::InvalidState {
            operation: "poll",
            ..
        })
    ));

    // close is reachable from anywhere and idempotent
    engine.close().await.unwrap();
    engine.close().await.unwrap();
}

#[tokio::test]
async fn unknown_channel_and_trigger_source_are_rejected() {
    let driver = sim(SimDigitizerConfig::default());
    let mut engine = AcquisitionEngine::new(
        driver.clone(),
        config(
            r#"
            sample_rate = 1e6

            [[channels]]
            id = "Z"
            "#,
        ),
    );
    engine.initialize().await.unwrap();
    assert!(matches!(
        engine.configure().await,
        Err(AcquisitionError::UnknownChannel(id)) if id == "Z"
    ));

    let mut engine = AcquisitionEngine::new(
        driver,
        config(
            r#"
            sample_rate = 1e6

            [[channels]]
            id = "A"

            [trigger]
            source = "B"
            threshold = 1.0
            "#,
        ),
    );
    engine.initialize().await.unwrap();
    assert!(matches!(
        engine.configure().await,
        Err(AcquisitionError::UnknownTriggerSource(id)) if id == "B"
    ));
}

#[tokio::test]
async fn streaming_publishes_calibrated_samples_and_one_descriptor() {
    let driver = sim(SimDigitizerConfig {
        chunk_samples: 256,
        noise_code: 0,
        ..SimDigitizerConfig::default()
    });
    let mut engine = AcquisitionEngine::new(driver, streaming_config());
    engine.initialize().await.unwrap();
    engine.configure().await.unwrap();
    let mut outputs = engine.take_outputs().expect("outputs after configure");
    assert_eq!(outputs.len(), 1);
    engine.arm().await.unwrap();

    assert_eq!(engine.poll_once().await.unwrap(), PollOutcome::Processed(256));

    let channel = &mut outputs[0];
    assert_eq!(channel.samples.available(), 256);
    // pulse code 20000 over range 5 V: 20000 * 5 / 32767
    let first = channel.samples.pop().unwrap();
    assert!((first - 3.0519).abs() < 1e-3);

    assert_eq!(channel.tags.available(), 1);
    let tag = channel.tags.pop().unwrap();
    assert_eq!(tag.index, 0);
    match tag.payload {
        TagPayload::ChannelDescriptor(descriptor) => {
            assert_eq!(descriptor.name, "A");
            assert_eq!(descriptor.unit, "V");
            assert_eq!(descriptor.sample_rate, 1e6);
            assert_eq!(descriptor.signal_min, -5.0);
            assert_eq!(descriptor.signal_max, 5.0);
        }
        other => panic!("expected descriptor, got {other:?}"),
    }

    // subsequent polls carry data but no second descriptor
    engine.poll_once().await.unwrap();
    assert_eq!(channel.tags.available(), 0);
}

#[tokio::test]
async fn trigger_pulses_without_events_surface_as_unknown_tags() {
    let driver = sim(SimDigitizerConfig {
        chunk_samples: 256,
        pulse_period_samples: 250,
        pulse_width_samples: 10,
        noise_code: 0,
        ..SimDigitizerConfig::default()
    });
    // 1000 ns timeout is one sample, so nearly the whole chunk is past the
    // matching deadline on the first poll
    let mut engine = AcquisitionEngine::new(
        driver,
        config(
            r#"
            sample_rate = 1e6
            matcher_timeout_ns = 1000

            [[channels]]
            id = "A"

            [trigger]
            source = "A"
            threshold = 1.5
            direction = "rising"
            "#,
        ),
    );
    engine.initialize().await.unwrap();
    engine.configure().await.unwrap();
    let mut outputs = engine.take_outputs().unwrap();
    engine.arm().await.unwrap();

    // the window opens mid-pulse, so the detector is seeded high and the
    // only rising edge is the next pulse at sample 250
    assert_eq!(engine.poll_once().await.unwrap(), PollOutcome::Processed(255));

    let channel = &mut outputs[0];
    let tags: Vec<_> = channel.tags.drain();
    assert_eq!(tags.len(), 2);
    assert!(matches!(tags[0].payload, TagPayload::ChannelDescriptor(_)));
    assert_eq!(tags[1].index, 250);
    assert_eq!(tags[1].event_name(), Some("UNKNOWN_EVENT"));
    assert_eq!(channel.samples.available(), 255);
}

#[tokio::test]
async fn calibration_is_linear_and_monotonic_over_the_code_range() {
    let driver = sim(SimDigitizerConfig::default());
    let mut engine = AcquisitionEngine::new(
        driver.clone(),
        config(
            r#"
            sample_rate = 1e6

            [[channels]]
            id = "A"
            range = 5.0
            offset = 0.5
            "#,
        ),
    );
    engine.initialize().await.unwrap();
    engine.configure().await.unwrap();
    let mut outputs = engine.take_outputs().unwrap();
    engine.arm().await.unwrap();

    let codes: Vec<i16> = vec![-32767, -16384, -1, 0, 1, 2, 16384, 32767];
    driver.inject_chunk(vec![codes.clone(), codes.clone()], 0);
    engine.poll_once().await.unwrap();

    let samples = outputs[0].samples.drain();
    assert_eq!(samples.len(), codes.len());
    for (&code, &value) in codes.iter().zip(&samples) {
        let expected = 0.5 + f32::from(code) * 5.0 / 32767.0;
        assert!(
            (value - expected).abs() < 1e-4,
            "code {code}: got {value}, expected {expected}"
        );
    }
    for pair in samples.windows(2) {
        assert!(pair[0] < pair[1], "calibration must be monotonic in the code");
    }
}

#[tokio::test]
async fn matched_tags_fan_out_to_every_channel() {
    let driver = sim(SimDigitizerConfig {
        chunk_samples: 256,
        pulse_period_samples: 250,
        pulse_width_samples: 10,
        noise_code: 0,
        ..SimDigitizerConfig::default()
    });
    let mut engine = AcquisitionEngine::new(
        driver,
        config(
            r#"
            sample_rate = 1e6
            matcher_timeout_ns = 1000

            [[channels]]
            id = "A"

            [[channels]]
            id = "B"

            [trigger]
            source = "A"
            threshold = 1.5
            direction = "rising"
            "#,
        ),
    );
    engine.initialize().await.unwrap();
    engine.configure().await.unwrap();
    let mut outputs = engine.take_outputs().unwrap();
    engine.arm().await.unwrap();

    engine.poll_once().await.unwrap();

    // the eventless pulse at 250 is tagged on the trigger channel AND on
    // every other enabled channel, at the same sample index
    for channel in &mut outputs {
        let tags = channel.tags.drain();
        let unknown: Vec<u64> = tags
            .iter()
            .filter(|t| t.event_name() == Some("UNKNOWN_EVENT"))
            .map(|t| t.index)
            .collect();
        assert_eq!(unknown, vec![250], "channel {}", channel.id);
    }
}

#[tokio::test]
async fn timing_events_without_trigger_are_discarded() {
    let driver = sim(SimDigitizerConfig {
        chunk_samples: 64,
        ..SimDigitizerConfig::default()
    });
    let mut engine = AcquisitionEngine::new(driver, streaming_config());
    engine.initialize().await.unwrap();
    engine.configure().await.unwrap();
    engine.arm().await.unwrap();

    let sender = engine.timing_sender();
    for i in 0..3u64 {
        sender
            .send(serde_json::json!({
                "name": format!("EVT_{i}"),
                "time": 1_000_000 + i,
                "offset": 0.0,
                "meta": { "LOCAL-TIME": 1_000_000 + i, "HW-TRIGGER": true },
            }))
            .unwrap();
    }

    engine.poll_once().await.unwrap();
    assert_eq!(engine.pending_timing_events(), 0);

    // and the queue does not creep back up on subsequent polls
    sender
        .send(serde_json::json!({ "name": "EVT_LATE" }))
        .unwrap();
    engine.poll_once().await.unwrap();
    assert_eq!(engine.pending_timing_events(), 0);
}

#[tokio::test]
async fn tag_queue_overrun_is_reported_on_the_error_stream() {
    // a dense pulse train yields more unknown-event tags than the tag queue
    // can hold in one pass
    let driver = sim(SimDigitizerConfig {
        chunk_samples: 256,
        pulse_period_samples: 4,
        pulse_width_samples: 2,
        noise_code: 0,
        ..SimDigitizerConfig::default()
    });
    let mut cfg = config(
        r#"
        sample_rate = 1e6
        matcher_timeout_ns = 1000

        [[channels]]
        id = "A"

        [trigger]
        source = "A"
        threshold = 1.5
        direction = "rising"
        "#,
    );
    cfg.buffer_samples = 2048; // tag queue capacity 32
    let mut engine = AcquisitionEngine::new(driver, cfg);
    let mut errors = engine.error_stream().unwrap();
    engine.initialize().await.unwrap();
    engine.configure().await.unwrap();
    let _outputs = engine.take_outputs().unwrap();
    engine.arm().await.unwrap();

    engine.poll_once().await.unwrap();

    let record = errors.try_recv().expect("tag overrun record");
    assert_eq!(record.error.kind, DriverErrorKind::Overrun);
    assert!(record.error.message.contains("tag queue"));
}

#[tokio::test]
async fn overflow_and_sample_gaps_are_reported_not_raised() {
    let driver = sim(SimDigitizerConfig {
        chunk_samples: 128,
        ..SimDigitizerConfig::default()
    });
    let mut engine = AcquisitionEngine::new(driver.clone(), streaming_config());
    let mut errors = engine.error_stream().expect("error stream");
    engine.initialize().await.unwrap();
    engine.configure().await.unwrap();
    let _outputs = engine.take_outputs().unwrap();
    engine.arm().await.unwrap();

    // device-side buffer overflow travels with the chunk
    driver.inject_chunk(vec![vec![0; 16], vec![0; 16]], 0b01);
    engine.poll_once().await.unwrap();
    let record = errors.try_recv().expect("overflow record");
    assert_eq!(record.error.kind, DriverErrorKind::Overrun);
    assert_eq!(record.sample_offset, 0);

    // a jump in the driver's sample counter means samples were lost
    driver.skip_samples(40);
    engine.poll_once().await.unwrap();
    let record = errors.try_recv().expect("gap record");
    assert_eq!(record.error.kind, DriverErrorKind::Overrun);
    assert!(record.error.message.contains("dropped samples"));
}

#[tokio::test]
async fn ring_overrun_drops_the_window_and_records_it() {
    let driver = sim(SimDigitizerConfig {
        chunk_samples: 256,
        ..SimDigitizerConfig::default()
    });
    let mut cfg = streaming_config();
    cfg.buffer_samples = 64; // smaller than one chunk
    let mut engine = AcquisitionEngine::new(driver, cfg);
    let mut errors = engine.error_stream().unwrap();
    engine.initialize().await.unwrap();
    engine.configure().await.unwrap();
    let mut outputs = engine.take_outputs().unwrap();
    engine.arm().await.unwrap();

    engine.poll_once().await.unwrap();

    let record = errors.try_recv().expect("overrun record");
    assert_eq!(record.error.kind, DriverErrorKind::Overrun);
    // nothing partial was published
    assert_eq!(outputs[0].samples.available(), 0);
}

#[tokio::test]
async fn rapid_block_with_trigger_once_finishes_after_all_captures() {
    let driver = sim(SimDigitizerConfig {
        noise_code: 0,
        ..SimDigitizerConfig::default()
    });
    let mut engine = AcquisitionEngine::new(
        driver,
        config(
            r#"
            sample_rate = 1e6

            [mode]
            type = "rapid_block"
            pre_samples = 20
            post_samples = 80
            n_captures = 2
            trigger_once = true

            [[channels]]
            id = "A"
            "#,
        ),
    );
    engine.initialize().await.unwrap();
    engine.configure().await.unwrap();
    let mut outputs = engine.take_outputs().unwrap();
    engine.arm().await.unwrap();

    assert_eq!(engine.poll_once().await.unwrap(), PollOutcome::Finished);
    // two trigger-aligned captures of 100 samples, back to back
    assert_eq!(outputs[0].samples.available(), 200);

    // the block was consumed, nothing further is ready
    engine.disarm().await.unwrap();
    engine.close().await.unwrap();
}

#[tokio::test]
async fn shutdown_handle_stops_the_poll_loop() {
    let driver = sim(SimDigitizerConfig::default());
    let mut engine = AcquisitionEngine::new(driver, streaming_config());
    engine.initialize().await.unwrap();
    engine.configure().await.unwrap();
    engine.arm().await.unwrap();

    let handle = engine.shutdown_handle();
    handle.request_stop();
    assert_eq!(engine.poll_once().await.unwrap(), PollOutcome::Stopped);
    engine.close().await.unwrap();
}
