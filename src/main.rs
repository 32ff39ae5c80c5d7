// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use clap::Parser;
use edgefirst_dsp::{
    ChannelSink, Engine, EngineConfig, Event, InputFrame, Loopback, Output, Passthrough,
};
use kanal::AsyncReceiver;
use serde_json::json;
use std::{
    error::Error,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

/// What the consumer saw.
#[derive(Debug, Default)]
struct Consumed {
    frames: u64,
    bytes: u64,
    keyframes: u64,
    events: u64,
    eos: bool,
    fault: Option<String>,
    last_timestamp: Option<Duration>,
}

async fn consume(rx: AsyncReceiver<Output>) -> Consumed {
    let mut consumed = Consumed::default();
    while let Ok(output) = rx.recv().await {
        match output {
            Output::Frame(frame) => {
                consumed.frames += 1;
                consumed.bytes += frame.len() as u64;
                consumed.keyframes += u64::from(frame.keyframe);
                consumed.last_timestamp = frame.timestamp;
            }
            Output::Event(Event::Eos) => {
                consumed.eos = true;
                break;
            }
            Output::Event(event) => {
                debug!(?event, "event");
                consumed.events += 1;
            }
            Output::Fault(fault) => {
                consumed.fault = Some(fault.to_string());
                break;
            }
        }
    }
    consumed
}

fn produce(
    engine: &Engine,
    frames: u64,
    frame_size: usize,
    duration: Duration,
    flush_every: u64,
) -> Result<(), edgefirst_dsp::Error> {
    for index in 0..frames {
        let data = vec![(index % 251) as u8; frame_size];
        let timestamp = duration * index as u32;
        engine.push(InputFrame::new(data).with_timing(timestamp, duration))?;
        if flush_every > 0 && (index + 1) % flush_every == 0 {
            engine.flush()?;
        }
    }
    engine.send_eos()
}

async fn session(args: Args) -> Result<(), Box<dyn Error>> {
    let config = EngineConfig::from(&args);
    let bridge = Arc::new(Loopback::with_endian(config.endian));
    let (sink, rx) = ChannelSink::bounded(config.output_buffers * 2);
    let engine = Arc::new(Engine::new(
        config,
        bridge.clone(),
        Arc::new(Passthrough),
        Arc::new(sink),
    )?);

    let start = Instant::now();
    let consumer = tokio::spawn(consume(rx.to_async()));
    let producer = {
        let engine = engine.clone();
        let frames = args.frames;
        let frame_size = args.frame_size;
        let duration = Duration::from_millis(args.frame_duration_ms);
        let flush_every = args.flush_every;
        tokio::task::spawn_blocking(move || {
            produce(&engine, frames, frame_size, duration, flush_every)
        })
    };

    if let Err(err) = producer.await? {
        warn!("producer stopped: {err}");
    }
    let consumed = match tokio::time::timeout(Duration::from_secs(10), consumer).await {
        Ok(consumed) => consumed?,
        Err(_) => {
            warn!("timed out waiting for end of stream");
            Consumed::default()
        }
    };
    let elapsed = start.elapsed();

    engine.stop()?;
    let stats = engine.stats();
    let ring = engine.ring();
    let cache = bridge.cache_ops();
    let outstanding = bridge.outstanding();

    let report = json!({
        "settings": args.to_json(),
        "elapsed_ms": elapsed.as_secs_f64() * 1e3,
        "consumed": {
            "frames": consumed.frames,
            "bytes": consumed.bytes,
            "keyframes": consumed.keyframes,
            "events": consumed.events,
            "eos": consumed.eos,
            "fault": consumed.fault,
            "last_timestamp_ms": consumed.last_timestamp.map(|ts| ts.as_millis() as u64),
        },
        "stats": {
            "submitted": stats.submitted,
            "copied": stats.copied,
            "completed": stats.completed,
            "delivered": stats.delivered,
            "discarded": stats.discarded,
            "skipped": stats.skipped,
            "overflows": stats.overflows,
        },
        "ring": {
            "capacity": ring.capacity,
            "write": ring.write,
            "read": ring.read,
        },
        "loopback": {
            "cache_flushes": cache.flushes,
            "cache_invalidates": cache.invalidates,
            "reservations": outstanding.reservations,
            "mappings": outstanding.mappings,
        },
    });

    if args.report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            frames = consumed.frames,
            bytes = consumed.bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "session complete"
        );
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let stdout_log = tracing_subscriber::fmt::layer().with_filter(if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    });

    let journald = match tracing_journald::layer() {
        Ok(journald) => Some(journald.with_filter(LevelFilter::INFO)),
        Err(_) => None,
    };

    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default())
    } else {
        None
    };

    let console = args.tokio_console.then(console_subscriber::spawn);

    let subscriber = Registry::default()
        .with(stdout_log)
        .with(journald)
        .with(tracy)
        .with(console);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()?;
    runtime.block_on(session(args))
}
