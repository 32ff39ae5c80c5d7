// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_dsp::{
    bridge::NodeArgs,
    buffer::{DmaBuffer, HostMemory},
    codec::{Codec, PortLayout, Severity},
    loopback::Outstanding,
    port::PortId,
    protocol::{Endian, Message},
    ChannelSink, Engine, EngineConfig, Error as EngineError, Event, Fault, Frame, InputFrame,
    Loopback, Notification, Output, Passthrough, State,
};
use kanal::Receiver;
use serial_test::serial;
use std::{
    error::Error,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

const FRAME_DURATION: Duration = Duration::from_millis(33);
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> EngineConfig {
    EngineConfig {
        output_buffer_size: 4096,
        event_timeout: Duration::from_millis(20),
        message_timeout: Duration::from_millis(5),
        ack_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

struct Rig {
    loopback: Arc<Loopback>,
    engine: Engine,
    rx: Receiver<Output>,
}

fn rig_with(config: EngineConfig, codec: Arc<dyn Codec>) -> Result<Rig, Box<dyn Error>> {
    let loopback = Arc::new(Loopback::with_endian(config.endian));
    let (sink, rx) = ChannelSink::bounded(16);
    let engine = Engine::new(config, loopback.clone(), codec, Arc::new(sink))?;
    Ok(Rig {
        loopback,
        engine,
        rx,
    })
}

fn rig(config: EngineConfig) -> Result<Rig, Box<dyn Error>> {
    rig_with(config, Arc::new(Passthrough))
}

/// Frame `index` of a test stream: `len` bytes of `index` at `index * 33ms`.
fn frame(index: u32, len: usize) -> InputFrame {
    InputFrame::new(vec![index as u8; len]).with_timing(FRAME_DURATION * index, FRAME_DURATION)
}

fn next(rx: &Receiver<Output>) -> Result<Output, Box<dyn Error>> {
    rx.recv_timeout(RECV_TIMEOUT)
        .map_err(|err| format!("no output: {err:?}").into())
}

fn next_frame(rx: &Receiver<Output>) -> Result<Frame, Box<dyn Error>> {
    match next(rx)? {
        Output::Frame(frame) => Ok(frame),
        other => Err(format!("expected a frame, got {other:?}").into()),
    }
}

fn next_event(rx: &Receiver<Output>) -> Result<Event, Box<dyn Error>> {
    match next(rx)? {
        Output::Event(event) => Ok(event),
        other => Err(format!("expected an event, got {other:?}").into()),
    }
}

fn next_fault(rx: &Receiver<Output>) -> Result<Fault, Box<dyn Error>> {
    match next(rx)? {
        Output::Fault(fault) => Ok(fault),
        other => Err(format!("expected a fault, got {other:?}").into()),
    }
}

fn quiet(rx: &Receiver<Output>) -> bool {
    rx.recv_timeout(Duration::from_millis(100)).is_err()
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Pushes `count` frames and end of stream from a helper thread while the
/// caller consumes, returning the frame payloads and timestamps delivered.
fn stream(
    rig: &Rig,
    count: u32,
    len: impl Fn(u32) -> usize + Sync,
) -> Result<Vec<(Vec<u8>, Option<Duration>)>, Box<dyn Error>> {
    let engine = &rig.engine;
    thread::scope(|scope| {
        let producer = scope.spawn(|| -> Result<(), EngineError> {
            for index in 0..count {
                engine.push(frame(index, len(index)))?;
            }
            engine.send_eos()
        });

        let mut delivered = Vec::new();
        loop {
            match next(&rig.rx)? {
                Output::Frame(frame) => delivered.push((frame.data().to_vec(), frame.timestamp)),
                Output::Event(Event::Eos) => break,
                Output::Event(event) => println!("event {event:?}"),
                Output::Fault(fault) => return Err(fault.to_string().into()),
            }
        }
        producer.join().map_err(|_| "producer panicked")??;
        Ok(delivered)
    })
}

#[test]
#[serial]
fn test_frames_keep_submission_order() -> Result<(), Box<dyn Error>> {
    let rig = rig(EngineConfig {
        input_buffers: 4,
        output_buffers: 3,
        ..config()
    })?;
    rig.loopback.set_reorder(true);

    let delivered = stream(&rig, 24, |index| 100 + index as usize)?;
    assert_eq!(delivered.len(), 24);
    for (index, (data, timestamp)) in delivered.iter().enumerate() {
        assert_eq!(data.len(), 100 + index);
        assert!(data.iter().all(|&b| b == index as u8));
        assert_eq!(*timestamp, Some(FRAME_DURATION * index as u32));
    }

    let stats = rig.engine.stats();
    println!("{stats:?}");
    assert_eq!(stats.submitted, 24);
    assert_eq!(stats.completed, 24);
    assert_eq!(stats.delivered, 24);
    assert_eq!(stats.discarded, 0);
    let ring = rig.engine.ring();
    assert_eq!(ring.read, ring.write);
    assert_eq!(ring.frames_in_flight, 0);
    Ok(())
}

#[test]
#[serial]
fn test_lazy_start() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    assert_eq!(rig.engine.status(), State::Idle);
    assert!(rig.loopback.node_args().is_none());

    rig.engine.push(frame(0, 64))?;
    assert_eq!(rig.engine.status(), State::Running);
    assert_eq!(rig.loopback.sent()[0], Message::play());
    let args = rig.loopback.node_args().ok_or("node not created")?;
    assert_eq!(args.data.len(), 16);

    let frame = next_frame(&rig.rx)?;
    assert_eq!(frame.data(), &[0u8; 64][..]);
    assert!(frame.keyframe);
    Ok(())
}

#[test]
fn test_invalid_config_rejected() {
    let result = rig(EngineConfig {
        input_buffers: 0,
        ..config()
    });
    assert!(matches!(
        result.err().and_then(|err| err.downcast::<EngineError>().ok()).as_deref(),
        Some(EngineError::InvalidConfig(_))
    ));
}

#[test]
#[serial]
fn test_eos_waits_for_frames_in_flight() -> Result<(), Box<dyn Error>> {
    let rig = rig(EngineConfig {
        input_buffers: 3,
        ..config()
    })?;
    rig.loopback.set_manual(true);

    for index in 0..3 {
        rig.engine.push(frame(index, 32))?;
    }
    rig.engine.send_eos()?;
    assert!(rig.engine.ring().pending_eos);
    assert!(quiet(&rig.rx));

    rig.loopback.release(2);
    drop(next_frame(&rig.rx)?);
    drop(next_frame(&rig.rx)?);
    assert!(quiet(&rig.rx));

    rig.loopback.release(1);
    let last = next_frame(&rig.rx)?;
    assert_eq!(last.timestamp, Some(FRAME_DURATION * 2));
    assert_eq!(next_event(&rig.rx)?, Event::Eos);
    assert!(!rig.engine.ring().pending_eos);
    Ok(())
}

#[test]
#[serial]
fn test_eos_with_nothing_in_flight() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    rig.engine.send_eos()?;
    assert_eq!(next_event(&rig.rx)?, Event::Eos);
    Ok(())
}

#[test]
#[serial]
fn test_events_between_frames() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    let tag = Event::Tag("title=loopback".into());

    rig.engine.push_event(Event::Custom("before".into()))?;
    assert_eq!(next_event(&rig.rx)?, Event::Custom("before".into()));

    rig.loopback.set_manual(true);
    rig.engine.push(frame(0, 16))?;
    rig.engine.push_event(tag.clone())?;
    rig.engine.push(frame(1, 16))?;
    rig.loopback.release(2);

    assert_eq!(next_frame(&rig.rx)?.timestamp, Some(Duration::ZERO));
    assert_eq!(next_event(&rig.rx)?, tag);
    assert_eq!(next_frame(&rig.rx)?.timestamp, Some(FRAME_DURATION));
    Ok(())
}

#[test]
#[serial]
fn test_flush_discards_frames_in_flight() -> Result<(), Box<dyn Error>> {
    let rig = rig(EngineConfig {
        input_buffers: 5,
        ..config()
    })?;
    rig.loopback.set_manual(true);

    for index in 0..5 {
        rig.engine.push(frame(index, 64))?;
    }
    rig.engine.push_event(Event::Tag("stale".into()))?;
    rig.engine.send_eos()?;
    assert_eq!(rig.loopback.pending(), 5);
    assert_eq!(rig.engine.in_flight(PortId::Input), 5);

    rig.engine.flush()?;
    assert_eq!(rig.engine.status(), State::Running);
    assert_eq!(next_event(&rig.rx)?, Event::FlushStart);
    assert_eq!(next_event(&rig.rx)?, Event::FlushStop);
    assert!(quiet(&rig.rx));

    let stats = rig.engine.stats();
    assert_eq!(stats.discarded, 5);
    assert_eq!(stats.delivered, 0);
    let ring = rig.engine.ring();
    assert_eq!(ring.read, ring.write);
    assert!(!ring.pending_eos);
    assert_eq!(rig.loopback.pending(), 0);
    assert_eq!(rig.engine.in_flight(PortId::Input), 0);
    assert_eq!(rig.engine.queued(PortId::Input), 5);

    rig.loopback.set_manual(false);
    rig.engine.push(frame(7, 64))?;
    let resumed = next_frame(&rig.rx)?;
    assert_eq!(resumed.data(), &[7u8; 64][..]);
    assert_eq!(resumed.timestamp, Some(FRAME_DURATION * 7));
    Ok(())
}

#[test]
#[serial]
fn test_flush_timeout_fails_engine() -> Result<(), Box<dyn Error>> {
    let rig = rig(EngineConfig {
        ack_timeout: Duration::from_millis(200),
        ..config()
    })?;
    rig.engine.start()?;
    rig.loopback.set_mute_acks(true);

    let result = rig.engine.flush();
    assert!(matches!(
        result,
        Err(EngineError::Fault(Fault::Timeout("flush acknowledgement")))
    ));
    assert_eq!(rig.engine.status(), State::Error);
    assert_eq!(next_event(&rig.rx)?, Event::FlushStart);
    assert_eq!(next_fault(&rig.rx)?, Fault::Timeout("flush acknowledgement"));
    Ok(())
}

#[test]
#[serial]
fn test_mmu_fault_reported_once() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    rig.engine.push(frame(0, 64))?;
    drop(next_frame(&rig.rx)?);

    rig.loopback.inject_fault(Notification::MmuFault);
    assert_eq!(next_fault(&rig.rx)?, Fault::MmuFault);
    assert!(wait_for(|| rig.engine.status() == State::Error));
    assert_eq!(rig.engine.fault(), Some(Fault::MmuFault));
    assert_eq!(Fault::MmuFault.code(), 1);

    let refused = rig.engine.push(frame(1, 64));
    assert!(matches!(refused, Err(EngineError::Fault(Fault::MmuFault))));
    assert!(matches!(
        rig.engine.send_alg_ctrl(&[1]),
        Err(EngineError::Fault(Fault::MmuFault))
    ));

    rig.engine.stop()?;
    assert_eq!(rig.engine.status(), State::Stopped);
    assert!(!rig.loopback.sent().contains(&Message::stop()));
    assert_eq!(rig.loopback.outstanding(), Outstanding::default());
    assert!(matches!(rig.rx.try_recv(), Ok(None)));
    Ok(())
}

#[test]
#[serial]
fn test_unknown_completion_is_corruption() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    rig.engine.start()?;
    rig.loopback.post(Message::buffer(1, 0xdead_0000));

    assert_eq!(next_fault(&rig.rx)?, Fault::Corruption);
    assert!(wait_for(|| rig.engine.status() == State::Error));
    assert!(matches!(
        rig.engine.push(frame(0, 8)),
        Err(EngineError::Fault(Fault::Corruption))
    ));
    rig.engine.stop()?;
    assert_eq!(rig.loopback.outstanding(), Outstanding::default());
    Ok(())
}

#[test]
#[serial]
fn test_stop_releases_everything() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    let delivered = stream(&rig, 8, |_| 256)?;
    assert_eq!(delivered.len(), 8);
    rig.engine.send_alg_ctrl(&[0xaa; 12])?;

    rig.engine.stop()?;
    assert_eq!(rig.engine.status(), State::Stopped);
    assert!(rig.loopback.sent().contains(&Message::stop()));
    assert!(!rig.loopback.is_running());
    assert_eq!(rig.loopback.outstanding(), Outstanding::default());
    assert!(matches!(
        rig.engine.push(frame(0, 8)),
        Err(EngineError::NotRunning(State::Stopped))
    ));
    rig.engine.stop()?;

    rig.engine.start()?;
    let delivered = stream(&rig, 3, |_| 64)?;
    assert_eq!(delivered.len(), 3);
    assert_eq!(delivered[2].1, Some(FRAME_DURATION * 2));
    Ok(())
}

#[test]
#[serial]
fn test_frame_outlives_stop() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    rig.engine.push(frame(3, 128))?;
    let held = next_frame(&rig.rx)?;

    rig.engine.stop()?;
    assert_eq!(held.data(), &[3u8; 128][..]);
    assert_eq!(
        rig.loopback.outstanding(),
        Outstanding {
            reservations: 1,
            mappings: 1
        }
    );

    let Rig {
        loopback, engine, ..
    } = rig;
    drop(engine);
    assert_eq!(held.len(), 128);
    drop(held);
    assert_eq!(loopback.outstanding(), Outstanding::default());
    Ok(())
}

#[test]
#[serial]
fn test_playback_completed_keeps_running() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    rig.engine.start()?;

    rig.loopback.post_event(1, 0x0500);
    rig.loopback.post_event(2, 3);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(rig.engine.status(), State::Running);
    assert!(rig.engine.fault().is_none());

    rig.engine.push(frame(1, 32))?;
    assert_eq!(next_frame(&rig.rx)?.len(), 32);
    Ok(())
}

#[test]
#[serial]
fn test_alg_ctrl() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    assert!(matches!(
        rig.engine.send_alg_ctrl(&[1, 2, 3]),
        Err(EngineError::NotRunning(State::Idle))
    ));

    rig.engine.start()?;
    let idle = rig.loopback.outstanding();
    rig.engine.send_alg_ctrl(&[1, 2, 3, 4])?;
    rig.engine.send_alg_ctrl(&[5; 40])?;
    assert_eq!(rig.loopback.alg_ctrl(), vec![vec![1, 2, 3, 4], vec![5; 40]]);
    assert!(wait_for(|| rig.loopback.outstanding() == idle));
    Ok(())
}

#[test]
#[serial]
fn test_downstream_refusal() -> Result<(), Box<dyn Error>> {
    let Rig {
        loopback: _loopback,
        engine,
        rx,
    } = rig(config())?;
    drop(rx);

    engine.push(frame(0, 64))?;
    assert!(wait_for(|| engine.status() == State::Error));
    assert!(matches!(engine.fault(), Some(Fault::Downstream(_))));
    assert_eq!(engine.stats().delivered, 0);
    Ok(())
}

/// Memory placed at a chosen offset from an alignment boundary.
struct Window {
    data: Vec<u8>,
    start: usize,
    len: usize,
}

impl Window {
    fn new(len: usize, align: usize, misalign: usize, value: u8) -> Self {
        let data = vec![value; len + align * 2];
        let start = data.as_ptr().align_offset(align) + misalign;
        Self { data, start, len }
    }
}

impl HostMemory for Window {
    fn as_bytes(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.start + self.len]
    }
}

#[test]
#[serial]
fn test_input_copies() -> Result<(), Box<dyn Error>> {
    let rig = rig(EngineConfig {
        input_alignment: 64,
        input_buffer_size: 512,
        ..config()
    })?;

    rig.engine.push(InputFrame::new(Window::new(1024, 64, 0, 1)))?;
    assert_eq!(next_frame(&rig.rx)?.data(), &[1u8; 1024][..]);
    assert_eq!(rig.engine.stats().copied, 0);

    rig.engine.push(InputFrame::new(Window::new(1024, 64, 5, 2)))?;
    assert_eq!(next_frame(&rig.rx)?.data(), &[2u8; 1024][..]);
    assert_eq!(rig.engine.stats().copied, 1);

    rig.engine.push(InputFrame::new(vec![3u8; 100]))?;
    assert_eq!(next_frame(&rig.rx)?.data(), &[3u8; 100][..]);
    assert_eq!(rig.engine.stats().copied, 2);
    Ok(())
}

#[test]
#[serial]
fn test_big_endian_records() -> Result<(), Box<dyn Error>> {
    let rig = rig(EngineConfig {
        endian: Endian::Big,
        ..config()
    })?;
    let delivered = stream(&rig, 6, |index| 300 + index as usize * 7)?;
    for (index, (data, timestamp)) in delivered.iter().enumerate() {
        assert_eq!(data.len(), 300 + index * 7);
        assert_eq!(data[0], index as u8);
        assert_eq!(*timestamp, Some(FRAME_DURATION * index as u32));
    }
    Ok(())
}

/// Drops every other output frame.
#[derive(Default)]
struct Decimate {
    seen: AtomicU64,
}

impl Codec for Decimate {
    fn name(&self) -> &str {
        "decimate"
    }

    fn create_node_args(&self, layout: &PortLayout) -> NodeArgs {
        Passthrough.create_node_args(layout)
    }

    fn on_receive(&self, port: PortId, buf: &mut DmaBuffer, _params: Option<&[u8]>) -> Severity {
        if port == PortId::Output {
            buf.skip = self.seen.fetch_add(1, Ordering::Relaxed) % 2 == 1;
        }
        Severity::Info
    }
}

#[test]
#[serial]
fn test_codec_skips_frames() -> Result<(), Box<dyn Error>> {
    let rig = rig_with(config(), Arc::new(Decimate::default()))?;
    let delivered = stream(&rig, 6, |_| 48)?;

    let timestamps: Vec<_> = delivered.iter().map(|(_, ts)| *ts).collect();
    assert_eq!(
        timestamps,
        [0, 2, 4].map(|index| Some(FRAME_DURATION * index))
    );
    let stats = rig.engine.stats();
    assert_eq!(stats.skipped, 3);
    assert_eq!(stats.delivered, 3);
    Ok(())
}

/// Treats every coprocessor event as fatal.
struct Strict;

impl Codec for Strict {
    fn name(&self) -> &str {
        "strict"
    }

    fn create_node_args(&self, layout: &PortLayout) -> NodeArgs {
        Passthrough.create_node_args(layout)
    }

    fn on_event(&self, _arg_1: u32, _arg_2: u32) -> Severity {
        Severity::Fatal
    }
}

#[test]
#[serial]
fn test_fatal_codec_event() -> Result<(), Box<dyn Error>> {
    let rig = rig_with(config(), Arc::new(Strict))?;
    rig.engine.start()?;

    rig.loopback.post_event(1, 0x0500);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(rig.engine.status(), State::Running);

    rig.loopback.post_event(7, 9);
    assert_eq!(
        next_fault(&rig.rx)?,
        Fault::Codec {
            arg_1: 7,
            arg_2: 9
        }
    );
    assert!(wait_for(|| rig.engine.status() == State::Error));
    assert_eq!(rig.engine.fault().map(|fault| fault.code()), Some(4));
    Ok(())
}

#[test]
#[serial]
fn test_empty_frame() -> Result<(), Box<dyn Error>> {
    let rig = rig(EngineConfig {
        input_alignment: 64,
        ..config()
    })?;

    let empty = InputFrame::new(Vec::<u8>::new()).with_timing(FRAME_DURATION, FRAME_DURATION);
    rig.engine.push(empty)?;
    let delivered = next_frame(&rig.rx)?;
    assert!(delivered.is_empty());
    assert_eq!(delivered.timestamp, Some(FRAME_DURATION));
    assert_eq!(rig.engine.status(), State::Running);
    assert_eq!(rig.engine.stats().copied, 1);
    drop(delivered);

    rig.engine.push(frame(2, 16))?;
    assert_eq!(next_frame(&rig.rx)?.data(), &[2u8; 16][..]);
    Ok(())
}

#[test]
#[serial]
fn test_event_burst_keeps_frame_timestamps() -> Result<(), Box<dyn Error>> {
    let rig = rig(EngineConfig {
        ring_capacity: 8,
        ..config()
    })?;
    rig.loopback.set_manual(true);

    let second = Duration::from_secs(1);
    rig.engine
        .push(InputFrame::new(vec![9u8; 32]).with_timing(second, FRAME_DURATION))?;
    for index in 0..8 {
        rig.engine.push_event(Event::Tag(format!("tag{index}")))?;
    }
    assert_eq!(rig.engine.stats().overflows, 1);
    assert_eq!(rig.engine.ring().frames_in_flight, 1);

    rig.loopback.release(1);
    let delivered = next_frame(&rig.rx)?;
    assert_eq!(delivered.timestamp, Some(second));
    assert_eq!(delivered.data(), &[9u8; 32][..]);
    for index in 1..8 {
        assert_eq!(next_event(&rig.rx)?, Event::Tag(format!("tag{index}")));
    }
    assert!(quiet(&rig.rx));
    Ok(())
}

#[test]
#[serial]
fn test_refused_buffer_fails_engine() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    rig.engine.start()?;
    rig.loopback.set_refuse_buffers(true);

    assert!(matches!(
        rig.engine.push(frame(0, 16)),
        Err(EngineError::Io(_))
    ));
    assert!(matches!(next_fault(&rig.rx)?, Fault::Driver(_)));
    assert_eq!(rig.engine.status(), State::Error);
    assert_eq!(rig.engine.in_flight(PortId::Input), 0);

    rig.engine.stop()?;
    assert_eq!(rig.loopback.outstanding(), Outstanding::default());
    Ok(())
}

#[test]
#[serial]
fn test_stop_releases_blocked_push() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    rig.loopback.set_manual(true);
    rig.engine.push(frame(0, 16))?;
    rig.engine.push(frame(1, 16))?;

    let engine = &rig.engine;
    thread::scope(|scope| -> Result<(), Box<dyn Error>> {
        let blocked = scope.spawn(|| engine.push(frame(2, 16)));
        thread::sleep(Duration::from_millis(100));
        assert!(!blocked.is_finished());

        let start = Instant::now();
        engine.stop()?;
        let result = blocked.join().map_err(|_| "push panicked")?;
        println!("push released after {:?}", start.elapsed());
        assert!(matches!(result, Err(EngineError::NotRunning(State::Stopped))));
        Ok(())
    })?;
    assert_eq!(rig.loopback.outstanding(), Outstanding::default());
    Ok(())
}

#[test]
#[serial]
fn test_system_error_releases_blocked_push() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    rig.loopback.set_manual(true);
    rig.engine.push(frame(0, 16))?;
    rig.engine.push(frame(1, 16))?;

    let engine = &rig.engine;
    thread::scope(|scope| -> Result<(), Box<dyn Error>> {
        let blocked = scope.spawn(|| engine.push(frame(2, 16)));
        thread::sleep(Duration::from_millis(100));
        assert!(!blocked.is_finished());

        rig.loopback.inject_fault(Notification::SystemError);
        let result = blocked.join().map_err(|_| "push panicked")?;
        assert!(matches!(
            result,
            Err(EngineError::Fault(Fault::SystemError))
        ));
        Ok(())
    })?;

    assert_eq!(next_fault(&rig.rx)?, Fault::SystemError);
    assert_eq!(rig.engine.status(), State::Error);
    assert_eq!(rig.engine.fault().map(|fault| fault.code()), Some(2));
    rig.engine.stop()?;
    assert_eq!(rig.loopback.outstanding(), Outstanding::default());
    Ok(())
}

#[test]
#[serial]
fn test_failed_start_releases_node() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    rig.loopback.set_exhausted(true);

    assert!(matches!(
        rig.engine.push(frame(0, 16)),
        Err(EngineError::Io(_))
    ));
    assert_eq!(rig.engine.status(), State::Idle);
    assert!(!rig.loopback.has_node());
    assert_eq!(rig.loopback.outstanding(), Outstanding::default());
    assert!(quiet(&rig.rx));

    rig.loopback.set_exhausted(false);
    rig.engine.push(frame(1, 16))?;
    assert_eq!(rig.engine.status(), State::Running);
    assert_eq!(next_frame(&rig.rx)?.timestamp, Some(FRAME_DURATION));
    Ok(())
}

#[test]
#[serial]
fn test_concurrent_first_pushes_start_once() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    let engine = &rig.engine;

    let results: Vec<_> = thread::scope(|scope| {
        let pushers: Vec<_> = (0..2)
            .map(|index| scope.spawn(move || engine.push(frame(index, 16))))
            .collect();
        pushers
            .into_iter()
            .map(|pusher| pusher.join().map_err(|_| "push panicked"))
            .collect()
    });
    for result in results {
        result??;
    }

    let plays = rig
        .loopback
        .sent()
        .iter()
        .filter(|msg| **msg == Message::play())
        .count();
    assert_eq!(plays, 1);
    drop(next_frame(&rig.rx)?);
    drop(next_frame(&rig.rx)?);
    Ok(())
}

#[test]
#[serial]
fn test_flush_stop_allocation_failure() -> Result<(), Box<dyn Error>> {
    let rig = rig(config())?;
    rig.engine.start()?;
    rig.engine.flush_start()?;
    assert_eq!(next_event(&rig.rx)?, Event::FlushStart);

    rig.loopback.set_exhausted(true);
    assert!(rig.engine.flush_stop().is_err());
    assert_eq!(rig.engine.status(), State::Error);
    assert!(matches!(next_fault(&rig.rx)?, Fault::Driver(_)));

    rig.loopback.set_exhausted(false);
    rig.engine.stop()?;
    assert_eq!(rig.loopback.outstanding(), Outstanding::default());
    Ok(())
}

#[test]
#[serial]
fn test_stop_cancels_blocked_delivery() -> Result<(), Box<dyn Error>> {
    let loopback = Arc::new(Loopback::new());
    let (sink, rx) = ChannelSink::bounded(1);
    let engine = Engine::new(
        EngineConfig {
            output_buffers: 4,
            ..config()
        },
        loopback.clone(),
        Arc::new(Passthrough),
        Arc::new(sink),
    )?;

    for index in 0..3 {
        engine.push(frame(index, 64))?;
    }
    assert!(wait_for(|| engine.stats().completed == 3));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(engine.stats().delivered, 1);

    let start = Instant::now();
    engine.stop()?;
    println!("stopped in {:?}", start.elapsed());
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(engine.stats().delivered, 1);
    assert!(engine.fault().is_none());

    let held = next_frame(&rx)?;
    assert_eq!(held.data(), &[0u8; 64][..]);
    assert!(quiet(&rx));
    drop(held);
    assert_eq!(loopback.outstanding(), Outstanding::default());
    Ok(())
}
