// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Notification thread.
//!
//! Waits on the node's notification sources with a bounded timeout and
//! dispatches every message the node queued. Hardware faults move the engine
//! into the error state and end the thread.

use crate::{
    bridge::{Link, Notification},
    codec::Severity,
    engine::{Shared, State},
    error::Fault,
    port::PortId,
    protocol::{Command, Message},
};
use std::{
    sync::{atomic::Ordering, Arc},
    thread,
};
use tracing::{debug, info, trace, trace_span, warn};

/// Turns a panic on the notification thread into a reported fault so that
/// every waiter is released.
struct PanicGuard<'a>(&'a Shared);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.fail(Fault::Corruption);
        }
    }
}

pub(crate) fn run(shared: Arc<Shared>) {
    let _guard = PanicGuard(&shared);
    let timeout = shared.config.event_timeout;
    debug!("notification thread started");

    while !shared.done.load(Ordering::SeqCst) {
        match shared.bridge.wait_for_events(timeout) {
            Ok(None) => trace!("no events"),
            Ok(Some(Notification::MessageReady)) => drain(&shared),
            Ok(Some(Notification::MmuFault)) => {
                shared.fail(Fault::MmuFault);
                break;
            }
            Ok(Some(Notification::SystemError)) => {
                shared.fail(Fault::SystemError);
                break;
            }
            Ok(Some(Notification::Unknown(index))) => {
                shared.fail(Fault::UnknownNotification(index));
                break;
            }
            Err(err) => {
                warn!("wait for events failed: {err}");
                thread::sleep(shared.config.message_timeout);
            }
        }
    }
    debug!("notification thread done");
}

fn drain(shared: &Shared) {
    let Some(link) = shared.link() else {
        return;
    };
    loop {
        match shared
            .bridge
            .get_message(link.node, shared.config.message_timeout)
        {
            Ok(Some(msg)) => dispatch(shared, &link, msg),
            Ok(None) => break,
            Err(err) => {
                warn!("get message failed: {err}");
                break;
            }
        }
    }
}

fn dispatch(shared: &Shared, link: &Link<'_>, msg: Message) {
    let _span = trace_span!("dispatch", cmd = msg.cmd).entered();
    match msg.command() {
        Command::Buffer => buffer_done(shared, link, msg),
        Command::Flush => {
            debug!(port = msg.port(), "flush acknowledged");
            shared.flush_acks.push(msg.port());
        }
        Command::Stop => {
            debug!("stop acknowledged");
            shared.stop_acks.push(());
        }
        Command::AlgCtrl => shared.alg_ctrl_done(),
        Command::Event if msg.is_playback_completed() => info!("playback completed"),
        Command::Event => {
            if shared.codec.on_event(msg.arg_1, msg.arg_2) == Severity::Fatal {
                shared.fail(Fault::Codec {
                    arg_1: msg.arg_1,
                    arg_2: msg.arg_2,
                });
            }
        }
        Command::Play => debug!("play acknowledged"),
        Command::Unknown(cmd) => warn!(cmd, "unhandled command {msg}"),
    }
}

fn buffer_done(shared: &Shared, link: &Link<'_>, msg: Message) {
    let Some(id) = PortId::from_wire(msg.port()) else {
        warn!(port = msg.port(), "buffer done on unknown port");
        return;
    };
    let port = &shared.ports[id.index()];
    match port.complete(link, msg.arg_1) {
        Ok(Some((_, Severity::Fatal))) => shared.fail(Fault::Codec {
            arg_1: msg.arg_1,
            arg_2: msg.arg_2,
        }),
        Ok(Some((mut buf, _))) => match id {
            PortId::Input => {
                drop(buf.detach_external());
                port.put(buf);
            }
            PortId::Output => {
                shared.stats.completed.fetch_add(1, Ordering::Relaxed);
                port.put(buf);
            }
        },
        Ok(None) => match shared.status() {
            State::Running => panic!(
                "completion for unknown comm record {:#x} on {id:?} port",
                msg.arg_1
            ),
            state => debug!(?state, record = msg.arg_1, "ignoring late completion"),
        },
        Err(err) => shared.fail(Fault::Driver(err.to_string())),
    }
}
