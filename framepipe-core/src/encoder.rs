//! Video encoder seam.
//!
//! The capture thread drives a [`VideoEncoder`] synchronously: `submit`
//! on iterations that captured a frame, `poll` on the ones that did not.
//! Encoders that deliver output on their own thread (media-framework
//! callbacks, a child process reader) push it through a [`UnitSink`] and
//! drain the paired [`UnitInbox`] from those two calls, so only the
//! capture thread ever touches the frame queue.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::types::{AccessUnit, RawFrame};

// ── VideoEncoder ─────────────────────────────────────────────────

/// Turns raw frames into compressed access units.
pub trait VideoEncoder: Send {
    /// Feed one frame. May return zero, one or several access units,
    /// each either start-code delimited or u32-length-prefixed and each
    /// stamped with the `timestamp_us` of the submission it encodes.
    fn submit(&mut self, frame: RawFrame, timestamp_us: u64) -> Result<Vec<AccessUnit>>;

    /// Output that became ready since the last call, without new input.
    ///
    /// Called on iterations where the source had nothing new, so a
    /// buffering encoder's last picture does not wait for the next change
    /// on screen.
    fn poll(&mut self) -> Result<Vec<AccessUnit>> {
        Ok(Vec::new())
    }

    /// Out-of-band parameter sets, once the output format is negotiated.
    ///
    /// Either start-code delimited or a decoder-configuration record.
    fn parameter_sets(&self) -> Option<Bytes>;

    /// Short name for log lines.
    fn name(&self) -> &str {
        "encoder"
    }
}

impl<E: VideoEncoder + ?Sized> VideoEncoder for Box<E> {
    fn submit(&mut self, frame: RawFrame, timestamp_us: u64) -> Result<Vec<AccessUnit>> {
        (**self).submit(frame, timestamp_us)
    }

    fn poll(&mut self) -> Result<Vec<AccessUnit>> {
        (**self).poll()
    }

    fn parameter_sets(&self) -> Option<Bytes> {
        (**self).parameter_sets()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// ── UnitSink / UnitInbox ─────────────────────────────────────────

enum Delivery {
    Unit(Bytes),
    ParameterSets(Bytes),
}

/// Create a connected sink/inbox pair.
pub fn unit_channel() -> (UnitSink, UnitInbox) {
    let (tx, rx) = mpsc::channel();
    (
        UnitSink { tx },
        UnitInbox {
            rx,
            parameter_sets: None,
            disconnected: false,
        },
    )
}

/// Delivery end handed to the encoder's output thread.
#[derive(Clone)]
pub struct UnitSink {
    tx: Sender<Delivery>,
}

impl UnitSink {
    /// Hand over one access unit. Empty units are ignored.
    ///
    /// Returns false once the inbox has been dropped.
    pub fn deliver(&self, unit: Bytes) -> bool {
        if unit.is_empty() {
            return true;
        }
        self.tx.send(Delivery::Unit(unit)).is_ok()
    }

    /// Publish the negotiated parameter sets.
    pub fn deliver_parameter_sets(&self, blob: Bytes) -> bool {
        self.tx.send(Delivery::ParameterSets(blob)).is_ok()
    }
}

/// Receiving end, drained on the capture thread.
pub struct UnitInbox {
    rx: Receiver<Delivery>,
    parameter_sets: Option<Bytes>,
    disconnected: bool,
}

impl UnitInbox {
    /// Take everything delivered so far without blocking.
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut units = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(delivery) => self.accept(delivery, &mut units),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
        units
    }

    /// Wait up to `timeout` for the first delivery, then drain the rest.
    pub fn drain_timeout(&mut self, timeout: Duration) -> Vec<Bytes> {
        let mut units = Vec::new();
        match self.rx.recv_timeout(timeout) {
            Ok(delivery) => self.accept(delivery, &mut units),
            Err(RecvTimeoutError::Timeout) => return units,
            Err(RecvTimeoutError::Disconnected) => {
                self.disconnected = true;
                return units;
            }
        }
        units.extend(self.drain());
        units
    }

    /// Latest parameter sets published through the sink.
    pub fn parameter_sets(&self) -> Option<Bytes> {
        self.parameter_sets.clone()
    }

    /// True once every sink has been dropped and the backlog is empty.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn accept(&mut self, delivery: Delivery, units: &mut Vec<Bytes>) {
        match delivery {
            Delivery::Unit(unit) => units.push(unit),
            Delivery::ParameterSets(blob) => self.parameter_sets = Some(blob),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
