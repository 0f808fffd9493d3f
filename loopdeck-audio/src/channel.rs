//! Cross-thread message channels.
//!
//! Two fixed-capacity lock-free SPSC rings connect the control plane and the
//! render context: control to audio carrying [`ControlMessage`], audio to
//! control carrying [`AudioMessage`]. Pushing never blocks; on a full ring
//! the message is dropped and the call still reports success, because the
//! high-rate traffic (speed, gain sweeps) is deliberately best-effort.
//! Popping never blocks either; an empty ring yields nothing for the block.

use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

use crate::constants::QUEUE_CAPACITY;
use crate::messages::{AudioMessage, ControlMessage};

/// Control-plane end of the command ring.
pub struct ControlSender {
    inner: HeapProd<ControlMessage>,
}

/// Render-context end of the command ring.
pub struct ControlReceiver {
    inner: HeapCons<ControlMessage>,
}

/// Render-context end of the telemetry ring.
pub struct TelemetrySender {
    inner: HeapProd<AudioMessage>,
}

/// Control-plane end of the telemetry ring.
pub struct TelemetryReceiver {
    inner: HeapCons<AudioMessage>,
}

impl ControlSender {
    /// Push a command. Returns whether the ring accepted it; callers other
    /// than tests ignore the result by design.
    #[inline]
    pub fn send(&mut self, msg: ControlMessage) -> bool {
        self.inner.try_push(msg).is_ok()
    }
}

impl ControlReceiver {
    /// Pop the next pending command, if any. Never blocks.
    #[inline]
    pub fn recv(&mut self) -> Option<ControlMessage> {
        self.inner.try_pop()
    }
}

impl TelemetrySender {
    /// Push a telemetry event, dropping it when the control plane lags.
    #[inline]
    pub fn send(&mut self, msg: AudioMessage) -> bool {
        self.inner.try_push(msg).is_ok()
    }
}

impl TelemetryReceiver {
    /// Pop the next pending event, if any. Never blocks.
    #[inline]
    pub fn recv(&mut self) -> Option<AudioMessage> {
        self.inner.try_pop()
    }
}

/// Build the control-to-audio ring.
pub fn control_channel() -> (ControlSender, ControlReceiver) {
    let (prod, cons) = HeapRb::new(QUEUE_CAPACITY).split();
    (
        ControlSender { inner: prod },
        ControlReceiver { inner: cons },
    )
}

/// Build the audio-to-control ring.
pub fn telemetry_channel() -> (TelemetrySender, TelemetryReceiver) {
    let (prod, cons) = HeapRb::new(QUEUE_CAPACITY).split();
    (
        TelemetrySender { inner: prod },
        TelemetryReceiver { inner: cons },
    )
}
