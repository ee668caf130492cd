use std::sync::Arc;

use evsmux_core::prelude::*;

/// Client-facing delivery surface a consumer hands to
/// [`VirtualCamera::start_stream`](crate::virtual_camera::VirtualCamera::start_stream).
///
/// Implementations must not call back into the camera from inside these
/// methods; they run on the broker's dispatch path.
pub trait StreamSink: Send + Sync {
    /// Deliver one frame. Returning `false` declines the frame and the
    /// broker will not count this client as a consumer for it.
    fn deliver(&self, frame: FrameDesc) -> bool;

    /// Deliver an event. Returning `false` reports a forwarding failure; the
    /// broker logs it and moves on.
    fn notify(&self, event: CameraEvent) -> bool;
}

/// Receiving half of a [`QueueSink`].
pub struct QueueSinkRx {
    pub frames: BoundedRx<FrameDesc>,
    pub events: BoundedRx<CameraEvent>,
}

/// Sink that forwards frames and events into bounded non-blocking queues.
///
/// A full frame queue declines the delivery, which keeps a slow consumer from
/// pinning hardware buffers beyond its budget.
///
/// # Example
/// ```rust
/// use evsmux::prelude::*;
///
/// let (sink, rx) = QueueSink::channel(2, 4);
/// assert!(sink.deliver(FrameDesc::new(1, 100)));
/// assert!(matches!(rx.frames.recv(), RecvOutcome::Data(f) if f.buffer_id == 1));
/// ```
pub struct QueueSink {
    frames: BoundedTx<FrameDesc>,
    events: BoundedTx<CameraEvent>,
}

impl QueueSink {
    /// Create a sink plus its receiving half.
    pub fn channel(frame_depth: usize, event_depth: usize) -> (Arc<Self>, QueueSinkRx) {
        let (frames_tx, frames_rx) = bounded(frame_depth.max(1));
        let (events_tx, events_rx) = bounded(event_depth.max(1));
        (
            Arc::new(Self {
                frames: frames_tx,
                events: events_tx,
            }),
            QueueSinkRx {
                frames: frames_rx,
                events: events_rx,
            },
        )
    }

    /// Close both queues; subsequent deliveries are declined.
    pub fn close(&self) {
        self.frames.close();
        self.events.close();
    }
}

impl StreamSink for QueueSink {
    fn deliver(&self, frame: FrameDesc) -> bool {
        self.frames.send(frame) == SendOutcome::Ok
    }

    fn notify(&self, event: CameraEvent) -> bool {
        self.events.send(event) == SendOutcome::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_frame_queue_declines_delivery() {
        let (sink, rx) = QueueSink::channel(1, 1);
        assert!(sink.deliver(FrameDesc::new(1, 0)));
        assert!(!sink.deliver(FrameDesc::new(2, 0)));
        assert!(matches!(rx.frames.recv(), RecvOutcome::Data(f) if f.buffer_id == 1));
        assert!(sink.deliver(FrameDesc::new(3, 0)));
    }

    #[test]
    fn closed_sink_declines_everything() {
        let (sink, _rx) = QueueSink::channel(4, 4);
        sink.close();
        assert!(!sink.deliver(FrameDesc::new(1, 0)));
        assert!(!sink.notify(CameraEvent::StreamStopped));
    }
}
