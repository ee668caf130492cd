#![doc = include_str!("../README.md")]

use std::sync::Arc;

use smallvec::SmallVec;

use evsmux_core::prelude::*;

pub mod sim;

/// Integer parameter values as the hardware reports them.
///
/// Logical cameras may answer with one value per underlying device; the
/// common case is a single element.
pub type ParamValues = SmallVec<[i32; 4]>;

/// Delivery callback surface a camera stream sink must expose.
///
/// The broker implements this and hands itself to
/// [`HwCamera::start_video_stream`].
pub trait CameraSink: Send + Sync {
    /// Legacy single-buffer delivery path.
    ///
    /// Brokers speaking the batched protocol reject this immediately and
    /// return the buffer.
    fn deliver_frame(&self, frame: FrameDesc);

    /// Batched delivery; the first descriptor's timestamp is authoritative.
    fn deliver_frames(&self, frames: &[FrameDesc]);

    /// Out-of-band event delivery.
    fn notify(&self, event: CameraEvent);
}

/// Capability set the broker requires from a hardware camera.
///
/// Implementations must be thread-safe: the broker issues these calls from
/// client threads and from its own dispatch paths, never while holding its
/// frame lock.
pub trait HwCamera: Send + Sync {
    /// Resize the in-flight buffer pool. A refusal leaves the previous count
    /// in effect.
    fn set_max_frames_in_flight(&self, count: u32) -> Result<(), CameraError>;

    /// Import caller-provided buffers into the pool; returns how many the
    /// hardware accepted.
    fn import_external_buffers(&self, buffers: &[FrameDesc]) -> Result<u32, CameraError>;

    /// Begin streaming into `sink`.
    fn start_video_stream(&self, sink: Arc<dyn CameraSink>) -> Result<(), CameraError>;

    /// Request the stream to stop; completion is reported through a
    /// [`CameraEvent::StreamStopped`] on the sink.
    fn stop_video_stream(&self) -> Result<(), CameraError>;

    /// Return a single buffer (legacy path).
    fn done_with_frame(&self, frame: FrameDesc);

    /// Return a batch of buffers.
    fn done_with_frames(&self, frames: &[FrameDesc]);

    /// Write an integer parameter; the returned values are what the hardware
    /// actually applied (it may clamp).
    fn set_int_parameter(&self, id: ParamId, value: i32) -> Result<ParamValues, CameraError>;

    /// Read an integer parameter.
    fn get_int_parameter(&self, id: ParamId) -> Result<ParamValues, CameraError>;

    /// Active stream configuration.
    fn stream_config(&self) -> StreamConfig;
}
