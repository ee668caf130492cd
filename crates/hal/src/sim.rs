//! Deterministic in-process camera used by tests and examples.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use smallvec::smallvec;
use tracing::debug;

use evsmux_core::prelude::*;

use crate::{CameraSink, HwCamera, ParamValues};

struct ParamState {
    range: ParamRange,
    value: i32,
}

/// Simulated hardware camera.
///
/// Frames are produced on demand through [`SimCamera::inject_frame`], every
/// downward call is recorded for inspection, and failure modes (pool-resize
/// refusal, start refusal, partial buffer import) can be toggled at runtime.
///
/// # Example
/// ```rust
/// use evsmux_hal::{HwCamera, sim::SimCamera};
///
/// let camera = SimCamera::new("rear");
/// camera.set_max_frames_in_flight(2).unwrap();
/// assert_eq!(camera.pool_history(), vec![2]);
/// ```
pub struct SimCamera {
    id: String,
    config: StreamConfig,
    params: Mutex<HashMap<ParamId, ParamState>>,
    sink: Mutex<Option<Arc<dyn CameraSink>>>,
    streaming: AtomicBool,
    refuse_pool_resize: AtomicBool,
    refuse_start: AtomicBool,
    refuse_import: AtomicBool,
    import_limit: Mutex<Option<u32>>,
    pool_history: Mutex<Vec<u32>>,
    returned: Mutex<Vec<Vec<u32>>>,
    legacy_returned: Mutex<Vec<u32>>,
    param_reads: Mutex<Vec<ParamId>>,
    param_writes: Mutex<Vec<(ParamId, i32)>>,
}

impl SimCamera {
    /// Create a camera with a default 1280x720 configuration.
    pub fn new(id: &str) -> Arc<Self> {
        let config = StreamConfig {
            id: 0,
            resolution: Resolution::new(1280, 720).expect("static resolution"),
            format: FourCc::new(*b"RGBA"),
            usage: 0x300,
            rotation: 0,
        };
        Self::with_config(id, config)
    }

    /// Create a camera with an explicit stream configuration.
    pub fn with_config(id: &str, config: StreamConfig) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            config,
            params: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            streaming: AtomicBool::new(false),
            refuse_pool_resize: AtomicBool::new(false),
            refuse_start: AtomicBool::new(false),
            refuse_import: AtomicBool::new(false),
            import_limit: Mutex::new(None),
            pool_history: Mutex::new(Vec::new()),
            returned: Mutex::new(Vec::new()),
            legacy_returned: Mutex::new(Vec::new()),
            param_reads: Mutex::new(Vec::new()),
            param_writes: Mutex::new(Vec::new()),
        })
    }

    /// Hardware camera id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register an integer parameter with its range and default value.
    pub fn define_parameter(&self, id: ParamId, range: ParamRange) {
        self.params.lock().insert(
            id,
            ParamState {
                range,
                value: range.default,
            },
        );
    }

    /// Deliver one frame to the attached sink via the batched path.
    ///
    /// Returns `false` when no stream is running.
    pub fn inject_frame(&self, buffer_id: u32, timestamp: i64) -> bool {
        self.inject_frames(&[FrameDesc::new(buffer_id, timestamp)])
    }

    /// Deliver a batch of frames to the attached sink.
    pub fn inject_frames(&self, frames: &[FrameDesc]) -> bool {
        if !self.streaming.load(Ordering::Acquire) {
            return false;
        }
        let Some(sink) = self.sink.lock().clone() else {
            return false;
        };
        sink.deliver_frames(frames);
        true
    }

    /// Deliver one frame through the legacy single-buffer path.
    pub fn inject_legacy_frame(&self, buffer_id: u32, timestamp: i64) -> bool {
        if !self.streaming.load(Ordering::Acquire) {
            return false;
        }
        let Some(sink) = self.sink.lock().clone() else {
            return false;
        };
        sink.deliver_frame(FrameDesc::new(buffer_id, timestamp));
        true
    }

    /// Emit an event to the attached sink, bypassing stream state.
    pub fn emit(&self, event: CameraEvent) -> bool {
        let Some(sink) = self.sink.lock().clone() else {
            return false;
        };
        sink.notify(event);
        true
    }

    /// Refuse subsequent pool-resize requests.
    pub fn refuse_pool_resize(&self, refuse: bool) {
        self.refuse_pool_resize.store(refuse, Ordering::Release);
    }

    /// Refuse subsequent stream starts.
    pub fn refuse_start(&self, refuse: bool) {
        self.refuse_start.store(refuse, Ordering::Release);
    }

    /// Refuse subsequent buffer imports.
    pub fn refuse_import(&self, refuse: bool) {
        self.refuse_import.store(refuse, Ordering::Release);
    }

    /// Accept at most `limit` buffers per import.
    pub fn set_import_limit(&self, limit: Option<u32>) {
        *self.import_limit.lock() = limit;
    }

    /// Every pool size requested so far, oldest first.
    pub fn pool_history(&self) -> Vec<u32> {
        self.pool_history.lock().clone()
    }

    /// The most recent pool size request.
    pub fn last_pool_request(&self) -> Option<u32> {
        self.pool_history.lock().last().copied()
    }

    /// Batches of buffer ids returned through the batched path.
    pub fn returned_batches(&self) -> Vec<Vec<u32>> {
        self.returned.lock().clone()
    }

    /// All buffer ids returned through the batched path, flattened.
    pub fn returned_ids(&self) -> Vec<u32> {
        self.returned.lock().iter().flatten().copied().collect()
    }

    /// Buffer ids returned through the legacy single-buffer path.
    pub fn legacy_returned_ids(&self) -> Vec<u32> {
        self.legacy_returned.lock().clone()
    }

    /// Whether a stream is currently running.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Current value of a parameter.
    pub fn param_value(&self, id: ParamId) -> Option<i32> {
        self.params.lock().get(&id).map(|p| p.value)
    }

    /// Parameter ids read so far.
    pub fn param_reads(&self) -> Vec<ParamId> {
        self.param_reads.lock().clone()
    }

    /// Parameter writes applied so far, post-clamp.
    pub fn param_writes(&self) -> Vec<(ParamId, i32)> {
        self.param_writes.lock().clone()
    }
}

impl HwCamera for SimCamera {
    fn set_max_frames_in_flight(&self, count: u32) -> Result<(), CameraError> {
        if self.refuse_pool_resize.load(Ordering::Acquire) {
            return Err(CameraError::Underlying("pool resize refused".into()));
        }
        debug!(camera = %self.id, count, "pool resized");
        self.pool_history.lock().push(count);
        Ok(())
    }

    fn import_external_buffers(&self, buffers: &[FrameDesc]) -> Result<u32, CameraError> {
        if self.refuse_import.load(Ordering::Acquire) {
            return Err(CameraError::Underlying("buffer import refused".into()));
        }
        let limit = (*self.import_limit.lock()).unwrap_or(buffers.len() as u32);
        Ok(limit.min(buffers.len() as u32))
    }

    fn start_video_stream(&self, sink: Arc<dyn CameraSink>) -> Result<(), CameraError> {
        if self.refuse_start.load(Ordering::Acquire) {
            return Err(CameraError::Underlying("stream start refused".into()));
        }
        *self.sink.lock() = Some(sink.clone());
        self.streaming.store(true, Ordering::Release);
        sink.notify(CameraEvent::StreamStarted);
        Ok(())
    }

    fn stop_video_stream(&self) -> Result<(), CameraError> {
        if self.streaming.swap(false, Ordering::AcqRel) {
            let sink = self.sink.lock().take();
            if let Some(sink) = sink {
                sink.notify(CameraEvent::StreamStopped);
            }
        }
        Ok(())
    }

    fn done_with_frame(&self, frame: FrameDesc) {
        self.legacy_returned.lock().push(frame.buffer_id);
    }

    fn done_with_frames(&self, frames: &[FrameDesc]) {
        self.returned
            .lock()
            .push(frames.iter().map(|f| f.buffer_id).collect());
    }

    fn set_int_parameter(&self, id: ParamId, value: i32) -> Result<ParamValues, CameraError> {
        let mut params = self.params.lock();
        let Some(state) = params.get_mut(&id) else {
            return Err(CameraError::InvalidArg);
        };
        state.value = state.range.clamp(value);
        let applied = state.value;
        drop(params);
        self.param_writes.lock().push((id, applied));
        Ok(smallvec![applied])
    }

    fn get_int_parameter(&self, id: ParamId) -> Result<ParamValues, CameraError> {
        self.param_reads.lock().push(id);
        let params = self.params.lock();
        let Some(state) = params.get(&id) else {
            return Err(CameraError::InvalidArg);
        };
        Ok(smallvec![state.value])
    }

    fn stream_config(&self) -> StreamConfig {
        self.config
    }
}
