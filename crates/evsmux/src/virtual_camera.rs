use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use evsmux_core::prelude::*;

use crate::{hal_camera::HalCamera, sink::StreamSink};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a virtual camera client.
///
/// Keys the per-client timeline map and labels clients in logs and dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// One logical client of a multiplexed camera.
///
/// A virtual camera keeps its producers alive through strong references; the
/// producers only hold it weakly, so a client that goes away simply stops
/// being dispatched to.
///
/// # Example
/// ```rust
/// use evsmux::prelude::*;
/// use std::sync::Arc;
///
/// let hw = SimCamera::new("rear");
/// let hal = HalCamera::builder("rear", hw.clone()).build();
/// let client = hal.make_virtual_camera().unwrap();
///
/// let (sink, rx) = QueueSink::channel(4, 4);
/// client.start_stream(sink).unwrap();
/// hw.inject_frame(7, 1_000_000);
/// assert!(matches!(rx.frames.recv(), RecvOutcome::Data(f) if f.buffer_id == 7));
/// ```
pub struct VirtualCamera {
    id: ClientId,
    sources: Vec<Arc<HalCamera>>,
    allowed_buffers: usize,
    streaming: AtomicBool,
    shut_down: AtomicBool,
    sink: Mutex<Option<Arc<dyn StreamSink>>>,
    held: Mutex<HashMap<Arc<str>, Vec<FrameDesc>>>,
}

impl VirtualCamera {
    /// Create a client over the given producers with a fixed buffer budget.
    ///
    /// The budget never drops below one and is immutable afterwards. The
    /// client is not registered with its producers yet; see
    /// [`HalCamera::own_virtual_camera`].
    pub fn new(sources: Vec<Arc<HalCamera>>, allowed_buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            id: ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)),
            sources,
            allowed_buffers: allowed_buffers.max(1),
            streaming: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            sink: Mutex::new(None),
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.id
    }

    /// In-flight buffer budget granted to this client per producer.
    pub fn allowed_buffers(&self) -> usize {
        self.allowed_buffers
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Producers backing this client.
    pub fn sources(&self) -> &[Arc<HalCamera>] {
        &self.sources
    }

    /// Begin streaming into `sink`.
    ///
    /// Starts the underlying hardware stream if this is the first streaming
    /// client. A hardware refusal surfaces as `Underlying` and leaves the
    /// client stopped.
    pub fn start_stream(
        self: &Arc<Self>,
        sink: Arc<dyn StreamSink>,
    ) -> Result<(), CameraError> {
        if self.streaming.swap(true, Ordering::AcqRel) {
            return Err(CameraError::StreamAlreadyRunning);
        }
        *self.sink.lock() = Some(sink);
        for (idx, source) in self.sources.iter().enumerate() {
            if let Err(err) = source.client_stream_starting() {
                error!(camera = %source.id(), client = %self.id, error = %err,
                       "failed to start the underlying stream");
                for started in &self.sources[..idx] {
                    started.client_stream_ending(self);
                }
                *self.sink.lock() = None;
                self.streaming.store(false, Ordering::Release);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stop streaming. Idempotent.
    ///
    /// Held frames are returned to their producers; further deliveries are
    /// declined until the client re-registers.
    pub fn stop_stream(self: &Arc<Self>) {
        if !self.streaming.swap(false, Ordering::AcqRel) {
            return;
        }
        for source in &self.sources {
            source.client_stream_ending(self);
        }
        *self.sink.lock() = None;
        self.flush_held_frames();
    }

    /// Return one held buffer to its producer.
    pub fn done_with_frame(&self, buffer_id: u32) -> Result<(), CameraError> {
        let found = {
            let mut held = self.held.lock();
            let mut found = None;
            for (source_id, frames) in held.iter_mut() {
                if let Some(pos) = frames.iter().position(|f| f.buffer_id == buffer_id) {
                    found = Some((source_id.clone(), frames.remove(pos)));
                    break;
                }
            }
            found
        };
        let Some((source_id, frame)) = found else {
            warn!(client = %self.id, buffer_id, "client returned a buffer it does not hold");
            return Err(CameraError::UnknownBuffer(buffer_id));
        };
        if let Some(source) = self.source_by_id(&source_id) {
            source.done_with_frame(&frame);
        }
        Ok(())
    }

    /// Ask for the next frame newer than `last_timestamp`.
    ///
    /// Returns a fence that becomes ready when a qualifying frame has been
    /// delivered. Fails with `SyncUnsupported` for clients running in pull
    /// mode.
    pub fn request_next_frame(
        self: &Arc<Self>,
        last_timestamp: i64,
    ) -> Result<Fence, CameraError> {
        let source = self.sources.first().ok_or(CameraError::InvalidArg)?;
        source.request_new_frame(self, last_timestamp)
    }

    /// Acquire the exclusive-control role, failing if it is taken.
    pub fn set_master(self: &Arc<Self>) -> Result<(), CameraError> {
        for source in &self.sources {
            source.set_master(self)?;
        }
        Ok(())
    }

    /// Take the exclusive-control role unconditionally.
    ///
    /// A displaced master receives `MasterReleased`.
    pub fn force_master(self: &Arc<Self>) {
        for source in &self.sources {
            source.force_master(self);
        }
    }

    /// Give up the exclusive-control role.
    ///
    /// All clients, including this one, are notified that the role is free.
    pub fn unset_master(self: &Arc<Self>) -> Result<(), CameraError> {
        for source in &self.sources {
            source.unset_master(self)?;
        }
        Ok(())
    }

    /// Whether this client currently holds the exclusive-control role.
    pub fn is_master(self: &Arc<Self>) -> bool {
        self.sources
            .iter()
            .all(|source| source.is_master_client(self))
            && !self.sources.is_empty()
    }

    /// Write a camera parameter; requires the master role.
    ///
    /// Returns the value the hardware applied, which may differ from the
    /// requested value. Non-master callers get `InvalidArg`; the current
    /// value remains readable via [`get_parameter`](Self::get_parameter).
    pub fn set_parameter(self: &Arc<Self>, id: ParamId, value: i32) -> Result<i32, CameraError> {
        let source = self.sources.first().ok_or(CameraError::InvalidArg)?;
        source.set_parameter(self, id, value)
    }

    /// Read a camera parameter.
    pub fn get_parameter(&self, id: ParamId) -> Result<i32, CameraError> {
        let source = self.sources.first().ok_or(CameraError::InvalidArg)?;
        source.get_parameter(id)
    }

    /// Stop streaming and deregister from every producer. Idempotent.
    pub fn shutdown(self: &Arc<Self>) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_stream();
        for source in &self.sources {
            source.disown_virtual_camera(self);
        }
    }

    /// Called by a producer to hand this client a frame.
    ///
    /// Declines when the client is not streaming, is at its buffer budget for
    /// `source`, or its sink does not take the frame.
    pub(crate) fn deliver_frame(&self, source: &Arc<str>, frame: FrameDesc) -> bool {
        if !self.streaming.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut held = self.held.lock();
            let frames = held.entry(source.clone()).or_default();
            if frames.len() >= self.allowed_buffers {
                debug!(client = %self.id, buffer_id = frame.buffer_id,
                       "delivery declined: client is at its buffer budget");
                return false;
            }
            frames.push(frame);
        }
        let sink = self.sink.lock().clone();
        let delivered = sink.map(|s| s.deliver(frame)).unwrap_or(false);
        if !delivered {
            let mut held = self.held.lock();
            if let Some(frames) = held.get_mut(source)
                && let Some(pos) = frames.iter().position(|f| f.buffer_id == frame.buffer_id)
            {
                frames.remove(pos);
            }
        }
        delivered
    }

    /// Called by a producer to forward an event.
    pub(crate) fn notify(&self, event: CameraEvent) -> bool {
        let sink = self.sink.lock().clone();
        sink.map(|s| s.notify(event)).unwrap_or(false)
    }

    /// Number of frames currently held from `source`.
    pub fn held_count(&self, source: &str) -> usize {
        self.held
            .lock()
            .get(source)
            .map(|frames| frames.len())
            .unwrap_or(0)
    }

    /// Emit client state for diagnostics.
    pub fn dump(&self, out: &mut dyn fmt::Write, indent: &str) -> fmt::Result {
        writeln!(out, "{indent}streaming: {}", self.is_streaming())?;
        writeln!(out, "{indent}buffer budget: {}", self.allowed_buffers)?;
        let held = self.held.lock();
        for (source_id, frames) in held.iter() {
            let ids: Vec<u32> = frames.iter().map(|f| f.buffer_id).collect();
            writeln!(out, "{indent}held from {source_id}: {ids:?}")?;
        }
        Ok(())
    }

    fn source_by_id(&self, source_id: &str) -> Option<&Arc<HalCamera>> {
        self.sources.iter().find(|s| s.id() == source_id)
    }

    fn flush_held_frames(&self) {
        let held: Vec<(Arc<str>, Vec<FrameDesc>)> = self.held.lock().drain().collect();
        for (source_id, frames) in held {
            let Some(source) = self.source_by_id(&source_id) else {
                continue;
            };
            for frame in frames {
                source.done_with_frame(&frame);
            }
        }
    }
}
