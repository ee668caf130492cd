use std::{
    collections::{HashMap, VecDeque},
    fmt, mem,
    sync::{
        Arc, Weak,
        atomic::{AtomicI64, Ordering},
    },
    time::Instant,
};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use evsmux_core::prelude::*;
use evsmux_hal::{CameraSink, HwCamera};

use crate::{
    tunables::mux_tunables,
    virtual_camera::{ClientId, VirtualCamera},
};

/// One client's standing request for the next frame.
struct FrameRequest {
    client: Weak<VirtualCamera>,
    client_id: ClientId,
    last_timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Stopped,
    Running,
    Stopping,
}

/// State guarded by the frame mutex: record table, both request queues, the
/// client list, and the timeline map.
struct FrameState {
    clients: Vec<Weak<VirtualCamera>>,
    records: FrameRecordTable,
    next_requests: VecDeque<FrameRequest>,
    current_requests: VecDeque<FrameRequest>,
    timelines: HashMap<ClientId, Timeline>,
}

/// Broker multiplexing one hardware camera to many virtual camera clients.
///
/// The broker owns the hardware stream for its lifetime, tracks how many
/// clients still hold each delivered buffer, paces fenced clients through
/// per-client timelines, and arbitrates the exclusive-control role for
/// parameter writes. Clients are held through weak references; a client that
/// goes away is dropped at the next dispatch point.
///
/// Hardware calls are never issued while the frame mutex is held.
/// Registration, pool renegotiation, and stream start/stop serialize on the
/// control mutex, which the delivery and event callbacks never take, so a
/// hardware callback reentering from inside one of those calls cannot
/// deadlock.
pub struct HalCamera {
    id: Arc<str>,
    hw: Arc<dyn HwCamera>,
    fences: Option<Arc<dyn FenceFactory>>,
    sync_threshold_ns: i64,
    created: Instant,
    config: StreamConfig,
    external_delta: AtomicI64,
    /// Serializes client registration and stream lifecycle against hardware.
    /// Lock order: control before frame or stream_state, never the reverse.
    control: Mutex<()>,
    frame: Mutex<FrameState>,
    stream_state: Mutex<StreamState>,
    master: Mutex<Weak<VirtualCamera>>,
    stats: MuxStats,
}

/// Builder for a [`HalCamera`].
///
/// # Example
/// ```rust
/// use evsmux::prelude::*;
/// use std::sync::Arc;
///
/// let hw = SimCamera::new("rear");
/// let hal = HalCamera::builder("rear", hw)
///     .fences(Arc::new(SoftwareFences))
///     .sync_threshold_ns(8_000_000)
///     .build();
/// assert!(hal.sync_supported());
/// ```
pub struct HalCameraBuilder {
    id: String,
    hw: Arc<dyn HwCamera>,
    fences: Option<Arc<dyn FenceFactory>>,
    sync_threshold_ns: Option<i64>,
}

impl HalCameraBuilder {
    /// Enable fence-based delivery through the given factory.
    pub fn fences(mut self, factory: Arc<dyn FenceFactory>) -> Self {
        self.fences = Some(factory);
        self
    }

    /// Apply an optional fence factory.
    ///
    /// Pass `None` to leave every client in pull mode.
    pub fn fences_opt(mut self, factory: Option<Arc<dyn FenceFactory>>) -> Self {
        self.fences = factory;
        self
    }

    /// Override the fenced-delivery pacing threshold for this camera.
    pub fn sync_threshold_ns(mut self, ns: i64) -> Self {
        self.sync_threshold_ns = Some(ns);
        self
    }

    pub fn build(self) -> Arc<HalCamera> {
        let config = self.hw.stream_config();
        Arc::new(HalCamera {
            id: self.id.into(),
            hw: self.hw,
            fences: self.fences,
            sync_threshold_ns: self
                .sync_threshold_ns
                .unwrap_or_else(|| mux_tunables().sync_threshold_ns)
                .max(1),
            created: Instant::now(),
            config,
            external_delta: AtomicI64::new(0),
            control: Mutex::new(()),
            frame: Mutex::new(FrameState {
                clients: Vec::new(),
                records: FrameRecordTable::new(),
                next_requests: VecDeque::new(),
                current_requests: VecDeque::new(),
                timelines: HashMap::new(),
            }),
            stream_state: Mutex::new(StreamState::Stopped),
            master: Mutex::new(Weak::new()),
            stats: MuxStats::default(),
        })
    }
}

impl HalCamera {
    pub fn builder(id: &str, hw: Arc<dyn HwCamera>) -> HalCameraBuilder {
        HalCameraBuilder {
            id: id.to_string(),
            hw,
            fences: None,
            sync_threshold_ns: None,
        }
    }

    /// Hardware camera id this broker wraps.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether fence-based delivery can be offered to clients at all.
    pub fn sync_supported(&self) -> bool {
        self.fences.is_some()
    }

    /// Delivery counters for this camera.
    pub fn stats(&self) -> &MuxStats {
        &self.stats
    }

    /// Active stream configuration, captured at construction.
    pub fn stream_config(&self) -> StreamConfig {
        self.config
    }

    /// Whether the hardware stream is currently running.
    pub fn is_stream_running(&self) -> bool {
        *self.stream_state.lock() == StreamState::Running
    }

    /// Number of live registered clients.
    pub fn client_count(&self) -> usize {
        self.frame
            .lock()
            .clients
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Frames received per second since creation.
    pub fn framerate(&self) -> f64 {
        let secs = self.created.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.stats.frames_received() as f64 / secs
        } else {
            0.0
        }
    }

    /// Construct and register a client with the default buffer budget.
    pub fn make_virtual_camera(self: &Arc<Self>) -> Result<Arc<VirtualCamera>, CameraError> {
        let budget = mux_tunables().default_client_buffers;
        let client = VirtualCamera::new(vec![self.clone()], budget);
        self.own_virtual_camera(&client)?;
        Ok(client)
    }

    /// Register a client: grow the buffer pool for its budget, then try to
    /// set up fence-based delivery for it.
    ///
    /// If the hardware refuses the new pool size the client is not
    /// registered. A timeline-creation failure is downgraded to pull-mode
    /// delivery for this client.
    pub fn own_virtual_camera(
        self: &Arc<Self>,
        client: &Arc<VirtualCamera>,
    ) -> Result<(), CameraError> {
        let _control = self.control.lock();
        self.renegotiate_pool(client.allowed_buffers() as i64)?;

        let mut st = self.frame.lock();
        if let Some(factory) = &self.fences {
            match factory.create_timeline() {
                Ok(timeline) => {
                    st.timelines.insert(client.client_id(), timeline);
                }
                Err(err) => {
                    warn!(camera = %self.id, client = %client.client_id(), error = %err,
                          "timeline creation failed; client will use pull delivery");
                }
            }
        }
        st.clients.push(Arc::downgrade(client));
        Ok(())
    }

    /// Deregister a client and shrink the buffer pool accordingly.
    ///
    /// Absence of the client is logged but non-fatal.
    pub fn disown_virtual_camera(&self, client: &Arc<VirtualCamera>) {
        let _control = self.control.lock();
        {
            let mut st = self.frame.lock();
            let target = Arc::as_ptr(client);
            let before = st.clients.len();
            st.clients.retain(|w| w.as_ptr() != target);
            if st.clients.len() == before {
                error!(camera = %self.id, client = %client.client_id(),
                       "client not found in the ownership list");
            }
            if let Some(pos) = st
                .next_requests
                .iter()
                .position(|r| r.client_id == client.client_id())
            {
                st.next_requests.remove(pos);
            }
            if let Some(timeline) = st.timelines.remove(&client.client_id()) {
                timeline.bump_signal();
            }
        }
        if let Err(err) = self.renegotiate_pool(0) {
            error!(camera = %self.id, error = %err,
                   "failed to shrink the in-flight buffer pool");
        }
    }

    /// Renegotiate the in-flight buffer pool as
    /// `max(1, Σ client budgets + imported buffers + delta)`.
    ///
    /// A hardware refusal leaves all state unchanged.
    pub fn change_frames_in_flight(&self, delta: i64) -> Result<(), CameraError> {
        let _control = self.control.lock();
        self.renegotiate_pool(delta)
    }

    /// Import caller-provided buffers into the hardware pool.
    ///
    /// The pool grows by however many buffers the hardware accepted. An
    /// import failure is fatal for this call but disturbs no existing state.
    pub fn import_external_buffers(&self, buffers: &[FrameDesc]) -> Result<u32, CameraError> {
        if buffers.is_empty() {
            debug!(camera = %self.id, "no external buffers to add");
            return Ok(0);
        }
        let _control = self.control.lock();
        let accepted = self.hw.import_external_buffers(buffers).map_err(|err| {
            error!(camera = %self.id, error = %err, "failed to add external capture buffers");
            err
        })?;
        self.external_delta
            .fetch_add(accepted as i64, Ordering::AcqRel);
        let target = self.required_pool_size(0);
        self.frame.lock().records.compact(target as usize);
        Ok(accepted)
    }

    /// Caller must hold the control mutex.
    fn renegotiate_pool(&self, delta: i64) -> Result<(), CameraError> {
        let target = self.required_pool_size(delta);
        self.hw.set_max_frames_in_flight(target)?;
        self.frame.lock().records.compact(target as usize);
        Ok(())
    }

    /// First streaming client starts the hardware stream.
    ///
    /// A hardware refusal leaves the aggregate state `Stopped` and surfaces
    /// the error.
    pub fn client_stream_starting(self: &Arc<Self>) -> Result<(), CameraError> {
        let _control = self.control.lock();
        if *self.stream_state.lock() != StreamState::Stopped {
            return Ok(());
        }
        // The state guard is not held across the hardware call; the sink may
        // reenter notify() on this thread before start returns.
        let sink: Arc<dyn CameraSink> = self.clone();
        match self.hw.start_video_stream(sink) {
            Ok(()) => {
                *self.stream_state.lock() = StreamState::Running;
                Ok(())
            }
            Err(err) => {
                error!(camera = %self.id, error = %err, "hardware refused to start the stream");
                Err(err)
            }
        }
    }

    /// A client stops streaming: drop its pending request and timeline,
    /// remove it from the client list, and stop the hardware stream once no
    /// streaming client remains.
    pub fn client_stream_ending(&self, client: &Arc<VirtualCamera>) {
        let _control = self.control.lock();
        let still_running = {
            let mut st = self.frame.lock();
            let target = Arc::as_ptr(client);
            if let Some(pos) = st
                .next_requests
                .iter()
                .position(|r| r.client_id == client.client_id())
            {
                st.next_requests.remove(pos);
                if let Some(timeline) = st.timelines.remove(&client.client_id()) {
                    timeline.bump_signal();
                }
            }
            if let Some(pos) = st.clients.iter().position(|w| w.as_ptr() == target) {
                st.clients.remove(pos);
            }
            st.clients
                .iter()
                .filter_map(|w| w.upgrade())
                .any(|c| c.is_streaming())
        };
        if !still_running {
            *self.stream_state.lock() = StreamState::Stopping;
            if let Err(err) = self.hw.stop_video_stream() {
                warn!(camera = %self.id, error = %err, "hardware refused to stop the stream");
            }
        }
    }

    /// Mint a fence for a client's next-frame request.
    pub(crate) fn request_new_frame(
        &self,
        client: &Arc<VirtualCamera>,
        last_timestamp: i64,
    ) -> Result<Fence, CameraError> {
        let mut st = self.frame.lock();
        let Some(timeline) = st.timelines.get(&client.client_id()) else {
            error!(camera = %self.id, client = %client.client_id(),
                   "fence-based frame delivery is not available for this client");
            return Err(CameraError::SyncUnsupported);
        };
        timeline.bump_issuance();
        let fence = timeline.create_fence();
        st.next_requests.push_back(FrameRequest {
            client: Arc::downgrade(client),
            client_id: client.client_id(),
            last_timestamp,
        });
        Ok(fence)
    }

    /// Drop one client reference on a delivered buffer; the last reference
    /// returns it to hardware.
    pub(crate) fn done_with_frame(&self, frame: &FrameDesc) {
        let release = self.frame.lock().records.release(frame.buffer_id);
        if release == Release::Returnable {
            self.hw.done_with_frames(&[*frame]);
        }
    }

    /// Acquire the exclusive-control role for `client` if it is free.
    pub(crate) fn set_master(&self, client: &Arc<VirtualCamera>) -> Result<(), CameraError> {
        let mut master = self.master.lock();
        if master.upgrade().is_none() {
            debug!(camera = %self.id, client = %client.client_id(), "client becomes master");
            *master = Arc::downgrade(client);
            Ok(())
        } else {
            info!(camera = %self.id, "camera already has a master client");
            Err(CameraError::OwnershipLost)
        }
    }

    /// Hand the exclusive-control role to `client` unconditionally,
    /// notifying a displaced master.
    pub(crate) fn force_master(&self, client: &Arc<VirtualCamera>) {
        let previous = {
            let mut master = self.master.lock();
            let previous = master.upgrade();
            *master = Arc::downgrade(client);
            previous
        };
        match previous {
            Some(prev) if Arc::ptr_eq(&prev, client) => {
                debug!(camera = %self.id, client = %client.client_id(),
                       "client is already the master");
            }
            Some(prev) => {
                info!(camera = %self.id, new = %client.client_id(), old = %prev.client_id(),
                      "high priority client steals the master role");
                if !prev.notify(CameraEvent::MasterReleased) {
                    error!(camera = %self.id, "failed to deliver the master-release notification");
                }
            }
            None => {}
        }
    }

    /// Release the exclusive-control role held by `client`.
    ///
    /// The availability broadcast goes through the generic event forwarder,
    /// so the releasing client hears it too.
    pub(crate) fn unset_master(&self, client: &Arc<VirtualCamera>) -> Result<(), CameraError> {
        {
            let mut master = self.master.lock();
            match master.upgrade() {
                Some(current) if Arc::ptr_eq(&current, client) => {
                    *master = Weak::new();
                }
                _ => return Err(CameraError::InvalidArg),
            }
        }
        info!(camera = %self.id, "master role released");
        self.broadcast(CameraEvent::MasterReleased);
        Ok(())
    }

    pub(crate) fn is_master_client(&self, client: &Arc<VirtualCamera>) -> bool {
        self.master
            .lock()
            .upgrade()
            .map(|m| Arc::ptr_eq(&m, client))
            .unwrap_or(false)
    }

    /// Apply a parameter write for `client`.
    ///
    /// Only the master may write; anyone else gets `InvalidArg` and the
    /// request degrades to a read of the current value. A successful write
    /// broadcasts `ParameterChanged` with the applied value.
    pub(crate) fn set_parameter(
        &self,
        client: &Arc<VirtualCamera>,
        id: ParamId,
        value: i32,
    ) -> Result<i32, CameraError> {
        if !self.is_master_client(client) {
            warn!(camera = %self.id, client = %client.client_id(),
                  "parameter change request from a non-master client declined");
            match self.get_parameter(id) {
                Ok(current) => {
                    debug!(camera = %self.id, param = ?id, current, "current value retained")
                }
                Err(err) => {
                    debug!(camera = %self.id, param = ?id, error = %err, "read-back failed")
                }
            }
            return Err(CameraError::InvalidArg);
        }
        let applied = self.hw.set_int_parameter(id, value)?;
        let applied = applied
            .first()
            .copied()
            .ok_or_else(|| CameraError::Underlying("empty parameter response".into()))?;
        self.broadcast(CameraEvent::ParameterChanged { id, value: applied });
        Ok(applied)
    }

    /// Read the current value of a parameter from hardware.
    pub fn get_parameter(&self, id: ParamId) -> Result<i32, CameraError> {
        let values = self.hw.get_int_parameter(id)?;
        values
            .first()
            .copied()
            .ok_or_else(|| CameraError::Underlying("empty parameter response".into()))
    }

    /// Emit broker state for diagnostics.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "HalCamera: {}", self.id)?;
        writeln!(out, "\tUp: {:?}", self.created.elapsed())?;
        writeln!(
            out,
            "\tFrames received: {} ({:.2} fps)",
            self.stats.frames_received(),
            self.framerate()
        )?;
        writeln!(out, "\tFrames not used: {}", self.stats.frames_not_used())?;
        writeln!(out, "\tFrames skipped to sync: {}", self.stats.sync_skips())?;
        writeln!(out, "\tActive stream configuration:")?;
        writeln!(out, "\t\tid: {}", self.config.id)?;
        writeln!(out, "\t\twidth: {}", self.config.resolution.width)?;
        writeln!(out, "\t\theight: {}", self.config.resolution.height)?;
        writeln!(out, "\t\tformat: {}", self.config.format)?;
        writeln!(out, "\t\tusage: 0x{:x}", self.config.usage)?;
        writeln!(out, "\t\trotation: {}", self.config.rotation)?;
        writeln!(out, "\tActive clients:")?;
        {
            let st = self.frame.lock();
            for weak in &st.clients {
                let Some(client) = weak.upgrade() else {
                    continue;
                };
                writeln!(out, "\t\t{}", client.client_id())?;
                client.dump(out, "\t\t\t")?;
                writeln!(
                    out,
                    "\t\t\tfenced delivery: {}",
                    st.timelines.contains_key(&client.client_id())
                )?;
            }
        }
        match self.master.lock().upgrade() {
            Some(master) => writeln!(out, "\tMaster client: {}", master.client_id())?,
            None => writeln!(out, "\tMaster client: none")?,
        }
        writeln!(out, "\tSynchronization support: {}", self.sync_supported())
    }

    fn required_pool_size(&self, delta: i64) -> u32 {
        let st = self.frame.lock();
        let mut count: i64 = st
            .clients
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|c| c.allowed_buffers() as i64)
            .sum();
        count += self.external_delta.load(Ordering::Acquire);
        count += delta;
        count.max(1) as u32
    }

    /// Dispatch one hardware delivery to all eligible clients.
    ///
    /// Fenced clients go first: the request-queue swap under the frame lock
    /// is the linearization point, so requests deposited during dispatch are
    /// served on the next frame. Pull-mode clients follow in stable list
    /// order. If nobody accepted the frame it goes straight back to
    /// hardware; otherwise a record tracks the outstanding references.
    fn dispatch_frames(&self, frames: &[FrameDesc]) {
        let Some(first) = frames.first() else {
            return;
        };
        let frame = *first;
        let timestamp = frame.timestamp;
        let mut deliveries: u32 = 0;
        {
            let mut st = self.frame.lock();
            let st = &mut *st;
            if self.sync_supported() {
                debug_assert!(st.current_requests.is_empty());
                mem::swap(&mut st.current_requests, &mut st.next_requests);
                while let Some(request) = st.current_requests.pop_front() {
                    let Some(client) = request.client.upgrade() else {
                        // Dropping the vanished client's timeline force-signals
                        // any fence it still has outstanding.
                        st.timelines.remove(&request.client_id);
                        continue;
                    };
                    if timestamp.saturating_sub(request.last_timestamp) < self.sync_threshold_ns {
                        debug!(camera = %self.id, buffer_id = frame.buffer_id,
                               "skipping a frame that arrived too soon");
                        st.next_requests.push_back(request);
                        self.stats.record_sync_skip();
                    } else if client.deliver_frame(&self.id, frame) {
                        debug!(camera = %self.id, buffer_id = frame.buffer_id,
                               client = %client.client_id(), "forwarded a fenced frame");
                        if let Some(timeline) = st.timelines.get(&client.client_id()) {
                            timeline.bump_signal();
                        }
                        deliveries += 1;
                    }
                }
            }
            self.stats.record_received();

            let clients: Vec<Arc<VirtualCamera>> =
                st.clients.iter().filter_map(|w| w.upgrade()).collect();
            for client in clients {
                if self.sync_supported() && st.timelines.contains_key(&client.client_id()) {
                    continue;
                }
                if client.deliver_frame(&self.id, frame) {
                    deliveries += 1;
                }
            }

            if deliveries > 0 {
                st.records.track(frame.buffer_id, deliveries);
            }
        }
        if deliveries == 0 {
            info!(camera = %self.id, buffer_id = frame.buffer_id,
                  "no client accepted the frame; returning it to hardware");
            self.stats.record_not_used();
            self.hw.done_with_frames(frames);
        }
    }

    fn broadcast(&self, event: CameraEvent) {
        let clients: Vec<Arc<VirtualCamera>> = self
            .frame
            .lock()
            .clients
            .iter()
            .filter_map(|w| w.upgrade())
            .collect();
        for client in clients {
            if !client.notify(event) {
                info!(camera = %self.id, client = %client.client_id(),
                      "failed to forward an event");
            }
        }
    }
}

impl CameraSink for HalCamera {
    fn deliver_frame(&self, frame: FrameDesc) {
        info!(camera = %self.id, buffer_id = frame.buffer_id,
              "rejecting a single-buffer delivery from the legacy hardware path");
        self.hw.done_with_frame(frame);
    }

    fn deliver_frames(&self, frames: &[FrameDesc]) {
        self.dispatch_frames(frames);
    }

    fn notify(&self, event: CameraEvent) {
        debug!(camera = %self.id, ?event, "received an event");
        if event == CameraEvent::StreamStopped {
            let mut state = self.stream_state.lock();
            if *state != StreamState::Stopping {
                warn!(camera = %self.id, "stream stopped unexpectedly");
            }
            *state = StreamState::Stopped;
        }
        self.broadcast(event);
    }
}
