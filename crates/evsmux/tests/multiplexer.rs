//! End-to-end scenarios driving the broker against the simulated camera.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use evsmux::prelude::*;

/// Sink that records everything it is handed.
struct CollectSink {
    frames: Mutex<Vec<FrameDesc>>,
    events: Mutex<Vec<CameraEvent>>,
}

impl CollectSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        })
    }

    fn frames(&self) -> Vec<FrameDesc> {
        self.frames.lock().clone()
    }

    fn events(&self) -> Vec<CameraEvent> {
        self.events.lock().clone()
    }

    fn released_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == CameraEvent::MasterReleased)
            .count()
    }
}

impl StreamSink for CollectSink {
    fn deliver(&self, frame: FrameDesc) -> bool {
        self.frames.lock().push(frame);
        true
    }

    fn notify(&self, event: CameraEvent) -> bool {
        self.events.lock().push(event);
        true
    }
}

struct FailingFences;

impl FenceFactory for FailingFences {
    fn create_timeline(&self) -> Result<Timeline, TimelineError> {
        Err(TimelineError::CreateFailed("sync primitive unavailable".into()))
    }
}

fn pull_mode_camera(id: &str) -> (Arc<SimCamera>, Arc<HalCamera>) {
    let hw = SimCamera::new(id);
    let hal = HalCamera::builder(id, hw.clone()).build();
    (hw, hal)
}

fn fenced_camera(id: &str, threshold_ns: i64) -> (Arc<SimCamera>, Arc<HalCamera>) {
    let hw = SimCamera::new(id);
    let hal = HalCamera::builder(id, hw.clone())
        .fences(Arc::new(SoftwareFences))
        .sync_threshold_ns(threshold_ns)
        .build();
    (hw, hal)
}

fn client_with_budget(hal: &Arc<HalCamera>, budget: usize) -> Arc<VirtualCamera> {
    let client = VirtualCamera::new(vec![hal.clone()], budget);
    hal.own_virtual_camera(&client).expect("register client");
    client
}

#[test]
fn single_client_round_trip() {
    let (hw, hal) = pull_mode_camera("rear");
    let client = client_with_budget(&hal, 2);
    let sink = CollectSink::new();
    client.start_stream(sink.clone()).unwrap();

    assert!(hw.inject_frame(7, 100));
    let frames = sink.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].buffer_id, 7);
    assert_eq!(frames[0].timestamp, 100);

    // The buffer is pinned until the client is done with it.
    assert!(hw.returned_batches().is_empty());
    client.done_with_frame(7).unwrap();
    assert_eq!(hw.returned_batches(), vec![vec![7]]);

    // No stale reference remains; returning again is an error at the client.
    assert_eq!(
        client.done_with_frame(7),
        Err(CameraError::UnknownBuffer(7))
    );
}

#[test]
fn two_clients_share_one_buffer() {
    let (hw, hal) = pull_mode_camera("rear");
    let a = client_with_budget(&hal, 2);
    let b = client_with_budget(&hal, 2);
    assert_eq!(hw.last_pool_request(), Some(4));

    let sink_a = CollectSink::new();
    let sink_b = CollectSink::new();
    a.start_stream(sink_a.clone()).unwrap();
    b.start_stream(sink_b.clone()).unwrap();

    hw.inject_frame(9, 1_000);
    assert_eq!(sink_a.frames().len(), 1);
    assert_eq!(sink_b.frames().len(), 1);

    a.done_with_frame(9).unwrap();
    assert!(hw.returned_batches().is_empty());
    b.done_with_frame(9).unwrap();
    assert_eq!(hw.returned_batches(), vec![vec![9]]);
}

#[test]
fn fenced_pacing_requeues_early_frames() {
    let (hw, hal) = fenced_camera("rear", 16);
    let client = client_with_budget(&hal, 2);
    let sink = CollectSink::new();
    client.start_stream(sink.clone()).unwrap();

    let fence = client.request_next_frame(1_000).unwrap();

    // Arrives only 10 ticks after the client's last frame: re-queued.
    hw.inject_frame(1, 1_010);
    assert!(!fence.is_ready());
    assert!(sink.frames().is_empty());
    assert_eq!(hal.stats().sync_skips(), 1);
    // Nobody accepted it, so it went straight back.
    assert_eq!(hw.returned_batches(), vec![vec![1]]);

    // 30 ticks is past the threshold: delivered and signaled.
    hw.inject_frame(2, 1_030);
    assert!(fence.is_ready());
    let frames = sink.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].buffer_id, 2);
}

#[test]
fn request_during_one_frame_serves_the_next() {
    let (hw, hal) = fenced_camera("rear", 16);
    let client = client_with_budget(&hal, 2);
    let sink = CollectSink::new();
    client.start_stream(sink.clone()).unwrap();

    let first = client.request_next_frame(0).unwrap();
    hw.inject_frame(1, 1_000);
    assert!(first.is_ready());
    client.done_with_frame(1).unwrap();

    // A new request after frame 1 was dispatched is only eligible for the
    // frame that follows, even though frame 1 already arrived.
    let second = client.request_next_frame(1_000).unwrap();
    assert!(!second.is_ready());
    hw.inject_frame(2, 2_000);
    assert!(second.is_ready());
    assert_eq!(sink.frames().len(), 2);
}

#[test]
fn master_preemption_and_release() {
    let (_hw, hal) = pull_mode_camera("rear");
    let a = client_with_budget(&hal, 1);
    let b = client_with_budget(&hal, 1);
    let sink_a = CollectSink::new();
    let sink_b = CollectSink::new();
    a.start_stream(sink_a.clone()).unwrap();
    b.start_stream(sink_b.clone()).unwrap();

    a.set_master().unwrap();
    assert!(a.is_master());
    assert_eq!(b.set_master(), Err(CameraError::OwnershipLost));

    b.force_master();
    assert!(b.is_master());
    assert!(!a.is_master());
    assert_eq!(sink_a.released_count(), 1);
    assert_eq!(sink_b.released_count(), 0);

    b.unset_master().unwrap();
    // The availability broadcast reaches every client, the releasing one
    // included.
    assert_eq!(sink_a.released_count(), 2);
    assert_eq!(sink_b.released_count(), 1);

    // Releasing again is a protocol violation.
    assert_eq!(b.unset_master(), Err(CameraError::InvalidArg));
}

#[test]
fn dead_client_is_skipped_at_dispatch() {
    let (hw, hal) = pull_mode_camera("rear");
    let a = client_with_budget(&hal, 2);
    let b = client_with_budget(&hal, 2);
    let sink_a = CollectSink::new();
    let sink_b = CollectSink::new();
    a.start_stream(sink_a).unwrap();
    b.start_stream(sink_b.clone()).unwrap();
    assert_eq!(hal.client_count(), 2);

    drop(a);
    assert_eq!(hal.client_count(), 1);

    hw.inject_frame(5, 2_000);
    assert_eq!(sink_b.frames().len(), 1);

    // Only the surviving client holds a reference; its return releases the
    // buffer without waiting on the vanished one.
    b.done_with_frame(5).unwrap();
    assert_eq!(hw.returned_batches(), vec![vec![5]]);
}

#[test]
fn timeline_failure_degrades_to_pull_mode() {
    let hw = SimCamera::new("rear");
    let hal = HalCamera::builder("rear", hw.clone())
        .fences(Arc::new(FailingFences))
        .build();
    let client = client_with_budget(&hal, 1);
    let sink = CollectSink::new();
    client.start_stream(sink.clone()).unwrap();

    assert!(matches!(
        client.request_next_frame(0),
        Err(CameraError::SyncUnsupported)
    ));

    // Frames still flow through the pull path.
    hw.inject_frame(3, 9_000);
    assert_eq!(sink.frames().len(), 1);
    assert_eq!(sink.frames()[0].buffer_id, 3);
}

#[test]
fn pool_tracks_budgets_and_external_buffers() {
    let (hw, hal) = pull_mode_camera("rear");
    let c1 = client_with_budget(&hal, 1);
    assert_eq!(hw.last_pool_request(), Some(1));
    let c2 = client_with_budget(&hal, 3);
    assert_eq!(hw.last_pool_request(), Some(4));
    let c3 = client_with_budget(&hal, 2);
    assert_eq!(hw.last_pool_request(), Some(6));

    c2.shutdown();
    assert_eq!(hw.last_pool_request(), Some(3));

    let imported = hal
        .import_external_buffers(&[FrameDesc::new(100, 0), FrameDesc::new(101, 0)])
        .unwrap();
    assert_eq!(imported, 2);

    // Imported buffers count toward every later renegotiation.
    let c4 = client_with_budget(&hal, 1);
    assert_eq!(hw.last_pool_request(), Some(6));

    c1.shutdown();
    assert_eq!(hw.last_pool_request(), Some(5));
    c3.shutdown();
    assert_eq!(hw.last_pool_request(), Some(3));
    c4.shutdown();
    // Only the imported buffers remain.
    assert_eq!(hw.last_pool_request(), Some(2));
}

#[test]
fn pool_never_drops_below_one() {
    let (hw, hal) = pull_mode_camera("rear");
    let client = client_with_budget(&hal, 2);
    assert_eq!(hw.last_pool_request(), Some(2));
    client.shutdown();
    assert_eq!(hw.last_pool_request(), Some(1));
}

#[test]
fn refcount_conservation_across_three_clients() {
    let (hw, hal) = pull_mode_camera("rear");
    let clients: Vec<_> = (0..3).map(|_| client_with_budget(&hal, 1)).collect();
    let sinks: Vec<_> = clients
        .iter()
        .map(|c| {
            let sink = CollectSink::new();
            c.start_stream(sink.clone()).unwrap();
            sink
        })
        .collect();

    hw.inject_frame(11, 1_000);
    for sink in &sinks {
        assert_eq!(sink.frames().len(), 1);
    }

    for (idx, client) in clients.iter().enumerate() {
        assert!(hw.returned_ids().is_empty(), "returned early at {idx}");
        client.done_with_frame(11).unwrap();
    }
    // Exactly one hardware return after exactly three client returns.
    assert_eq!(hw.returned_batches(), vec![vec![11]]);
}

#[test]
fn budget_cap_fails_delivery_without_dropping_held_frames() {
    let (hw, hal) = pull_mode_camera("rear");
    let client = client_with_budget(&hal, 1);
    let sink = CollectSink::new();
    client.start_stream(sink.clone()).unwrap();

    hw.inject_frame(1, 1_000);
    assert_eq!(sink.frames().len(), 1);

    // At the cap: the delivery fails and the frame bounces back to hardware.
    hw.inject_frame(2, 2_000);
    assert_eq!(sink.frames().len(), 1);
    assert_eq!(hw.returned_batches(), vec![vec![2]]);
    assert_eq!(hal.stats().frames_not_used(), 1);

    client.done_with_frame(1).unwrap();
    hw.inject_frame(3, 3_000);
    assert_eq!(sink.frames().len(), 2);
}

#[test]
fn stream_predicate_follows_clients() {
    let (hw, hal) = pull_mode_camera("rear");
    let a = client_with_budget(&hal, 1);
    let b = client_with_budget(&hal, 1);

    assert!(!hw.is_streaming());
    a.start_stream(CollectSink::new()).unwrap();
    assert!(hw.is_streaming());
    assert!(hal.is_stream_running());

    b.start_stream(CollectSink::new()).unwrap();
    a.stop_stream();
    assert!(hw.is_streaming(), "one streaming client keeps hardware running");

    b.stop_stream();
    assert!(!hw.is_streaming());
    assert!(!hal.is_stream_running());
}

#[test]
fn double_start_is_rejected_and_stop_is_idempotent() {
    let (_hw, hal) = pull_mode_camera("rear");
    let client = client_with_budget(&hal, 1);
    client.start_stream(CollectSink::new()).unwrap();
    assert_eq!(
        client.start_stream(CollectSink::new()),
        Err(CameraError::StreamAlreadyRunning)
    );
    client.stop_stream();
    client.stop_stream();
}

#[test]
fn unexpected_stream_stop_is_forwarded_and_forces_stopped() {
    let (hw, hal) = pull_mode_camera("rear");
    let client = client_with_budget(&hal, 1);
    let sink = CollectSink::new();
    client.start_stream(sink.clone()).unwrap();
    assert!(hal.is_stream_running());

    hw.emit(CameraEvent::StreamStopped);
    assert!(!hal.is_stream_running());
    assert!(sink.events().contains(&CameraEvent::StreamStopped));
}

#[test]
fn refused_stream_start_stays_stopped() {
    let (hw, hal) = pull_mode_camera("rear");
    let client = client_with_budget(&hal, 1);
    hw.refuse_start(true);
    let err = client.start_stream(CollectSink::new()).unwrap_err();
    assert_eq!(err.code(), "underlying");
    assert!(!client.is_streaming());
    assert!(!hal.is_stream_running());

    // A later attempt succeeds once the hardware recovers.
    hw.refuse_start(false);
    client.start_stream(CollectSink::new()).unwrap();
    assert!(hal.is_stream_running());
}

#[test]
fn refused_pool_resize_blocks_registration() {
    let (hw, hal) = pull_mode_camera("rear");
    hw.refuse_pool_resize(true);
    assert!(hal.make_virtual_camera().is_err());
    assert_eq!(hal.client_count(), 0);

    hw.refuse_pool_resize(false);
    assert!(hal.make_virtual_camera().is_ok());
    assert_eq!(hal.client_count(), 1);
}

#[test]
fn non_master_parameter_write_degrades_to_read() {
    let (hw, hal) = pull_mode_camera("rear");
    let brightness = ParamId(7);
    hw.define_parameter(
        brightness,
        ParamRange {
            min: 0,
            max: 50,
            step: 1,
            default: 10,
        },
    );
    let master = client_with_budget(&hal, 1);
    let other = client_with_budget(&hal, 1);
    let sink_other = CollectSink::new();
    other.start_stream(sink_other.clone()).unwrap();
    master.set_master().unwrap();

    // Hardware clamps: the applied value differs from the request.
    let applied = master.set_parameter(brightness, 100).unwrap();
    assert_eq!(applied, 50);
    assert!(
        sink_other
            .events()
            .contains(&CameraEvent::ParameterChanged {
                id: brightness,
                value: 50
            })
    );

    let writes_before = hw.param_writes().len();
    let reads_before = hw.param_reads().len();
    assert_eq!(
        other.set_parameter(brightness, 0),
        Err(CameraError::InvalidArg)
    );
    assert_eq!(hw.param_writes().len(), writes_before);
    assert_eq!(hw.param_reads().len(), reads_before + 1);
    assert_eq!(other.get_parameter(brightness).unwrap(), 50);
}

#[test]
fn legacy_single_buffer_delivery_is_rejected() {
    let (hw, hal) = pull_mode_camera("rear");
    let client = client_with_budget(&hal, 1);
    let sink = CollectSink::new();
    client.start_stream(sink.clone()).unwrap();

    hw.inject_legacy_frame(9, 500);
    assert!(sink.frames().is_empty());
    assert_eq!(hw.legacy_returned_ids(), vec![9]);
}

#[test]
fn fence_wait_unblocks_from_delivery_thread() {
    let (hw, hal) = fenced_camera("rear", 16);
    let client = client_with_budget(&hal, 2);
    client.start_stream(CollectSink::new()).unwrap();

    let fence = client.request_next_frame(0).unwrap();
    let waiter = std::thread::spawn(move || fence.wait(Duration::from_secs(5)));
    hw.inject_frame(1, 1_000_000);
    assert!(waiter.join().unwrap());
}

#[test]
fn stopping_a_client_releases_its_held_frames() {
    let (hw, hal) = pull_mode_camera("rear");
    let a = client_with_budget(&hal, 2);
    let b = client_with_budget(&hal, 2);
    a.start_stream(CollectSink::new()).unwrap();
    b.start_stream(CollectSink::new()).unwrap();

    hw.inject_frame(4, 1_000);
    // Both clients hold buffer 4; one stops without returning it explicitly.
    a.stop_stream();
    assert!(hw.returned_batches().is_empty());
    b.done_with_frame(4).unwrap();
    assert_eq!(hw.returned_batches(), vec![vec![4]]);
}

struct RecordingProvider {
    camera: Arc<SimCamera>,
    opens: Mutex<usize>,
}

impl CameraProvider for RecordingProvider {
    fn open_camera(&self, _id: &str) -> Result<Arc<dyn HwCamera>, CameraError> {
        *self.opens.lock() += 1;
        Ok(self.camera.clone())
    }
}

#[test]
fn enumerator_shares_brokers_and_tears_down_idle_ones() {
    let hw = SimCamera::new("rear");
    let provider = Arc::new(RecordingProvider {
        camera: hw.clone(),
        opens: Mutex::new(0),
    });
    let enumerator = Enumerator::new(provider.clone(), Some(Arc::new(SoftwareFences)));

    let a = enumerator.open_camera("rear").unwrap();
    let b = enumerator.open_camera("rear").unwrap();
    assert_eq!(*provider.opens.lock(), 1);
    assert_eq!(enumerator.camera_count(), 1);
    assert!(Arc::ptr_eq(&a.sources()[0], &b.sources()[0]));

    enumerator.close_camera(&a);
    assert_eq!(enumerator.camera_count(), 1);
    enumerator.close_camera(&b);
    assert_eq!(enumerator.camera_count(), 0);

    // A fresh open goes back to the provider.
    let _c = enumerator.open_camera("rear").unwrap();
    assert_eq!(*provider.opens.lock(), 2);
}

#[test]
fn dump_reports_clients_and_sync_support() {
    let (_hw, hal) = fenced_camera("rear", 16);
    let client = client_with_budget(&hal, 2);
    client.start_stream(CollectSink::new()).unwrap();

    let mut out = String::new();
    hal.dump(&mut out).unwrap();
    assert!(out.contains("HalCamera: rear"));
    assert!(out.contains(&client.client_id().to_string()));
    assert!(out.contains("fenced delivery: true"));
    assert!(out.contains("Synchronization support: true"));
}
