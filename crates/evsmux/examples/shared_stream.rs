//! Two clients sharing one simulated camera: a fenced viewer pacing itself
//! through next-frame requests, and a master client driving parameters.

use std::sync::Arc;

use evsmux::prelude::*;

struct SimProvider {
    camera: Arc<SimCamera>,
}

impl CameraProvider for SimProvider {
    fn open_camera(&self, _id: &str) -> Result<Arc<dyn HwCamera>, CameraError> {
        Ok(self.camera.clone())
    }
}

const BRIGHTNESS: ParamId = ParamId(1);

fn main() -> Result<(), CameraError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let hw = SimCamera::new("rear");
    hw.define_parameter(
        BRIGHTNESS,
        ParamRange {
            min: 0,
            max: 100,
            step: 5,
            default: 50,
        },
    );

    let enumerator = Enumerator::new(
        Arc::new(SimProvider { camera: hw.clone() }),
        Some(Arc::new(SoftwareFences)),
    );

    let viewer = enumerator.open_camera("rear")?;
    let controller = enumerator.open_camera("rear")?;

    let (viewer_sink, viewer_rx) = QueueSink::channel(4, 8);
    let (controller_sink, controller_rx) = QueueSink::channel(4, 8);
    viewer.start_stream(viewer_sink)?;
    controller.start_stream(controller_sink)?;

    controller.set_master()?;
    let applied = controller.set_parameter(BRIGHTNESS, 72)?;
    println!("brightness request 72 applied as {applied}");

    // The viewer paces itself: each fence becomes ready once a frame newer
    // than its last one arrives.
    let mut last_seen = -1_000_000_000i64;
    for i in 0..10u32 {
        let fence = viewer.request_next_frame(last_seen)?;
        hw.inject_frame(i, i as i64 * 33_000_000);
        if fence.is_ready()
            && let RecvOutcome::Data(frame) = viewer_rx.frames.recv()
        {
            println!(
                "viewer got buffer {} at {} ns",
                frame.buffer_id, frame.timestamp
            );
            last_seen = frame.timestamp;
            viewer.done_with_frame(frame.buffer_id)?;
        }
    }

    for event in controller_rx.events.drain() {
        println!("controller event: {event:?}");
    }

    let mut report = String::new();
    enumerator
        .dump(&mut report)
        .map_err(|e| CameraError::Underlying(e.to_string()))?;
    println!("{report}");

    enumerator.close_camera(&viewer);
    enumerator.close_camera(&controller);
    assert_eq!(enumerator.camera_count(), 0);
    Ok(())
}
