#![doc = include_str!("../README.md")]

pub use evsmux_core as core;
pub use evsmux_hal as hal;

pub mod enumerator;
pub mod hal_camera;
pub mod sink;
pub mod tunables;
pub mod virtual_camera;

pub mod prelude {
    pub use crate::{
        enumerator::{CameraProvider, Enumerator},
        hal_camera::{HalCamera, HalCameraBuilder},
        sink::{QueueSink, QueueSinkRx, StreamSink},
        tunables::{
            DEFAULT_CLIENT_BUFFERS, DEFAULT_SYNC_THRESHOLD_NS, MuxConfig, MuxTunables,
            set_mux_tunables,
        },
        virtual_camera::{ClientId, VirtualCamera},
    };
    pub use evsmux_core::prelude::*;
    pub use evsmux_hal::{CameraSink, HwCamera, sim::SimCamera};
}
