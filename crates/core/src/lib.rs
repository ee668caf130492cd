#![doc = include_str!("../README.md")]

pub mod error;
pub mod events;
pub mod frame;
pub mod metrics;
pub mod params;
pub mod queue;
pub mod records;
pub mod timeline;

pub mod prelude {
    pub use crate::{
        error::CameraError,
        events::CameraEvent,
        frame::{FourCc, FrameDesc, Resolution, StreamConfig},
        metrics::MuxStats,
        params::{ParamId, ParamRange},
        queue::{BoundedRx, BoundedTx, RecvOutcome, SendOutcome, bounded},
        records::{FrameRecordTable, Release},
        timeline::{Fence, FenceFactory, SoftwareFences, Timeline, TimelineError},
    };
}
