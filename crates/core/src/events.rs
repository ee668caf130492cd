use crate::params::ParamId;

/// Events flowing from the hardware layer to clients.
///
/// The broker forwards every event to all live clients best-effort; it also
/// synthesizes `MasterReleased` and `ParameterChanged` itself as part of the
/// exclusive-control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CameraEvent {
    /// The hardware video stream began producing frames.
    StreamStarted,
    /// The hardware video stream ended.
    StreamStopped,
    /// The exclusive-control role is available again, or was taken away from
    /// the receiving client.
    MasterReleased,
    /// A parameter write was applied; carries the value now in effect.
    ParameterChanged { id: ParamId, value: i32 },
}
