use std::sync::{Mutex, OnceLock};

/// Default gap below which a fenced request skips the current frame.
///
/// Roughly half the nominal 33 ms inter-frame interval at 30 fps.
pub const DEFAULT_SYNC_THRESHOLD_NS: i64 = 16_000_000;
/// Default in-flight buffer budget granted to each new client.
pub const DEFAULT_CLIENT_BUFFERS: usize = 1;

/// Process-wide defaults for newly built cameras.
///
/// # Example
/// ```rust,ignore
/// use evsmux::prelude::*;
///
/// set_mux_tunables(MuxTunables {
///     sync_threshold_ns: 8_000_000,
///     default_client_buffers: 2,
/// });
/// ```
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MuxTunables {
    /// Timestamp gap in nanoseconds below which a fenced request is
    /// re-queued for the next frame.
    pub sync_threshold_ns: i64,
    /// In-flight buffer budget for clients created via
    /// `HalCamera::make_virtual_camera`.
    pub default_client_buffers: usize,
}

impl Default for MuxTunables {
    fn default() -> Self {
        Self {
            sync_threshold_ns: DEFAULT_SYNC_THRESHOLD_NS,
            default_client_buffers: DEFAULT_CLIENT_BUFFERS,
        }
    }
}

impl MuxTunables {
    fn sanitized(self) -> Self {
        Self {
            sync_threshold_ns: self.sync_threshold_ns.max(1),
            default_client_buffers: self.default_client_buffers.max(1),
        }
    }
}

static MUX_TUNABLES: OnceLock<Mutex<MuxTunables>> = OnceLock::new();

/// Override multiplexer tunables process-wide.
pub fn set_mux_tunables(tunables: MuxTunables) {
    let lock = MUX_TUNABLES.get_or_init(|| Mutex::new(MuxTunables::default()));
    *lock.lock().unwrap() = tunables.sanitized();
}

pub(crate) fn mux_tunables() -> MuxTunables {
    MUX_TUNABLES
        .get()
        .and_then(|t| t.lock().ok().map(|v| *v))
        .unwrap_or_default()
}

/// Builder for process-wide multiplexer tunables.
///
/// # Example
/// ```rust,ignore
/// use evsmux::prelude::*;
///
/// MuxConfig::new()
///     .sync_threshold_ns(8_000_000)
///     .default_client_buffers(2)
///     .apply();
/// ```
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MuxConfig {
    tunables: MuxTunables,
}

impl MuxConfig {
    /// Start building a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the fenced-delivery pacing threshold.
    pub fn sync_threshold_ns(mut self, ns: i64) -> Self {
        self.tunables.sync_threshold_ns = ns;
        self
    }

    /// Override the per-client buffer budget default.
    pub fn default_client_buffers(mut self, buffers: usize) -> Self {
        self.tunables.default_client_buffers = buffers;
        self
    }

    /// Apply the configuration to global tunables.
    pub fn apply(self) {
        set_mux_tunables(self.tunables);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_values_usable() {
        let t = MuxTunables {
            sync_threshold_ns: 0,
            default_client_buffers: 0,
        }
        .sanitized();
        assert_eq!(t.sync_threshold_ns, 1);
        assert_eq!(t.default_client_buffers, 1);
    }
}
