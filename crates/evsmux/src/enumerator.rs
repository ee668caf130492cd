use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;
use tracing::{debug, info};

use evsmux_core::prelude::*;
use evsmux_hal::HwCamera;

use crate::{hal_camera::HalCamera, virtual_camera::VirtualCamera};

/// Source of hardware camera devices, keyed by camera id.
pub trait CameraProvider: Send + Sync {
    fn open_camera(&self, id: &str) -> Result<Arc<dyn HwCamera>, CameraError>;
}

/// Registry mapping each hardware camera id to the single broker
/// multiplexing it.
///
/// Brokers are created on demand and torn down when their last client is
/// released, which also releases the hardware device.
///
/// # Example
/// ```rust
/// use evsmux::prelude::*;
/// use std::sync::Arc;
///
/// struct SimProvider;
/// impl CameraProvider for SimProvider {
///     fn open_camera(&self, id: &str) -> Result<Arc<dyn HwCamera>, CameraError> {
///         Ok(SimCamera::new(id))
///     }
/// }
///
/// let enumerator = Enumerator::new(Arc::new(SimProvider), Some(Arc::new(SoftwareFences)));
/// let a = enumerator.open_camera("rear").unwrap();
/// let b = enumerator.open_camera("rear").unwrap();
/// // Both clients share one broker.
/// assert!(Arc::ptr_eq(&a.sources()[0], &b.sources()[0]));
/// ```
pub struct Enumerator {
    provider: Arc<dyn CameraProvider>,
    fences: Option<Arc<dyn FenceFactory>>,
    cameras: Mutex<HashMap<String, Arc<HalCamera>>>,
}

static GLOBAL: OnceLock<Enumerator> = OnceLock::new();

impl Enumerator {
    pub fn new(provider: Arc<dyn CameraProvider>, fences: Option<Arc<dyn FenceFactory>>) -> Self {
        Self {
            provider,
            fences,
            cameras: Mutex::new(HashMap::new()),
        }
    }

    /// Install the process-wide enumerator.
    ///
    /// The first installation wins; later calls return the existing
    /// instance.
    pub fn install(enumerator: Enumerator) -> &'static Enumerator {
        GLOBAL.get_or_init(|| enumerator)
    }

    /// The process-wide enumerator, if one was installed.
    pub fn global() -> Option<&'static Enumerator> {
        GLOBAL.get()
    }

    /// Open a client on the camera with the given id, creating the broker on
    /// first use.
    pub fn open_camera(&self, id: &str) -> Result<Arc<VirtualCamera>, CameraError> {
        let existing = self.cameras.lock().get(id).cloned();
        let hal = match existing {
            Some(hal) => hal,
            None => {
                let hw = self.provider.open_camera(id)?;
                let hal = HalCamera::builder(id, hw)
                    .fences_opt(self.fences.clone())
                    .build();
                debug!(camera = id, "created a broker for the hardware camera");
                // A racing open may have inserted an entry meanwhile; the
                // first one wins.
                self.cameras
                    .lock()
                    .entry(id.to_string())
                    .or_insert_with(|| hal.clone())
                    .clone()
            }
        };
        let client = hal.make_virtual_camera();
        if client.is_err() {
            self.drop_idle_brokers();
        }
        client
    }

    /// Shut a client down and tear down brokers that lost their last client.
    pub fn close_camera(&self, client: &Arc<VirtualCamera>) {
        client.shutdown();
        self.drop_idle_brokers();
    }

    /// Number of brokers currently alive.
    pub fn camera_count(&self) -> usize {
        self.cameras.lock().len()
    }

    /// Emit registry state plus each broker's own dump.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let cameras: Vec<Arc<HalCamera>> = self.cameras.lock().values().cloned().collect();
        writeln!(out, "Enumerator: {} active camera(s)", cameras.len())?;
        for camera in cameras {
            camera.dump(out)?;
        }
        Ok(())
    }

    fn drop_idle_brokers(&self) {
        let mut cameras = self.cameras.lock();
        let before = cameras.len();
        cameras.retain(|_, hal| hal.client_count() > 0);
        if cameras.len() != before {
            info!(
                released = before - cameras.len(),
                "released hardware cameras with no remaining clients"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evsmux_hal::sim::SimCamera;

    struct SimProvider;

    impl CameraProvider for SimProvider {
        fn open_camera(&self, id: &str) -> Result<Arc<dyn HwCamera>, CameraError> {
            Ok(SimCamera::new(id))
        }
    }

    #[test]
    fn first_install_wins() {
        assert!(Enumerator::global().is_none());
        let installed = Enumerator::install(Enumerator::new(Arc::new(SimProvider), None));
        let again = Enumerator::install(Enumerator::new(Arc::new(SimProvider), None));
        assert!(std::ptr::eq(installed, again));
        assert!(Enumerator::global().is_some());

        let client = installed.open_camera("rear").unwrap();
        assert_eq!(installed.camera_count(), 1);
        installed.close_camera(&client);
        assert_eq!(installed.camera_count(), 0);
    }
}
