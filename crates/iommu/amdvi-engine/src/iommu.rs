//! The IOMMU device: shared state and the public front door.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use amdvi_format::{IoPerm, MsiMessage};
use parking_lot::{Mutex, MutexGuard};

use crate::cache::{CacheOccupancy, Caches};
use crate::config::IommuConfig;
use crate::error::IommuError;
use crate::platform::Platform;
use crate::regs::DeviceState;
use crate::translate::Translation;
use crate::worker::{self, WakeSignal};

/// State shared between the front-ends and the command worker.
///
/// `device` and `caches` are separate lock domains and are never held at the
/// same time. `drain_lock` serializes command drains and is taken before
/// either of them.
pub(crate) struct Shared<P> {
    pub config: IommuConfig,
    pub platform: P,
    pub device: Mutex<DeviceState>,
    pub caches: Mutex<Caches>,
    pub drain_lock: Mutex<()>,
    pub wake: WakeSignal,
    pub stop: AtomicBool,
}

impl<P: Platform> Shared<P> {
    /// Takes the device lock within the configured budget.
    pub(crate) fn lock_device(&self) -> Result<MutexGuard<'_, DeviceState>, IommuError> {
        self.device
            .try_lock_for(self.config.lock_timeout())
            .ok_or(IommuError::Busy)
    }
}

/// An emulated AMD-Vi IOMMU.
///
/// All methods take `&self` and may be called from any thread. Dropping the
/// engine stops and joins the command worker.
pub struct Iommu<P: Platform> {
    shared: Arc<Shared<P>>,
    worker: Option<JoinHandle<()>>,
}

impl<P: Platform> Iommu<P> {
    /// Creates an engine in its power-on state.
    ///
    /// # Errors
    ///
    /// Returns [`IommuError::Config`] if `config` fails
    /// [`IommuConfig::validate`], or [`IommuError::WorkerSpawn`] if the command
    /// worker is enabled and its thread cannot be started.
    pub fn new(config: IommuConfig, platform: P) -> Result<Self, IommuError> {
        config.validate()?;
        log::info!(
            "amd-vi: device {:#06x}, caches dte={} iotlb={} irte={}",
            config.device_id,
            config.dte_cache_entries,
            config.iotlb_entries,
            config.irte_cache_entries
        );
        let spawn_worker = config.command_worker;
        let shared = Arc::new(Shared {
            caches: Mutex::new(Caches::new(&config)),
            config,
            platform,
            device: Mutex::new(DeviceState::new()),
            drain_lock: Mutex::new(()),
            wake: WakeSignal::new(),
            stop: AtomicBool::new(false),
        });
        let worker = if spawn_worker {
            Some(worker::spawn(Arc::clone(&shared)).map_err(IommuError::WorkerSpawn)?)
        } else {
            None
        };
        Ok(Self { shared, worker })
    }

    /// Translates a DMA access of `len` bytes at `iova` by `device_id`.
    ///
    /// The returned translation may cover fewer than `len` bytes when the
    /// range is not physically contiguous, or when its pages differ in
    /// permission or size; the caller issues the remainder as a new access.
    ///
    /// # Errors
    ///
    /// [`IommuError::TranslationFailed`] or [`IommuError::AccessDenied`] when
    /// the access must be aborted (the fault has been reported to the guest),
    /// [`IommuError::Busy`] when the device lock is contended,
    /// [`IommuError::EmptyAccess`] for `len == 0`.
    pub fn memory_access(
        &self,
        device_id: u16,
        iova: u64,
        len: usize,
        perm: IoPerm,
    ) -> Result<Translation, IommuError> {
        self.shared.memory_access(device_id, iova, len, perm)
    }

    /// Remaps an MSI written by `device_id`.
    ///
    /// # Errors
    ///
    /// [`IommuError::InterruptRemapFailed`] or
    /// [`IommuError::InterruptRemapDenied`] when the interrupt must be dropped,
    /// [`IommuError::CannotCallSelf`] for the IOMMU's own requester id,
    /// [`IommuError::Busy`] when the device lock is contended.
    pub fn msi_remap(&self, device_id: u16, msi: MsiMessage) -> Result<MsiMessage, IommuError> {
        self.shared.msi_remap(device_id, msi)
    }

    /// Reads the 64-bit register at `offset`.
    ///
    /// # Errors
    ///
    /// [`IommuError::Busy`] when the device lock is contended.
    pub fn mmio_read(&self, offset: u64) -> Result<u64, IommuError> {
        Ok(self.shared.lock_device()?.read(offset))
    }

    /// Writes the 64-bit register at `offset`.
    ///
    /// # Errors
    ///
    /// [`IommuError::Busy`] when the device lock is contended.
    pub fn mmio_write(&self, offset: u64, value: u64) -> Result<(), IommuError> {
        let wake = self.shared.lock_device()?.write(offset, value);
        if wake {
            self.shared.wake.notify();
        }
        Ok(())
    }

    /// Returns every register and cache to its power-on state.
    pub fn reset(&self) {
        log::debug!("amd-vi: reset");
        self.shared.device.lock().reset();
        self.shared.caches.lock().clear();
    }

    /// Processes pending commands on the calling thread.
    ///
    /// Serialized with the worker; useful when the worker is disabled.
    pub fn drain_commands(&self) {
        self.shared.drain_commands();
    }

    /// Entry counts of the three caches.
    #[must_use]
    pub fn cache_occupancy(&self) -> CacheOccupancy {
        self.shared.caches.lock().occupancy()
    }

    /// The engine's configuration.
    #[must_use]
    pub fn config(&self) -> &IommuConfig {
        &self.shared.config
    }

    /// The platform the engine was created with.
    #[must_use]
    pub fn platform(&self) -> &P {
        &self.shared.platform
    }
}

impl<P: Platform> Drop for Iommu<P> {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify();
        if worker.join().is_err() {
            log::error!("amd-vi: command worker panicked");
        }
    }
}

impl<P: Platform> core::fmt::Debug for Iommu<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Iommu")
            .field("config", &self.shared.config)
            .field("worker", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}
