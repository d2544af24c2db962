//! Fault reporting shared by the translation and remapping front-ends.
//!
//! Locks are taken one at a time here: the cache lock to consult or update
//! the fault-raised state, the device lock to append to the event log. The
//! platform target abort is signalled with neither held.

use amdvi_format::{DeviceTableEntry, Event, HwErrorKind, InterruptRemapEntry, IoFaultFlags, IoPerm};

use crate::cache::DteFlags;
use crate::error::{Fault, IntrFault};
use crate::iommu::Shared;
use crate::platform::Platform;
use crate::regs::DevTabLayout;

/// The request a fault is reported against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Request {
    pub device_id: u16,
    /// IOVA of a memory access or address of an MSI.
    pub addr: u64,
    pub write: bool,
    pub interrupt: bool,
}

impl Request {
    pub fn memory(device_id: u16, iova: u64, perm: IoPerm) -> Self {
        Self {
            device_id,
            addr: iova,
            write: perm.contains(IoPerm::WRITE),
            interrupt: false,
        }
    }

    pub fn interrupt(device_id: u16, msi_addr: u64) -> Self {
        Self {
            device_id,
            addr: msi_addr,
            write: false,
            interrupt: true,
        }
    }

    /// The same request, faulting at `addr`.
    pub fn at(self, addr: u64) -> Self {
        Self { addr, ..self }
    }

    fn fault_flags(self) -> IoFaultFlags {
        let mut flags = IoFaultFlags::empty();
        flags.set(IoFaultFlags::WRITE, self.write);
        flags.set(IoFaultFlags::INTERRUPT, self.interrupt);
        flags
    }
}

/// Why a device table entry could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DteReadFault {
    DevIdInvalid,
    HwError,
}

impl DteReadFault {
    pub fn fault(self) -> Fault {
        match self {
            Self::DevIdInvalid => Fault::DevIdInvalid,
            Self::HwError => Fault::DevTabHwError,
        }
    }

    pub fn intr_fault(self) -> IntrFault {
        match self {
            Self::DevIdInvalid => IntrFault::DevIdInvalid,
            Self::HwError => IntrFault::DevTabHwError,
        }
    }
}

impl<P: Platform> Shared<P> {
    /// Reads the device table entry `req` was issued by.
    pub(crate) fn read_dte(
        &self,
        layout: &DevTabLayout,
        req: Request,
    ) -> Result<DeviceTableEntry, DteReadFault> {
        let Some(addr) = layout.entry_addr(req.device_id) else {
            log::debug!("amd-vi: device id {:#06x} beyond device table", req.device_id);
            self.io_page_fault(req, None, IoFaultFlags::empty(), None);
            return Err(DteReadFault::DevIdInvalid);
        };

        let mut raw = [0u8; DeviceTableEntry::SIZE];
        let read = self.platform.read_phys(addr, &mut raw);
        match read.ok().and_then(|()| DeviceTableEntry::from_bytes(&raw)) {
            Some(dte) => Ok(dte),
            None => {
                log::warn!("amd-vi: failed to read DTE of {:#06x} at {addr:#x}", req.device_id);
                self.log_hw_error(&Event::DevTabHwError {
                    device_id: req.device_id,
                    addr,
                    interrupt: req.interrupt,
                    write: req.write,
                    kind: HwErrorKind::TargetAbort,
                });
                self.platform.target_abort();
                Err(DteReadFault::HwError)
            }
        }
    }

    /// Caches `dte` for `device_id`, carrying over the `keep` bits of any
    /// previously cached flags.
    pub(crate) fn cache_dte(
        &self,
        device_id: u16,
        dte: &DeviceTableEntry,
        keep: DteFlags,
        or: DteFlags,
        and: DteFlags,
    ) {
        let mut caches = self.caches.lock();
        let kept = caches
            .dte
            .lookup(device_id)
            .map_or(DteFlags::empty(), |entry| entry.flags & keep);
        caches.dte.insert_or_update(device_id, dte, or | kept, and);
    }

    /// Appends `event` to the event log.
    pub(crate) fn log_event(&self, event: &Event) {
        self.device.lock().write_event(&self.platform, event);
    }

    /// Latches `event` in the hardware error registers and logs it.
    pub(crate) fn log_hw_error(&self, event: &Event) {
        let mut state = self.device.lock();
        state.set_hw_error(event);
        state.write_event(&self.platform, event);
    }

    /// Reports a malformed device table entry and aborts the request.
    pub(crate) fn illegal_dte(&self, req: Request) {
        log::debug!("amd-vi: illegal DTE for {:#06x}", req.device_id);
        self.log_event(&Event::IllegalDevTabEntry {
            device_id: req.device_id,
            addr: req.addr,
            flags: req.fault_flags() | IoFaultFlags::RSVD_NOT_ZERO,
        });
        self.platform.target_abort();
    }

    /// Reports an I/O page fault, unless suppressed, and aborts the request.
    ///
    /// `dte` is the entry the request was checked against, `None` when the
    /// device id itself was invalid. `irte` is the remapping entry that
    /// produced an interrupt fault, if one was read.
    pub(crate) fn io_page_fault(
        &self,
        req: Request,
        dte: Option<&DeviceTableEntry>,
        flags: IoFaultFlags,
        irte: Option<InterruptRemapEntry>,
    ) {
        if self.io_page_fault_suppressed(req, dte, irte) {
            log::trace!("amd-vi: suppressed I/O page fault for {:#06x}", req.device_id);
        } else {
            log::debug!(
                "amd-vi: I/O page fault for {:#06x} at {:#x} ({flags:?})",
                req.device_id,
                req.addr
            );
            self.log_event(&Event::IoPageFault {
                device_id: req.device_id,
                domain_id: dte.map_or(0, DeviceTableEntry::domain_id),
                addr: req.addr,
                flags: req.fault_flags() | flags,
            });
            if let Some(dte) = dte {
                let raised = DteFlags::IO_PAGE_FAULT_RAISED;
                let mut caches = self.caches.lock();
                if !caches.dte.update_flags(req.device_id, raised, DteFlags::all()) {
                    caches
                        .dte
                        .insert_or_update(req.device_id, dte, raised, DteFlags::all());
                }
            }
        }
        self.platform.target_abort();
    }

    fn io_page_fault_suppressed(
        &self,
        req: Request,
        dte: Option<&DeviceTableEntry>,
        irte: Option<InterruptRemapEntry>,
    ) -> bool {
        let Some(dte) = dte else {
            return false;
        };
        if req.interrupt {
            return (dte.intr_map_valid() && dte.ignore_unmapped_intr())
                || irte.is_some_and(InterruptRemapEntry::suppress_io_page_faults);
        }
        if !dte.valid() {
            return false;
        }
        if dte.suppress_all_io_page_faults() {
            return true;
        }
        dte.suppress_io_page_faults() && self.fault_raised(req.device_id)
    }

    /// Whether an I/O page fault was already logged for `device_id`.
    pub(crate) fn fault_raised(&self, device_id: u16) -> bool {
        self.caches
            .lock()
            .dte
            .lookup(device_id)
            .is_some_and(|entry| entry.flags.contains(DteFlags::IO_PAGE_FAULT_RAISED))
    }
}
