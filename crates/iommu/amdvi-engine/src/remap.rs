//! Interrupt remapping front-end.
//!
//! Fixed and arbitrated MSIs are remapped through the device's interrupt
//! table according to the DTE's IntCtl. Other delivery modes are either
//! passed through unchanged or target aborted according to the DTE's pass
//! bits.

use amdvi_format::{
    DeliveryMode, DeviceTableEntry, Event, HwErrorKind, IntrCtl, InterruptRemapEntry,
    IoFaultFlags, MsiMessage,
};

use crate::cache::DteFlags;
use crate::error::{IntrFault, IommuError};
use crate::intr_table::{self, IntrTableFault};
use crate::iommu::Shared;
use crate::platform::Platform;
use crate::regs::DevTabLayout;
use crate::report::Request;

impl<P: Platform> Shared<P> {
    /// Remaps `msi` written by `device_id`.
    pub(crate) fn msi_remap(&self, device_id: u16, msi: MsiMessage) -> Result<MsiMessage, IommuError> {
        if device_id == self.config.device_id {
            return Err(IommuError::CannotCallSelf);
        }
        let layout = {
            let state = self.lock_device()?;
            if !state.is_enabled() {
                return Ok(msi);
            }
            state.dev_tab_layout()
        };

        if let Some(remapped) = self.remap_cached(device_id, &msi) {
            return Ok(remapped);
        }
        self.remap_uncached(&layout, device_id, msi)
    }

    fn remap_cached(&self, device_id: u16, msi: &MsiMessage) -> Option<MsiMessage> {
        if !msi.in_msi_region() || !msi.delivery_mode().is_remappable() {
            return None;
        }
        let caches = self.caches.lock();
        let flags = caches.dte.lookup(device_id)?.flags;
        if !flags.contains(DteFlags::PRESENT) {
            return None;
        }
        if !flags.contains(DteFlags::INTR_MAP_VALID) {
            return Some(*msi);
        }
        // Reserved interrupt bits are reported by the slow path.
        if !flags.contains(DteFlags::INTR_RSVD_CLEAR) {
            return None;
        }
        match flags.intr_ctl() {
            IntrCtl::Remap => caches
                .irte
                .lookup(device_id, InterruptRemapEntry::offset_for(msi.data))
                .map(|irte| msi.remapped(irte)),
            IntrCtl::ForwardUnmapped => Some(*msi),
            IntrCtl::TargetAbort | IntrCtl::Reserved => None,
        }
    }

    fn remap_uncached(
        &self,
        layout: &DevTabLayout,
        device_id: u16,
        msi: MsiMessage,
    ) -> Result<MsiMessage, IommuError> {
        let req = Request::interrupt(device_id, msi.addr);
        let dte = self
            .read_dte(layout, req)
            .map_err(|fault| IommuError::InterruptRemapFailed(fault.intr_fault()))?;

        if !dte.intr_map_valid() {
            self.cache_intr_dte(device_id, &dte);
            return Ok(msi);
        }
        if dte.has_intr_rsvd_bits() {
            self.illegal_dte(req);
            return Err(IommuError::InterruptRemapFailed(IntrFault::IllegalDte));
        }
        self.cache_intr_dte(device_id, &dte);

        if !msi.in_msi_region() {
            log::debug!("amd-vi: MSI address {:#x} outside the MSI region", msi.addr);
            self.platform.target_abort();
            return Err(IommuError::InterruptRemapFailed(IntrFault::OutsideMsiRegion));
        }

        match msi.delivery_mode() {
            DeliveryMode::Fixed | DeliveryMode::LowestPriority => self.remap_by_intr_ctl(req, &dte, msi),
            DeliveryMode::Reserved(mode) => {
                log::debug!("amd-vi: MSI from {device_id:#06x} uses reserved delivery mode {mode}");
                self.platform.target_abort();
                Err(IommuError::InterruptRemapFailed(IntrFault::InvalidDeliveryMode))
            }
            _ if msi.dest_mode_logical() => Err(self.deny(device_id)),
            DeliveryMode::Smi => Ok(msi),
            DeliveryMode::Nmi => self.pass_if(dte.nmi_pass(), device_id, msi),
            DeliveryMode::Init => self.pass_if(dte.init_pass(), device_id, msi),
            DeliveryMode::ExtInt => self.pass_if(dte.ext_int_pass(), device_id, msi),
        }
    }

    /// Caches the interrupt half of `dte`, preserving the translation state
    /// computed for the device.
    fn cache_intr_dte(&self, device_id: u16, dte: &DeviceTableEntry) {
        self.cache_dte(
            device_id,
            dte,
            DteFlags::COMPUTED_MASK,
            DteFlags::empty(),
            DteFlags::all(),
        );
    }

    fn pass_if(&self, pass: bool, device_id: u16, msi: MsiMessage) -> Result<MsiMessage, IommuError> {
        if pass { Ok(msi) } else { Err(self.deny(device_id)) }
    }

    fn deny(&self, device_id: u16) -> IommuError {
        log::debug!("amd-vi: interrupt from {device_id:#06x} target aborted");
        self.platform.target_abort();
        IommuError::InterruptRemapDenied
    }

    fn remap_by_intr_ctl(
        &self,
        req: Request,
        dte: &DeviceTableEntry,
        msi: MsiMessage,
    ) -> Result<MsiMessage, IommuError> {
        match dte.intr_ctl() {
            IntrCtl::Remap => self.remap_through_table(req, dte, msi),
            IntrCtl::ForwardUnmapped => Ok(msi),
            IntrCtl::TargetAbort => Err(self.deny(req.device_id)),
            IntrCtl::Reserved => {
                self.illegal_dte(req);
                Err(IommuError::InterruptRemapFailed(IntrFault::IllegalDte))
            }
        }
    }

    fn remap_through_table(
        &self,
        req: Request,
        dte: &DeviceTableEntry,
        msi: MsiMessage,
    ) -> Result<MsiMessage, IommuError> {
        let (fault, irte) = match intr_table::lookup(&self.platform, dte, &msi) {
            Ok(found) => {
                let cached = self
                    .caches
                    .lock()
                    .irte
                    .insert_or_update(req.device_id, found.offset, found.irte);
                if cached.is_err() {
                    log::debug!("amd-vi: IRTE cache full, {:#06x} not cached", req.device_id);
                }
                return Ok(found.msi);
            }
            Err(failed) => failed,
        };

        match fault {
            IntrTableFault::InvalidTableLength => self.illegal_dte(req),
            IntrTableFault::ReadFailed { addr } => {
                log::warn!("amd-vi: failed to read IRTE at {addr:#x}");
                self.log_hw_error(&Event::PageTabHwError {
                    device_id: req.device_id,
                    domain_id: dte.domain_id(),
                    addr,
                    interrupt: true,
                    write: false,
                    kind: HwErrorKind::TargetAbort,
                });
                self.platform.target_abort();
            }
            IntrTableFault::AddrInvalid
            | IntrTableFault::RemapDisabled
            | IntrTableFault::GuestModeUnsupported
            | IntrTableFault::ReservedIntType => {
                let mut flags = IoFaultFlags::empty();
                flags.set(IoFaultFlags::PRESENT, irte.is_some());
                flags.set(
                    IoFaultFlags::RSVD_NOT_ZERO,
                    matches!(
                        fault,
                        IntrTableFault::GuestModeUnsupported | IntrTableFault::ReservedIntType
                    ),
                );
                self.io_page_fault(req, Some(dte), flags, irte);
            }
        }
        Err(IommuError::InterruptRemapFailed(fault.intr_fault()))
    }
}
