//! Command buffer processor.
//!
//! A drain fetches the whole ring in one guest memory read under the device
//! lock and advances the head to the tail only once that read succeeded. The
//! fetched commands are then executed from the snapshot with no lock held
//! except the cache lock each invalidation takes.

use core::ops::ControlFlow;

use amdvi_format::command::COMMAND_SIZE;
use amdvi_format::pte::encoded_size_shift;
use amdvi_format::regs::{Control, Status};
use amdvi_format::{Command, Event, HwErrorKind, PAGE_OFFSET_MASK, PAGE_SIZE};

use crate::iommu::Shared;
use crate::platform::Platform;

/// Commands fetched from the ring.
struct CommandBatch {
    base: u64,
    head: u64,
    tail: u64,
    ring: Vec<u8>,
}

impl<P: Platform> Shared<P> {
    /// Executes every command between head and tail.
    pub(crate) fn drain_commands(&self) {
        let _drain = self.drain_lock.lock();
        let Some(batch) = self.fetch_commands() else {
            return;
        };

        let size = batch.ring.len() as u64;
        let mut off = batch.head;
        while off != batch.tail {
            let addr = batch.base + off;
            let start = off as usize;
            let flow = match Command::from_bytes(&batch.ring[start..start + COMMAND_SIZE]) {
                Ok(cmd) => self.execute(cmd, addr),
                Err(err) => {
                    log::warn!("amd-vi: illegal command at {addr:#x}: {err}");
                    self.halt_commands(&Event::IllegalCommand { addr });
                    ControlFlow::Break(())
                }
            };
            if flow.is_break() {
                break;
            }
            off = (off + COMMAND_SIZE as u64) % size;
        }
    }

    fn fetch_commands(&self) -> Option<CommandBatch> {
        let mut state = self.device.lock();
        if !state.has_pending_commands() {
            return None;
        }
        let bar = state.cmd_buf;
        let mut ring = vec![0u8; bar.size_bytes() as usize];
        if let Err(err) = self.platform.read_phys(bar.base(), &mut ring) {
            log::warn!("amd-vi: command buffer fetch failed: {err}");
            let event = Event::CommandHwError {
                addr: bar.base() + state.cmd_head,
                kind: HwErrorKind::TargetAbort,
            };
            state.set_hw_error(&event);
            state.write_event(&self.platform, &event);
            state.status.remove(Status::CMD_BUF_RUN);
            return None;
        }

        let batch = CommandBatch {
            base: bar.base(),
            head: state.cmd_head,
            tail: state.cmd_tail,
            ring,
        };
        state.cmd_head = state.cmd_tail;
        Some(batch)
    }

    /// Logs `event` and stops the command buffer.
    fn halt_commands(&self, event: &Event) {
        let mut state = self.device.lock();
        if matches!(event, Event::CommandHwError { .. }) {
            state.set_hw_error(event);
        }
        state.write_event(&self.platform, event);
        state.status.remove(Status::CMD_BUF_RUN);
    }

    fn execute(&self, cmd: Command, addr: u64) -> ControlFlow<()> {
        log::trace!("amd-vi: command {cmd:?}");
        match cmd {
            Command::CompletionWait {
                store,
                interrupt,
                store_addr,
                store_data,
                ..
            } => return self.completion_wait(addr, store.then_some((store_addr, store_data)), interrupt),
            Command::InvalidateDevTabEntry { device_id } => self.caches.lock().dte.remove(device_id),
            Command::InvalidateIommuPages {
                domain_id,
                addr: page,
                size,
                ..
            } => self.invalidate_pages(domain_id, page, size),
            Command::InvalidateIntrTable { device_id } => {
                self.caches.lock().irte.remove_device(device_id);
            }
            Command::InvalidateIommuAll => self.caches.lock().clear(),
            Command::InvalidateIotlbPages { .. }
            | Command::PrefetchIommuPages { .. }
            | Command::CompletePprRequest { .. } => {
                log::warn!(
                    "amd-vi: unsupported command opcode {:#x} at {addr:#x}",
                    cmd.opcode()
                );
                self.halt_commands(&Event::IllegalCommand { addr });
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn completion_wait(&self, addr: u64, store: Option<(u64, u64)>, interrupt: bool) -> ControlFlow<()> {
        if let Some((store_addr, data)) = store {
            if let Err(err) = self.platform.write_phys(store_addr, &data.to_le_bytes()) {
                log::warn!("amd-vi: completion wait store failed: {err}");
                self.halt_commands(&Event::CommandHwError {
                    addr,
                    kind: HwErrorKind::TargetAbort,
                });
                return ControlFlow::Break(());
            }
        }
        if interrupt {
            let raise = {
                let mut state = self.device.lock();
                state.status.insert(Status::COMP_WAIT_INTR);
                state.control.contains(Control::COMP_WAIT_INTR_EN)
            };
            if raise {
                self.platform.raise_interrupt();
            }
        }
        ControlFlow::Continue(())
    }

    /// Applies INVALIDATE_IOMMU_PAGES to the IOTLB.
    ///
    /// With `size` set the range size is encoded in the address; a size of
    /// 2^64 or more covers the whole domain.
    fn invalidate_pages(&self, domain_id: u16, addr: u64, size: bool) {
        let mut caches = self.caches.lock();
        if !size {
            caches
                .iotlb
                .remove_range(domain_id, addr & !PAGE_OFFSET_MASK, PAGE_SIZE);
            return;
        }
        let shift = encoded_size_shift(addr);
        if shift >= 64 {
            caches.iotlb.remove_domain(domain_id);
        } else {
            let len = 1u64 << shift;
            caches.iotlb.remove_range(domain_id, addr & !(len - 1), len);
        }
    }
}
