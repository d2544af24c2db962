//! Event log writer and hardware error latch.
//!
//! Both operate on [`DeviceState`] and must be called with the device lock
//! held, which serializes event log writes from every context.

use amdvi_format::event::EVENT_SIZE;
use amdvi_format::regs::{Control, HwEvtStatus, Status};
use amdvi_format::Event;

use crate::platform::Platform;
use crate::regs::DeviceState;

impl DeviceState {
    /// Appends `event` to the guest's event log.
    ///
    /// The event is dropped when the log is not running or has overflowed.
    /// A full log sets EventOverflow instead; a failed write latches the
    /// hardware error registers with the event.
    pub fn write_event<P: Platform>(&mut self, platform: &P, event: &Event) {
        if !self.status.contains(Status::EVT_LOG_RUN) || self.status.contains(Status::EVT_OVERFLOW) {
            log::trace!("amd-vi: event log not accepting, dropped {:?}", event.code());
            return;
        }

        let total = self.evt_log.size_bytes();
        let used = ((self.evt_tail + total - self.evt_head) % total) / EVENT_SIZE as u64;
        if used + 1 >= self.evt_log.entries() {
            log::debug!("amd-vi: event log overflow");
            self.status.insert(Status::EVT_OVERFLOW);
            self.signal_event_interrupt(platform);
            return;
        }

        let addr = self.evt_log.base() + self.evt_tail;
        if let Err(err) = platform.write_phys(addr, &event.to_bytes()) {
            log::warn!("amd-vi: event log write failed: {err}");
            self.set_hw_error(event);
            return;
        }
        self.evt_tail = (self.evt_tail + EVENT_SIZE as u64) % total;
        self.status.insert(Status::EVT_LOG_INTR);
        self.signal_event_interrupt(platform);
    }

    fn signal_event_interrupt<P: Platform>(&self, platform: &P) {
        if self.control.contains(Control::EVT_INTR_EN) {
            platform.raise_interrupt();
        }
    }

    /// Latches `event` in the hardware event registers.
    ///
    /// A second latch before software clears HEV sets HEO.
    pub fn set_hw_error(&mut self, event: &Event) {
        if self.hw_evt_status.contains(HwEvtStatus::VALID) {
            self.hw_evt_status.insert(HwEvtStatus::OVERFLOW);
        }
        self.hw_evt_status.insert(HwEvtStatus::VALID);
        let [q0, q1] = event.to_qwords();
        self.hw_evt_hi = q0;
        self.hw_evt_lo = q1;
    }
}
