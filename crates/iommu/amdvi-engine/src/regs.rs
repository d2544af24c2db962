//! MMIO register file.
//!
//! [`DeviceState`] holds every architectural register plus the ring pointers.
//! It lives behind the device lock; nothing in here touches guest memory or
//! the caches. Register writes report whether the command worker has new work.

use amdvi_format::regs::{
    self, CMD_BUF_BAR, CMD_BUF_HEAD, CMD_BUF_TAIL, CONTROL, Control, DEV_TAB_BAR,
    DEV_TAB_SEG_FIRST, DEV_TAB_SEG_LAST, DevTabBar, EVT_LOG_BAR, EVT_LOG_HEAD, EVT_LOG_TAIL,
    EXT_FEATURE, EXT_FEATURE_VALUE, HW_EVT_HI, HW_EVT_LO, HW_EVT_STATUS, HwEvtStatus,
    MAX_DEV_TAB_SEGMENTS, RING_PTR_MASK, RingBar, STATUS, STATUS_RW1C_MASK, Status,
};
use amdvi_format::DeviceTableEntry;

/// Device id shift per DevTblSegEn encoding.
const SEG_SHIFTS: [u32; 4] = [0, 15, 14, 13];
/// Device id bits selecting the segment per DevTblSegEn encoding.
const SEG_MASKS: [u16; 4] = [0, 0x8000, 0xc000, 0xe000];

/// A consistent copy of the device table registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevTabLayout {
    bars: [DevTabBar; MAX_DEV_TAB_SEGMENTS],
    seg_code: u8,
}

impl DevTabLayout {
    /// Guest physical address of `device_id`'s entry, or `None` when the id
    /// falls beyond its segment.
    #[must_use]
    pub fn entry_addr(&self, device_id: u16) -> Option<u64> {
        let code = usize::from(self.seg_code);
        let mask = SEG_MASKS[code];
        let segment = usize::from((device_id & mask) >> SEG_SHIFTS[code]);
        let bar = self.bars[segment];
        let offset = u64::from(device_id & !mask) * DeviceTableEntry::SIZE as u64;
        if offset + DeviceTableEntry::SIZE as u64 > bar.size_bytes() {
            return None;
        }
        Some(bar.base() + offset)
    }
}

/// IOMMU register state.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    /// Device table BAR (index 0) and segment BARs 1-7.
    pub(crate) dev_tab: [DevTabBar; MAX_DEV_TAB_SEGMENTS],
    pub(crate) cmd_buf: RingBar,
    pub(crate) evt_log: RingBar,
    pub(crate) control: Control,
    pub(crate) status: Status,
    pub(crate) cmd_head: u64,
    pub(crate) cmd_tail: u64,
    pub(crate) evt_head: u64,
    pub(crate) evt_tail: u64,
    pub(crate) hw_evt_hi: u64,
    pub(crate) hw_evt_lo: u64,
    pub(crate) hw_evt_status: HwEvtStatus,
}

impl DeviceState {
    /// Power-on register state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether translation and remapping are enabled (IommuEn).
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.control.contains(Control::IOMMU_EN)
    }

    /// Snapshot of the device table registers.
    #[must_use]
    pub fn dev_tab_layout(&self) -> DevTabLayout {
        DevTabLayout {
            bars: self.dev_tab,
            seg_code: self.control.dev_tab_seg_code(),
        }
    }

    /// Whether the command buffer runs and holds unprocessed commands.
    #[must_use]
    pub fn has_pending_commands(&self) -> bool {
        self.status.contains(Status::CMD_BUF_RUN) && self.cmd_head != self.cmd_tail
    }

    /// Reads the register at `offset`. Unknown offsets read as zero.
    #[must_use]
    pub fn read(&self, offset: u64) -> u64 {
        match offset {
            DEV_TAB_BAR => self.dev_tab[0].0,
            CMD_BUF_BAR => self.cmd_buf.0,
            EVT_LOG_BAR => self.evt_log.0,
            CONTROL => self.control.bits(),
            EXT_FEATURE => EXT_FEATURE_VALUE,
            HW_EVT_HI => self.hw_evt_hi,
            HW_EVT_LO => self.hw_evt_lo,
            HW_EVT_STATUS => self.hw_evt_status.bits(),
            DEV_TAB_SEG_FIRST..=DEV_TAB_SEG_LAST if offset % 8 == 0 => {
                self.dev_tab[segment_index(offset)].0
            }
            CMD_BUF_HEAD => self.cmd_head,
            CMD_BUF_TAIL => self.cmd_tail,
            EVT_LOG_HEAD => self.evt_head,
            EVT_LOG_TAIL => self.evt_tail,
            STATUS => self.status.bits(),
            _ => {
                log::debug!("amd-vi: read of unknown register {offset:#x}");
                0
            }
        }
    }

    /// Writes `value` to the register at `offset`.
    ///
    /// Returns `true` when the command worker should be woken.
    pub fn write(&mut self, offset: u64, value: u64) -> bool {
        match offset {
            DEV_TAB_BAR => self.dev_tab[0] = DevTabBar(value & DevTabBar::WRITABLE_MASK),
            CMD_BUF_BAR => {
                if self.status.contains(Status::CMD_BUF_RUN) {
                    log::debug!("amd-vi: command buffer BAR write ignored while running");
                } else if let Some(bar) = ring_bar(value) {
                    self.cmd_buf = bar;
                    self.cmd_head = 0;
                    self.cmd_tail = 0;
                }
            }
            EVT_LOG_BAR => {
                if self.status.contains(Status::EVT_LOG_RUN) {
                    log::debug!("amd-vi: event log BAR write ignored while running");
                } else if let Some(bar) = ring_bar(value) {
                    self.evt_log = bar;
                    self.evt_head = 0;
                    self.evt_tail = 0;
                }
            }
            CONTROL => return self.write_control(Control::from_bits_retain(value)),
            HW_EVT_HI => self.hw_evt_hi = value,
            HW_EVT_LO => self.hw_evt_lo = value,
            HW_EVT_STATUS => {
                self.hw_evt_status &= !HwEvtStatus::from_bits_truncate(value);
            }
            DEV_TAB_SEG_FIRST..=DEV_TAB_SEG_LAST if offset % 8 == 0 => {
                self.dev_tab[segment_index(offset)] = DevTabBar(value & DevTabBar::WRITABLE_MASK);
            }
            CMD_BUF_HEAD => {
                if self.status.contains(Status::CMD_BUF_RUN) {
                    log::debug!("amd-vi: command head write ignored while running");
                } else if let Some(ptr) = ring_ptr(value, self.cmd_buf) {
                    self.cmd_head = ptr;
                }
                return self.has_pending_commands();
            }
            CMD_BUF_TAIL => {
                if let Some(ptr) = ring_ptr(value, self.cmd_buf) {
                    self.cmd_tail = ptr;
                }
                return self.has_pending_commands();
            }
            EVT_LOG_HEAD => {
                if let Some(ptr) = ring_ptr(value, self.evt_log) {
                    self.evt_head = ptr;
                }
            }
            EVT_LOG_TAIL => {
                if self.status.contains(Status::EVT_LOG_RUN) {
                    log::debug!("amd-vi: event tail write ignored while running");
                } else if let Some(ptr) = ring_ptr(value, self.evt_log) {
                    self.evt_tail = ptr;
                }
            }
            STATUS => {
                self.status &= !Status::from_bits_truncate(value & STATUS_RW1C_MASK);
            }
            _ => log::debug!("amd-vi: write of {value:#x} to read-only or unknown register {offset:#x}"),
        }
        false
    }

    fn write_control(&mut self, new: Control) -> bool {
        let changed = self.control ^ new;
        self.control = new;

        if changed.intersects(Control::EVT_LOG_EN | Control::IOMMU_EN) {
            if new.contains(Control::EVT_LOG_EN | Control::IOMMU_EN) {
                self.status.remove(Status::EVT_OVERFLOW);
                self.status.insert(Status::EVT_LOG_RUN);
            } else {
                self.status.remove(Status::EVT_LOG_RUN);
            }
        }

        if changed.intersects(Control::CMD_BUF_EN | Control::IOMMU_EN) {
            if new.contains(Control::CMD_BUF_EN | Control::IOMMU_EN) {
                self.status.insert(Status::CMD_BUF_RUN);
                return true;
            }
            self.status.remove(Status::CMD_BUF_RUN);
        }
        false
    }

    /// Returns every register to its power-on value.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn segment_index(offset: u64) -> usize {
    ((offset - DEV_TAB_SEG_FIRST) / 8) as usize + 1
}

fn ring_bar(value: u64) -> Option<RingBar> {
    let bar = RingBar(value & RingBar::WRITABLE_MASK);
    if bar.is_valid_len() {
        Some(bar)
    } else {
        log::debug!(
            "amd-vi: ring BAR write ignored, length 2^{} below 2^{}",
            bar.len_log2(),
            regs::MIN_RING_LEN
        );
        None
    }
}

fn ring_ptr(value: u64, bar: RingBar) -> Option<u64> {
    let ptr = value & RING_PTR_MASK;
    if ptr < bar.size_bytes() {
        Some(ptr)
    } else {
        log::debug!("amd-vi: ring pointer {ptr:#x} beyond ring of {:#x} bytes", bar.size_bytes());
        None
    }
}
