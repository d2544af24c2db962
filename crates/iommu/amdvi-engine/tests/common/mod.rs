//! Shared fixture for the engine integration tests.
//!
//! [`Harness`] owns an engine over [`TestPlatform`] with the device table,
//! command buffer and event log placed in sparse guest memory, and offers the
//! register-level steps a guest driver would take.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use amdvi_engine::{GuestMemory, Iommu, IommuConfig, MemoryError, Platform, SparseMemory};
use amdvi_format::command::COMMAND_SIZE;
use amdvi_format::event::EVENT_SIZE;
use amdvi_format::regs::{
    CMD_BUF_BAR, CMD_BUF_HEAD, CMD_BUF_TAIL, CONTROL, Control, DEV_TAB_BAR, DevTabBar, EVT_LOG_BAR,
    EVT_LOG_HEAD, EVT_LOG_TAIL, RingBar, STATUS, Status,
};
use amdvi_format::{Command, DeviceTableEntry, EventCode, IoPageTableEntry};

/// Device table: one 4 KiB segment, device ids 0x00-0x7f.
pub const DEV_TAB: u64 = 0x10_0000;
/// Command buffer: 256 entries.
pub const CMD_BUF: u64 = 0x20_0000;
/// Event log: 256 entries.
pub const EVT_LOG: u64 = 0x30_0000;

/// Guest memory plus counters for the IOMMU's interrupt and target aborts.
#[derive(Debug, Default)]
pub struct TestPlatform {
    pub mem: SparseMemory,
    pub interrupts: AtomicUsize,
    pub aborts: AtomicUsize,
}

impl GuestMemory for TestPlatform {
    fn read_phys(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.mem.read_phys(addr, buf)
    }

    fn write_phys(&self, addr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        self.mem.write_phys(addr, buf)
    }
}

impl Platform for TestPlatform {
    fn raise_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }

    fn target_abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

/// A decoded event log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedEvent {
    pub code: Option<EventCode>,
    pub words: [u64; 2],
}

impl LoggedEvent {
    /// Flags field (bits 59:48 of the first qword).
    pub fn flags(&self) -> u16 {
        ((self.words[0] >> 48) & 0xfff) as u16
    }

    pub fn device_id(&self) -> u16 {
        self.words[0] as u16
    }
}

pub struct Harness {
    pub iommu: Iommu<TestPlatform>,
}

impl Harness {
    /// An engine without the command worker; commands drain on demand.
    pub fn new() -> Self {
        Self::with_config(IommuConfig {
            command_worker: false,
            ..IommuConfig::default()
        })
    }

    pub fn with_config(config: IommuConfig) -> Self {
        let iommu = Iommu::new(config, TestPlatform::default()).expect("engine should start");
        let harness = Self { iommu };
        harness.mem().map(DEV_TAB, 0x1000);
        harness.mem().map(CMD_BUF, 0x1000);
        harness.mem().map(EVT_LOG, 0x1000);
        harness.write_reg(DEV_TAB_BAR, DevTabBar::new(DEV_TAB, 1).0);
        harness.write_reg(CMD_BUF_BAR, RingBar::new(CMD_BUF, 8).0);
        harness.write_reg(EVT_LOG_BAR, RingBar::new(EVT_LOG, 8).0);
        harness
    }

    /// A harness with the IOMMU, event log and command buffer enabled.
    pub fn enabled() -> Self {
        let harness = Self::new();
        harness.enable(Control::empty());
        harness
    }

    pub fn enable(&self, extra: Control) {
        let control = Control::IOMMU_EN | Control::EVT_LOG_EN | Control::CMD_BUF_EN | extra;
        self.write_reg(CONTROL, control.bits());
    }

    pub fn platform(&self) -> &TestPlatform {
        self.iommu.platform()
    }

    pub fn mem(&self) -> &SparseMemory {
        &self.iommu.platform().mem
    }

    pub fn aborts(&self) -> usize {
        self.platform().aborts.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.platform().interrupts.load(Ordering::SeqCst)
    }

    pub fn read_reg(&self, offset: u64) -> u64 {
        self.iommu.mmio_read(offset).expect("register read")
    }

    pub fn write_reg(&self, offset: u64, value: u64) {
        self.iommu.mmio_write(offset, value).expect("register write");
    }

    pub fn status(&self) -> Status {
        Status::from_bits_truncate(self.read_reg(STATUS))
    }

    // -----------------------------------------------------------------------
    // Guest tables
    // -----------------------------------------------------------------------

    pub fn write_dte(&self, device_id: u16, dte: DeviceTableEntry) {
        let addr = DEV_TAB + u64::from(device_id) * DeviceTableEntry::SIZE as u64;
        self.mem().write_phys(addr, &dte.to_bytes()).expect("DTE write");
    }

    pub fn write_pte(&self, table: u64, index: u64, pte: IoPageTableEntry) {
        self.mem().map(table, 0x1000);
        self.mem()
            .write_phys(table + index * 8, &pte.0.to_le_bytes())
            .expect("PTE write");
    }

    pub fn write_u32(&self, addr: u64, value: u32) {
        self.mem().map(addr, 4);
        self.mem().write_phys(addr, &value.to_le_bytes()).expect("guest write");
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let mut raw = [0u8; 8];
        self.mem().read_phys(addr, &mut raw).expect("guest read");
        u64::from_le_bytes(raw)
    }

    // -----------------------------------------------------------------------
    // Command buffer
    // -----------------------------------------------------------------------

    /// Copies `commands` to the ring at the current tail and publishes them.
    pub fn queue(&self, commands: &[Command]) {
        let mut tail = self.read_reg(CMD_BUF_TAIL);
        for cmd in commands {
            self.mem()
                .write_phys(CMD_BUF + tail, &cmd.to_bytes())
                .expect("command write");
            tail = (tail + COMMAND_SIZE as u64) % 0x1000;
        }
        self.write_reg(CMD_BUF_TAIL, tail);
    }

    /// Queues raw command qwords.
    pub fn queue_raw(&self, words: [u64; 2]) {
        let tail = self.read_reg(CMD_BUF_TAIL);
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&words[0].to_le_bytes());
        raw[8..].copy_from_slice(&words[1].to_le_bytes());
        self.mem().write_phys(CMD_BUF + tail, &raw).expect("command write");
        self.write_reg(CMD_BUF_TAIL, (tail + 16) % 0x1000);
    }

    /// Queues `commands` and drains them on this thread.
    pub fn run(&self, commands: &[Command]) {
        self.queue(commands);
        self.iommu.drain_commands();
    }

    pub fn cmd_head(&self) -> u64 {
        self.read_reg(CMD_BUF_HEAD)
    }

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    /// Every event between head and tail, oldest first.
    pub fn events(&self) -> Vec<LoggedEvent> {
        let mut head = self.read_reg(EVT_LOG_HEAD);
        let tail = self.read_reg(EVT_LOG_TAIL);
        let mut out = Vec::new();
        while head != tail {
            let words = [self.read_u64(EVT_LOG + head), self.read_u64(EVT_LOG + head + 8)];
            out.push(LoggedEvent {
                code: EventCode::from_qword0(words[0]),
                words,
            });
            head = (head + EVENT_SIZE as u64) % 0x1000;
        }
        out
    }

    pub fn event_codes(&self) -> Vec<Option<EventCode>> {
        self.events().iter().map(|event| event.code).collect()
    }

    /// Marks every logged event consumed.
    pub fn consume_events(&self) {
        let tail = self.read_reg(EVT_LOG_TAIL);
        self.write_reg(EVT_LOG_HEAD, tail);
    }
}
