//! # CVP Register Map
//!
//! Byte offsets into the CVP register window and the bit layouts the
//! driver depends on.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

// =============================================================================
// REGISTER BLOCKS
// =============================================================================

/// Firmware CPU block
pub const CPU_BASE: u32 = 0x000A_0000;
/// Firmware CPU control/status sub-block
pub const CPU_CS_BASE: u32 = CPU_BASE + 0x0001_2000;
/// Wrapper block (interrupts, CPU status, clock config)
pub const WRAPPER_BASE: u32 = 0x000B_0000;
/// Always-on wrapper block
pub const AON_BASE: u32 = 0x000E_0000;
/// Clock controller block
pub const CC_BASE: u32 = 0x000F_8000;
/// Core NOC block
pub const NOC_BASE: u32 = 0x0000_0000;

// =============================================================================
// FIRMWARE CPU REGISTERS
// =============================================================================

/// Host to firmware doorbell
pub const CPU_CS_H2ASOFTINT: u32 = CPU_CS_BASE + 0x18;
/// Firmware to host interrupt clear
pub const CPU_CS_A2HSOFTINTCLR: u32 = CPU_CS_BASE + 0x1C;
/// Control init (SCIACMD)
pub const CTRL_INIT: u32 = CPU_CS_BASE + 0x48;
/// Control status (SCIACMDARG0)
pub const CTRL_STATUS: u32 = CPU_CS_BASE + 0x4C;
/// Queue table info (SCIACMDARG1)
pub const QTBL_INFO: u32 = CPU_CS_BASE + 0x50;
/// Queue table address (SCIACMDARG2)
pub const QTBL_ADDR: u32 = CPU_CS_BASE + 0x54;
/// Firmware version (SCIACMDARG3)
pub const VERSION_INFO: u32 = CPU_CS_BASE + 0x58;
/// Crash report address (SCIBCMD)
pub const SFR_ADDR: u32 = CPU_CS_BASE + 0x5C;
/// Trace memory map table address (SCIBCMDARG0)
pub const MMAP_ADDR: u32 = CPU_CS_BASE + 0x60;
/// Uncached region base (SCIBARG1)
pub const UC_REGION_ADDR: u32 = CPU_CS_BASE + 0x64;
/// Uncached region size (SCIBARG2)
pub const UC_REGION_SIZE: u32 = CPU_CS_BASE + 0x68;
/// DSP queue table address
pub const DSP_QTBL_ADDR: u32 = CPU_CS_BASE + 0x80;
/// DSP uncached region base
pub const DSP_UC_REGION_ADDR: u32 = CPU_CS_BASE + 0x84;
/// DSP uncached region size
pub const DSP_UC_REGION_SIZE: u32 = CPU_CS_BASE + 0x88;
/// AXI QoS
pub const CPU_CS_AXI4_QOS: u32 = CPU_CS_BASE + 0x13C;
/// Host to firmware soft interrupt enable
pub const CPU_CS_H2XSOFTINTEN: u32 = CPU_CS_BASE + 0x148;
/// Firmware to RPMh handshake
pub const CPU_CS_X2RPMH: u32 = CPU_CS_BASE + 0x168;

// =============================================================================
// WRAPPER REGISTERS
// =============================================================================

/// Hardware version
pub const WRAPPER_HW_VERSION: u32 = WRAPPER_BASE;
/// Latched interrupt status
pub const WRAPPER_INTR_STATUS: u32 = WRAPPER_BASE + 0x0C;
/// Interrupt mask (1 = masked)
pub const WRAPPER_INTR_MASK: u32 = WRAPPER_BASE + 0x10;
/// Debug bridge low power request
pub const WRAPPER_DEBUG_BRIDGE_LPI_CONTROL: u32 = WRAPPER_BASE + 0x54;
/// Debug bridge low power status
pub const WRAPPER_DEBUG_BRIDGE_LPI_STATUS: u32 = WRAPPER_BASE + 0x58;
/// Core clock branch config (0 = enabled)
pub const WRAPPER_CORE_CLOCK_CONFIG: u32 = WRAPPER_BASE + 0x88;
/// AXI clock config
pub const WRAPPER_AXI_CLOCK_CONFIG: u32 = WRAPPER_BASE + 0x8C;
/// QNS4 PDX FIFO reset
pub const WRAPPER_QNS4PDXFIFO_RESET: u32 = WRAPPER_BASE + 0x90;
/// Firmware CPU clock config
pub const WRAPPER_CPU_CLOCK_CONFIG: u32 = WRAPPER_BASE + 0x2000;
/// Firmware CPU status
pub const WRAPPER_CPU_STATUS: u32 = WRAPPER_BASE + 0x2014;
/// Firmware CPU NOC low power request
pub const WRAPPER_CPU_NOC_LPI_CONTROL: u32 = WRAPPER_BASE + 0x2030;
/// Firmware CPU NOC low power status
pub const WRAPPER_CPU_NOC_LPI_STATUS: u32 = WRAPPER_BASE + 0x2034;

/// Core NOC low power request
pub const AON_WRAPPER_NOC_LPI_CONTROL: u32 = AON_BASE;
/// Core NOC low power status
pub const AON_WRAPPER_NOC_LPI_STATUS: u32 = AON_BASE + 0x04;

/// MVS1 core GDSC control
pub const CC_MVS1_GDSCR: u32 = CC_BASE + 0x04;
/// MVS1C branch clock control
pub const CC_MVS1C_CBCR: u32 = CC_BASE + 0x0C;
/// AHB bridge synchronous reset
pub const AHB_BRIDGE_SYNC_RESET: u32 = CC_BASE + 0x20;

// =============================================================================
// NOC REGISTERS
// =============================================================================

/// Subsystem idle status
pub const SS_IDLE_STATUS: u32 = NOC_BASE + 0x0_0404;
/// NOC partial reset request
pub const NOC_RESET_REQ: u32 = NOC_BASE + 0x0_0410;
/// NOC partial reset acknowledge
pub const NOC_RESET_ACK: u32 = NOC_BASE + 0x0_0414;
/// Sideband manager sense lane 0
pub const NOC_SBM_SENSELN0_LOW: u32 = NOC_BASE + 0x0_4100;
/// Priority LUT low
pub const NOC_PRIORITYLUT_LOW: u32 = NOC_BASE + 0x0_3030;
/// Priority LUT high
pub const NOC_PRIORITYLUT_HIGH: u32 = NOC_BASE + 0x0_3034;
/// Urgency low
pub const NOC_URGENCY_LOW: u32 = NOC_BASE + 0x0_3038;
/// Danger LUT low
pub const NOC_DANGERLUT_LOW: u32 = NOC_BASE + 0x0_3040;
/// Safe LUT low
pub const NOC_SAFELUT_LOW: u32 = NOC_BASE + 0x0_3048;

/// Controller NOC error logger base
pub const NOC_ERR_LOGGER_BASE: u32 = NOC_BASE + 0x0_1000;
/// Core NOC error logger base
pub const NOC_CORE_ERR_LOGGER_BASE: u32 = NOC_BASE + 0x0_2000;

/// Error logger registers, relative to a logger base
pub const NOC_ERR_LOGGER_REGS: [(&str, u32); 13] = [
    ("SWID_LOW", 0x00),
    ("SWID_HIGH", 0x04),
    ("MAINCTL_LOW", 0x08),
    ("ERRVLD_LOW", 0x10),
    ("ERRCLR_LOW", 0x18),
    ("ERRLOG0_LOW", 0x20),
    ("ERRLOG0_HIGH", 0x24),
    ("ERRLOG1_LOW", 0x28),
    ("ERRLOG1_HIGH", 0x2C),
    ("ERRLOG2_LOW", 0x30),
    ("ERRLOG2_HIGH", 0x34),
    ("ERRLOG3_LOW", 0x38),
    ("ERRLOG3_HIGH", 0x3C),
];

const_assert_eq!(CTRL_STATUS - CTRL_INIT, 4);
const_assert_eq!(CPU_CS_A2HSOFTINTCLR % 4, 0);

// =============================================================================
// BIT LAYOUTS
// =============================================================================

bitflags! {
    /// Wrapper interrupt status / mask bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntrStatus: u32 {
        /// Firmware rang the host doorbell
        const A2HCPU = 1 << 2;
        /// Firmware watchdog expired
        const A2HWD = 1 << 3;
        /// Core NOC error
        const CORE_NOC_ERR = 1 << 5;
        /// CPU NOC error
        const CPU_NOC_ERR = 1 << 6;
        /// Any bit that means the firmware is gone
        const FATAL = Self::A2HWD.bits() | Self::CORE_NOC_ERR.bits() | Self::CPU_NOC_ERR.bits();
    }
}

bitflags! {
    /// Control status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtrlStatus: u32 {
        /// Firmware finished init
        const INIT_DONE = 1 << 0;
        /// Error code field
        const ERROR = 0xFE;
        /// Firmware is ready for power collapse
        const PC_READY = 1 << 8;
        /// Firmware is idle
        const IDLE = 1 << 30;
    }
}

bitflags! {
    /// Firmware CPU status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuStatus: u32 {
        /// Firmware CPU is in wait-for-interrupt
        const WFI = 1 << 0;
    }
}

/// Control status error code for a bad uncached region
pub const CTRL_ERROR_UC_REGION_INVALID: u32 = 0x4;
/// GDSC power-on status bit
pub const GDSC_POWER_ON: u32 = 1 << 31;
/// Branch clock off status bit
pub const CBCR_CLK_OFF: u32 = 1 << 31;
/// Subsystem idle bit in `SS_IDLE_STATUS`
pub const SS_IDLE: u32 = 1 << 22;
/// Queue table info value announcing a valid table
pub const QTBL_ENABLE: u32 = 0x1;

/// Extract the error code field from a control status value
pub fn ctrl_error_code(status: u32) -> u32 {
    status & CtrlStatus::ERROR.bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_mask() {
        assert!(IntrStatus::FATAL.contains(IntrStatus::A2HWD));
        assert!(!IntrStatus::FATAL.contains(IntrStatus::A2HCPU));
        let raw = IntrStatus::A2HCPU.bits() | IntrStatus::CPU_NOC_ERR.bits();
        assert!(IntrStatus::from_bits_truncate(raw).intersects(IntrStatus::FATAL));
    }

    #[test]
    fn test_ctrl_error_code() {
        assert_eq!(ctrl_error_code(0x8 | 0x1), 0x8);
        assert_eq!(ctrl_error_code(CTRL_ERROR_UC_REGION_INVALID), CTRL_ERROR_UC_REGION_INVALID);
        assert_eq!(ctrl_error_code(CtrlStatus::PC_READY.bits()), 0);
    }
}
