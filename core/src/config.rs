//! # Configuration
//!
//! Tunables for one HFI device. Every bounded hardware poll is described by
//! a [`PollConfig`] entry so tests can shorten them with [`PollConfig::fast`].

use cvp_hal::SocVariant;

use crate::{HfiError, Result};

/// Debug mode bit: log lines through the debug queue
pub const DEBUG_MODE_QUEUE: u32 = 0x01;
/// Debug mode bit: trace through QDSS
pub const DEBUG_MODE_QDSS: u32 = 0x02;

/// Sleep interval between two polls, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepRange {
    /// Lower bound
    pub min_us: u32,
    /// Upper bound
    pub max_us: u32,
}

impl SleepRange {
    /// Create a new range
    pub const fn new(min_us: u32, max_us: u32) -> Self {
        Self { min_us, max_us }
    }

    /// Zero-length sleep
    pub const ZERO: Self = Self::new(0, 0);
}

/// A bounded poll: `tries` reads with `sleep` in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    /// Maximum number of reads
    pub tries: u32,
    /// Sleep after each unsuccessful read
    pub sleep: SleepRange,
}

impl PollSpec {
    /// Create a new poll description
    pub const fn new(tries: u32, min_us: u32, max_us: u32) -> Self {
        Self {
            tries,
            sleep: SleepRange::new(min_us, max_us),
        }
    }

    const fn instant(self) -> Self {
        Self {
            tries: self.tries,
            sleep: SleepRange::ZERO,
        }
    }
}

/// Retry counts and sleep intervals for every hardware poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Wait for the core GDSC to drop before boot
    pub gdsc: PollSpec,
    /// Wait for the firmware to report init done
    pub boot: PollSpec,
    /// Wait for WFI and PC-ready after a prepare-PC command
    pub prepare_pc: PollSpec,
    /// NOC low-power handshakes during controller power-off
    pub noc_lpi: PollSpec,
    /// Subsystem idle before core power-off
    pub core_idle: PollSpec,
    /// NOC partial reset acknowledge
    pub noc_reset: PollSpec,
    /// Hold time between asserting and releasing a reset line
    pub reset_hold: SleepRange,
}

impl PollConfig {
    /// Timings matching real hardware
    pub const fn hardware() -> Self {
        Self {
            gdsc: PollSpec::new(10, 100, 200),
            boot: PollSpec::new(1000, 500, 1000),
            prepare_pc: PollSpec::new(150, 150, 250),
            noc_lpi: PollSpec::new(1000, 50, 100),
            core_idle: PollSpec::new(10, 1000, 2000),
            noc_reset: PollSpec::new(10, 100, 200),
            reset_hold: SleepRange::new(1000, 1050),
        }
    }

    /// Same retry counts with every sleep removed
    pub const fn fast() -> Self {
        let hw = Self::hardware();
        Self {
            gdsc: hw.gdsc.instant(),
            boot: hw.boot.instant(),
            prepare_pc: hw.prepare_pc.instant(),
            noc_lpi: hw.noc_lpi.instant(),
            core_idle: hw.core_idle.instant(),
            noc_reset: hw.noc_reset.instant(),
            reset_hold: SleepRange::ZERO,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::hardware()
    }
}

/// Bandwidth compression settings pushed to the firmware after boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UbwcConfig {
    /// Highest bank bit
    pub highest_bank_bit: u32,
    /// Bank swizzle level 1
    pub bank_swzl_level1: bool,
    /// Bank swizzle level 2
    pub bank_swzl_level2: bool,
    /// Bank swizzle level 3
    pub bank_swzl_level3: bool,
    /// Bank spreading
    pub bank_spreading: bool,
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfiConfig {
    /// Chip integration
    pub variant: SocVariant,
    /// Bytes per queue array
    pub queue_size: usize,
    /// Largest single packet accepted on any queue
    pub max_packet_size: usize,
    /// Crash report region size
    pub sfr_size: usize,
    /// QDSS trace table region size, used when the debug mode asks for QDSS
    pub qdss_size: usize,
    /// Mirror the queue table for the DSP
    pub dsp_enabled: bool,
    /// Responses drained per interrupt
    pub max_packets_per_irq: usize,
    /// Idle delay before an automatic power collapse
    pub pc_delay_ms: u32,
    /// Consecutive not-ready collapse attempts before escalating
    pub max_pc_skip_count: u32,
    /// Enable automatic power collapse
    pub sw_power_collapsible: bool,
    /// Hand regulators to hardware control once firmware runs
    pub fw_low_power_mode: bool,
    /// Use system cache slices when the platform has them
    pub syscache_enabled: bool,
    /// Firmware debug level
    pub fw_debug_level: u32,
    /// Firmware debug output mode
    pub fw_debug_mode: u32,
    /// Ask the firmware to report idle
    pub idle_indicator: bool,
    /// Maximum concurrent sessions
    pub max_sessions: usize,
    /// Core clock rate programmed on power-on, 0 to keep the platform default
    pub clock_rate_hz: u64,
    /// Bandwidth compression settings
    pub ubwc: Option<UbwcConfig>,
    /// Hardware poll timings
    pub poll: PollConfig,
}

impl Default for HfiConfig {
    fn default() -> Self {
        Self {
            variant: SocVariant::default(),
            queue_size: 0x8_0000,
            max_packet_size: 12 * 1024,
            sfr_size: 0x1000,
            qdss_size: 0x1000,
            dsp_enabled: false,
            max_packets_per_irq: 32,
            pc_delay_ms: 1000,
            max_pc_skip_count: 10,
            sw_power_collapsible: true,
            fw_low_power_mode: false,
            syscache_enabled: true,
            fw_debug_level: 0x3F,
            fw_debug_mode: DEBUG_MODE_QUEUE,
            idle_indicator: true,
            max_sessions: 16,
            clock_rate_hz: 0,
            ubwc: None,
            poll: PollConfig::hardware(),
        }
    }
}

impl HfiConfig {
    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 || self.queue_size % 4 != 0 {
            log::error!("queue size {:#x} is not a word multiple", self.queue_size);
            return Err(HfiError::InvalidArgument);
        }
        if self.max_packet_size < 8 || self.max_packet_size > self.queue_size {
            log::error!("max packet size {:#x} out of range", self.max_packet_size);
            return Err(HfiError::InvalidArgument);
        }
        if self.sfr_size < 8 || self.max_packets_per_irq == 0 {
            return Err(HfiError::InvalidArgument);
        }
        if self.max_sessions == 0 || self.max_sessions > usize::from(u16::MAX) {
            return Err(HfiError::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        let config = HfiConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_packets_per_irq, 32);
        assert_eq!(config.poll.boot.tries, 1000);
    }

    #[test]
    fn test_fast_polls_keep_counts() {
        let fast = PollConfig::fast();
        assert_eq!(fast.prepare_pc.tries, 150);
        assert_eq!(fast.noc_lpi.sleep, SleepRange::ZERO);
        assert_eq!(fast.reset_hold, SleepRange::ZERO);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let config = HfiConfig {
            queue_size: 6,
            ..HfiConfig::default()
        };
        assert_eq!(config.validate(), Err(HfiError::InvalidArgument));

        let config = HfiConfig {
            max_packet_size: 0x10_0000,
            ..HfiConfig::default()
        };
        assert_eq!(config.validate(), Err(HfiError::InvalidArgument));
    }
}
