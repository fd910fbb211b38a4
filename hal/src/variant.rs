//! # SoC Variants
//!
//! Per-SoC constant tables, selected once at device construction.

use crate::regs;

/// Register default written on every power-on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegDefault {
    /// Register offset
    pub reg: u32,
    /// Value to write
    pub value: u32,
}

/// NOC quality-of-service programming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NocQos {
    /// AXI QoS
    pub axi_qos: u32,
    /// Priority LUT low
    pub prioritylut_low: u32,
    /// Priority LUT high
    pub prioritylut_high: u32,
    /// Urgency low
    pub urgency_low: u32,
    /// Danger LUT low
    pub dangerlut_low: u32,
    /// Safe LUT low
    pub safelut_low: u32,
}

/// Constant description of one SoC integration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantTable {
    /// Human readable name
    pub name: &'static str,
    /// Registers programmed after power-on
    pub reg_defaults: &'static [RegDefault],
    /// NOC QoS values
    pub noc_qos: NocQos,
    /// Bridge reset toggles lines regardless of their power gate
    pub bridge_reset_ignores_power: bool,
    /// Power-off sequence includes the PDX FIFO reset
    pub pdx_fifo_reset: bool,
    /// Hardware version (upper half) needing threshold restore after resume
    pub threshold_restore_version: Option<u32>,
}

/// Supported SoC integrations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocVariant {
    /// Baseline Iris2 integration
    #[default]
    Iris2,
    /// Iris2 on Waipio
    Waipio,
    /// Iris2 on Kalama
    Kalama,
}

const IRIS2_DEFAULTS: [RegDefault; 2] = [
    RegDefault {
        reg: regs::WRAPPER_CPU_CLOCK_CONFIG,
        value: 0,
    },
    RegDefault {
        reg: regs::WRAPPER_CORE_CLOCK_CONFIG,
        value: 0,
    },
];

const IRIS2_QOS: NocQos = NocQos {
    axi_qos: 0x0000_0033,
    prioritylut_low: 0x2222_2222,
    prioritylut_high: 0x3333_3333,
    urgency_low: 0x1003_0003,
    dangerlut_low: 0x0000_0000,
    safelut_low: 0xFFFF_FFFF,
};

static IRIS2: VariantTable = VariantTable {
    name: "iris2",
    reg_defaults: &IRIS2_DEFAULTS,
    noc_qos: IRIS2_QOS,
    bridge_reset_ignores_power: false,
    pdx_fifo_reset: false,
    threshold_restore_version: Some(0x3 << 28 | 0x43 << 16),
};

static WAIPIO: VariantTable = VariantTable {
    name: "waipio",
    reg_defaults: &IRIS2_DEFAULTS,
    noc_qos: IRIS2_QOS,
    bridge_reset_ignores_power: true,
    pdx_fifo_reset: false,
    threshold_restore_version: None,
};

static KALAMA: VariantTable = VariantTable {
    name: "kalama",
    reg_defaults: &IRIS2_DEFAULTS,
    noc_qos: NocQos {
        urgency_low: 0x1003_0004,
        ..IRIS2_QOS
    },
    bridge_reset_ignores_power: false,
    pdx_fifo_reset: true,
    threshold_restore_version: None,
};

impl SocVariant {
    /// Constant table for this variant
    pub fn table(self) -> &'static VariantTable {
        match self {
            Self::Iris2 => &IRIS2,
            Self::Waipio => &WAIPIO,
            Self::Kalama => &KALAMA,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_tables() {
        assert_eq!(SocVariant::default(), SocVariant::Iris2);
        assert!(SocVariant::Waipio.table().bridge_reset_ignores_power);
        assert!(SocVariant::Kalama.table().pdx_fifo_reset);
        assert_eq!(SocVariant::Kalama.table().noc_qos.axi_qos, IRIS2_QOS.axi_qos);
        assert!(SocVariant::Iris2.table().threshold_restore_version.is_some());
    }
}
