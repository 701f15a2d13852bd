use std::{env, mem};

/// Default target for host builds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildTarget {
    Host,
    Triple(String),
}

pub const ATMEGA328P_TRIPLE: &str = "avr-unknown-unknown";
pub const CORTEX_M0_TRIPLE: &str = "thumbv6m-unknown-none-eabi";
pub const RISCV32_TRIPLE: &str = "riscv32imac-unknown-none-elf";

impl BuildTarget {
    pub fn host() -> Self {
        Self::Host
    }

    pub fn from_flag_or_env(flag: Option<String>) -> Self {
        let target = flag
            .or_else(|| env::var("EMBER_TARGET").ok())
            .filter(|t| !t.trim().is_empty());
        match target {
            Some(triple) => Self::Triple(triple),
            None => Self::Host,
        }
    }

    pub fn triple(&self) -> Option<&str> {
        match self {
            BuildTarget::Host => None,
            BuildTarget::Triple(triple) => Some(triple),
        }
    }

    #[allow(dead_code)]
    pub fn is_host(&self) -> bool {
        matches!(self, BuildTarget::Host)
    }

    /// AVR is the only family whose interrupt entry points need a dedicated
    /// calling convention, so it is the only one singled out here.
    pub fn is_avr(&self) -> bool {
        matches!(self, BuildTarget::Triple(triple) if triple_is_avr(triple))
    }

    pub fn is_embedded(&self) -> bool {
        !matches!(self, BuildTarget::Host)
    }

    pub fn pointer_width_bits(&self) -> u32 {
        match self {
            BuildTarget::Host => (mem::size_of::<usize>() * 8) as u32,
            BuildTarget::Triple(triple) if triple_is_avr(triple) => 16,
            BuildTarget::Triple(_) => 32,
        }
    }
}

pub fn triple_is_avr(triple: &str) -> bool {
    triple.starts_with("avr")
}

pub fn embedded_target_hint() -> String {
    format!("{}, {}, {}", ATMEGA328P_TRIPLE, CORTEX_M0_TRIPLE, RISCV32_TRIPLE)
}
