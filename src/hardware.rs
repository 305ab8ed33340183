//! Hardware classification: maps user-agent/hashrate hints to a
//! hardware class carrying a base difficulty and clamp bounds.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareClass {
    Unknown,
    Cpu,
    Gpu,
    Fpga,
    Asic,
    OfficialAsic,
}

impl HardwareClass {
    /// Starting-hint base difficulty; the vardiff loop converges regardless.
    pub fn base_difficulty(self) -> u64 {
        match self {
            HardwareClass::Cpu => 32,
            HardwareClass::Gpu => 4096,
            HardwareClass::Fpga => 16384,
            HardwareClass::Asic => 32768,
            HardwareClass::OfficialAsic => 65536,
            HardwareClass::Unknown => 256,
        }
    }

    pub fn min_difficulty(self) -> u64 {
        (self.base_difficulty() / 4).max(1)
    }

    pub fn max_difficulty(self) -> u64 {
        self.base_difficulty() * 64
    }

    /// Classify from a `mining.subscribe` user-agent string and an
    /// optional self-reported hashrate (H/s).
    pub fn classify(user_agent: &str, hashrate: Option<f64>) -> Self {
        let ua = user_agent.to_lowercase();

        if ua.contains("x100") {
            return HardwareClass::OfficialAsic;
        }
        if ua.contains("x30") || ua.contains("antminer") || ua.contains("whatsminer") {
            return HardwareClass::Asic;
        }
        if ua.contains("cuda") || ua.contains("opencl") || ua.contains("gpu") {
            return HardwareClass::Gpu;
        }
        if ua.contains("cpuminer") || ua.contains("cpu") {
            return HardwareClass::Cpu;
        }
        if ua.contains("fpga") {
            return HardwareClass::Fpga;
        }

        match hashrate {
            Some(h) if h > 0.0 => {
                const MH: f64 = 1_000_000.0;
                const TH: f64 = 1_000_000_000_000.0;
                if h <= 1.0 * MH {
                    HardwareClass::Cpu
                } else if h <= 80.0 * MH {
                    HardwareClass::Fpga
                } else if h <= 100.0 * MH {
                    HardwareClass::Gpu
                } else if h <= 100.0 * TH {
                    HardwareClass::Asic
                } else {
                    HardwareClass::OfficialAsic
                }
            }
            _ => HardwareClass::Unknown,
        }
    }
}
