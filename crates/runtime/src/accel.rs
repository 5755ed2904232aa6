use serde::{Deserialize, Serialize};

/// Execution providers a device may offer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccelerationType {
    Nnapi,
    GpuCompute,
    GpuDirect,
    Cpu,
    Unknown,
}

impl AccelerationType {
    pub fn label(&self) -> &'static str {
        match self {
            AccelerationType::Nnapi => "nnapi",
            AccelerationType::GpuCompute => "gpu_compute",
            AccelerationType::GpuDirect => "gpu_direct",
            AccelerationType::Cpu => "cpu",
            AccelerationType::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "nnapi" => AccelerationType::Nnapi,
            "gpu_compute" | "gpu" => AccelerationType::GpuCompute,
            "gpu_direct" => AccelerationType::GpuDirect,
            "cpu" => AccelerationType::Cpu,
            _ => AccelerationType::Unknown,
        }
    }
}

/// Hardware capability probe supplied by the host platform
pub trait AccelerationProbe: Send + Sync {
    fn best_acceleration_type(&self) -> AccelerationType;
}

/// Probe answering with a fixed provider, from configuration or for hosts without probing
#[derive(Debug, Clone, Copy)]
pub struct FixedAcceleration(pub AccelerationType);

impl FixedAcceleration {
    /// Use the configured label, or CPU when none is set
    pub fn from_config(label: Option<&str>) -> Self {
        Self(label.map_or(AccelerationType::Cpu, AccelerationType::from_label))
    }
}

impl Default for FixedAcceleration {
    fn default() -> Self {
        Self(AccelerationType::Cpu)
    }
}

impl AccelerationProbe for FixedAcceleration {
    fn best_acceleration_type(&self) -> AccelerationType {
        self.0
    }
}
