//! Compute-device selection
//!
//! The `gpu_devices` configuration value accepts exactly three shapes: a
//! single non-negative ordinal, the `-1` sentinel meaning "all available
//! devices", or a comma-separated list of ordinals. Everything else is a
//! [`Error::Device`] at orchestration setup.

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Resolved device selection policy for a training run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelection {
    /// Use every available device
    All,
    /// Use exactly these device ordinals
    Devices(Vec<usize>),
}

impl DeviceSelection {
    /// Parse a device specification string.
    ///
    /// The `-1` sentinel is only accepted as the entire specification; inside
    /// a list it is rejected, since mixing "all devices" with an explicit
    /// list has no coherent meaning.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(Error::device("device specification is empty"));
        }

        if spec == "-1" {
            return Ok(Self::All);
        }

        let mut ordinals = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            let ordinal: i64 = part.parse().map_err(|_| {
                Error::device(format!(
                    "'{part}' is not a device ordinal; expected a non-negative \
                     integer, -1, or a comma-separated list of ordinals"
                ))
            })?;

            if ordinal < 0 {
                return Err(Error::device(format!(
                    "negative ordinal '{ordinal}' is only valid as the lone -1 sentinel"
                )));
            }

            ordinals.push(ordinal as usize);
        }

        Ok(Self::Devices(ordinals))
    }

    /// Ordinal of the primary device, when the selection names one
    pub fn primary_ordinal(&self) -> usize {
        match self {
            Self::All => 0,
            Self::Devices(ordinals) => ordinals.first().copied().unwrap_or(0),
        }
    }

    /// Realize the primary device as a candle [`Device`], falling back to
    /// CPU when no accelerator is compiled in or available
    pub fn primary_device(&self) -> Result<Device> {
        Ok(Device::cuda_if_available(self.primary_ordinal())?)
    }
}
