//! Fresh OS and device descriptors.
//!
//! Deferred events describe a process that no longer exists, but the OS and
//! hardware it ran on are still the ones we are running on now (modulo an OS
//! update in between, which is why the descriptor is always recomputed and
//! never read from disk).

use sysinfo::System;
use vigil_protocol::{DeviceContext, OsContext};

pub trait DeviceInfoProvider: Send + Sync {
    fn os(&self) -> OsContext;

    /// Static properties only. Battery, memory and orientation describe
    /// the current process and would be wrong for a past one.
    fn device(&self) -> DeviceContext;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDeviceInfo;

impl DeviceInfoProvider for SystemDeviceInfo {
    fn os(&self) -> OsContext {
        OsContext {
            name: System::name(),
            version: System::os_version(),
            build: System::long_os_version(),
            kernel_version: System::kernel_version(),
        }
    }

    fn device(&self) -> DeviceContext {
        let mut system = System::new();
        system.refresh_cpu();
        let brand = system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty());
        let processor_count = system.cpus().len();

        DeviceContext {
            manufacturer: brand.clone(),
            model: System::host_name(),
            family: brand,
            arch: System::cpu_arch().or_else(|| Some(std::env::consts::ARCH.to_string())),
            processor_count: (processor_count > 0).then_some(processor_count as u32),
        }
    }
}

/// Fixed descriptors, for hosts that already know their device and for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticDeviceInfo {
    pub os: OsContext,
    pub device: DeviceContext,
}

impl DeviceInfoProvider for StaticDeviceInfo {
    fn os(&self) -> OsContext {
        self.os.clone()
    }

    fn device(&self) -> DeviceContext {
        self.device.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_descriptor_reports_architecture() {
        let device = SystemDeviceInfo.device();
        assert!(device.arch.is_some());
    }

    #[test]
    fn static_descriptor_returns_configured_values() {
        let info = StaticDeviceInfo {
            os: OsContext {
                name: Some("Android".to_string()),
                version: Some("14".to_string()),
                ..OsContext::default()
            },
            device: DeviceContext {
                manufacturer: Some("Google".to_string()),
                model: Some("Pixel 8".to_string()),
                ..DeviceContext::default()
            },
        };
        assert_eq!(info.os().version.as_deref(), Some("14"));
        assert_eq!(info.device().model.as_deref(), Some("Pixel 8"));
    }
}
