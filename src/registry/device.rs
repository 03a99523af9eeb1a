//! Device capabilities and the selection context built from them.

use super::descriptor::BackendKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the target device can do.
///
/// `supports_immad` stands for systolic matrix hardware; the oneDNN
/// implementations require it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub architecture: String,
    pub supports_immad: bool,
    pub supports_fp16: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: "reference".to_string(),
            architecture: "host".to_string(),
            supports_immad: false,
            supports_fp16: true,
        }
    }
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            architecture: architecture.into(),
            ..Self::default()
        }
    }

    pub fn with_immad(mut self, supports_immad: bool) -> Self {
        self.supports_immad = supports_immad;
        self
    }

    pub fn with_fp16(mut self, supports_fp16: bool) -> Self {
        self.supports_fp16 = supports_fp16;
        self
    }

    /// Backend whose formats non-constant buffers should follow.
    pub fn preferred_backend(&self) -> BackendKind {
        if self.supports_immad {
            BackendKind::OneDnn
        } else {
            BackendKind::Ocl
        }
    }

    /// Identity written into cached programs. Any field change invalidates
    /// the cache.
    pub fn signature(&self) -> String {
        format!(
            "{}/{}/immad={}/fp16={}",
            self.name, self.architecture, self.supports_immad, self.supports_fp16
        )
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.architecture)
    }
}

/// Inputs to implementation selection beyond the node itself.
#[derive(Debug, Clone)]
pub struct ImplContext {
    pub device: DeviceInfo,
    pub preferred_backend: BackendKind,
}

impl ImplContext {
    pub fn new(device: DeviceInfo) -> Self {
        let preferred_backend = device.preferred_backend();
        Self {
            device,
            preferred_backend,
        }
    }
}

impl Default for ImplContext {
    fn default() -> Self {
        Self::new(DeviceInfo::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_backend_follows_immad() {
        assert_eq!(DeviceInfo::default().preferred_backend(), BackendKind::Ocl);
        let systolic = DeviceInfo::new("arc", "xe-hpg").with_immad(true);
        assert_eq!(ImplContext::new(systolic).preferred_backend, BackendKind::OneDnn);
    }

    #[test]
    fn test_signature_tracks_capabilities() {
        let a = DeviceInfo::new("gpu", "xe");
        let b = a.clone().with_fp16(false);
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_device_from_json() {
        let json = r#"{"name":"gpu","architecture":"xe","supports_immad":true,"supports_fp16":true}"#;
        let device: DeviceInfo = serde_json::from_str(json).unwrap();
        assert!(device.supports_immad);
    }
}
