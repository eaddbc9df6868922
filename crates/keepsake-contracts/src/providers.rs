use std::fmt;

use serde::{Deserialize, Serialize};

/// Which family of backend a provider belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Hosted diffusion/training service.
    Hosted,
    /// Older generation-only server kept as a fallback.
    Legacy,
    /// Offline stand-in that never touches the network.
    Stub,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hosted => "hosted",
            Self::Legacy => "legacy",
            Self::Stub => "stub",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub training: bool,
    pub multi_angle: bool,
    pub reference_images: bool,
}

impl ProviderCapabilities {
    pub fn full() -> Self {
        Self {
            training: true,
            multi_angle: true,
            reference_images: true,
        }
    }

    pub fn generation_only() -> Self {
        Self {
            training: false,
            multi_angle: false,
            reference_images: false,
        }
    }
}

/// Capabilities of the routed backend as a whole, queried by callers instead
/// of inspecting which concrete provider is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteCapabilities {
    pub primary: ProviderKind,
    pub primary_enabled: bool,
    pub fallback: Option<ProviderKind>,
    pub features: ProviderCapabilities,
}

impl RouteCapabilities {
    pub fn supports_training(&self) -> bool {
        self.primary_enabled && self.features.training
    }

    pub fn supports_multi_angle(&self) -> bool {
        self.primary_enabled && self.features.multi_angle
    }
}

#[cfg(test)]
mod tests {
    use super::{ProviderCapabilities, ProviderKind, RouteCapabilities};

    #[test]
    fn disabled_primary_supports_nothing() {
        let caps = RouteCapabilities {
            primary: ProviderKind::Hosted,
            primary_enabled: false,
            fallback: Some(ProviderKind::Legacy),
            features: ProviderCapabilities::full(),
        };
        assert!(!caps.supports_training());
        assert!(!caps.supports_multi_angle());
    }

    #[test]
    fn kind_serializes_snake_case() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&ProviderKind::Stub)?, "\"stub\"");
        assert_eq!(ProviderKind::Legacy.to_string(), "legacy");
        Ok(())
    }
}
