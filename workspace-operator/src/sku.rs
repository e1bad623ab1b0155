/// GPU shape of a provisionable instance type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkuConfig {
    pub name: &'static str,
    pub gpu_count: u32,
    /// Memory per GPU, in GiB.
    pub gpu_memory_gib: u32,
}

impl SkuConfig {
    pub fn total_gpu_memory_gib(&self) -> u32 {
        self.gpu_count * self.gpu_memory_gib
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CloudProvider {
    #[default]
    Azure,
    Aws,
}

impl CloudProvider {
    pub fn from_env() -> Self {
        match std::env::var(kaito_common::env::CLOUD_PROVIDER)
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "aws" => CloudProvider::Aws,
            _ => CloudProvider::Azure,
        }
    }
}

static AZURE_SKUS: &[SkuConfig] = &[
    SkuConfig { name: "Standard_NC12s_v3", gpu_count: 2, gpu_memory_gib: 16 },
    SkuConfig { name: "Standard_NC24s_v3", gpu_count: 1, gpu_memory_gib: 16 },
    SkuConfig { name: "Standard_NC24ads_A100_v4", gpu_count: 1, gpu_memory_gib: 80 },
    SkuConfig { name: "Standard_NC48ads_A100_v4", gpu_count: 2, gpu_memory_gib: 80 },
    SkuConfig { name: "Standard_NC96ads_A100_v4", gpu_count: 4, gpu_memory_gib: 80 },
    SkuConfig { name: "Standard_ND40rs_v2", gpu_count: 8, gpu_memory_gib: 32 },
    SkuConfig { name: "Standard_ND96asr_v4", gpu_count: 8, gpu_memory_gib: 40 },
];

static AWS_SKUS: &[SkuConfig] = &[
    SkuConfig { name: "p3.2xlarge", gpu_count: 1, gpu_memory_gib: 16 },
    SkuConfig { name: "p3.8xlarge", gpu_count: 4, gpu_memory_gib: 16 },
    SkuConfig { name: "p4d.24xlarge", gpu_count: 8, gpu_memory_gib: 40 },
    SkuConfig { name: "p5.48xlarge", gpu_count: 8, gpu_memory_gib: 80 },
    SkuConfig { name: "g5.xlarge", gpu_count: 1, gpu_memory_gib: 24 },
    SkuConfig { name: "g5.12xlarge", gpu_count: 4, gpu_memory_gib: 24 },
];

/// Instance-type catalog for the configured cloud. Instance types outside the
/// catalog are treated as non-GPU (resource checks and the device-plugin gate
/// do not apply to them).
#[derive(Clone, Copy, Debug, Default)]
pub struct SkuHandler {
    provider: CloudProvider,
}

impl SkuHandler {
    pub fn new(provider: CloudProvider) -> Self {
        SkuHandler { provider }
    }

    pub fn from_env() -> Self {
        SkuHandler::new(CloudProvider::from_env())
    }

    pub fn get(&self, instance_type: &str) -> Option<&'static SkuConfig> {
        let catalog = match self.provider {
            CloudProvider::Azure => AZURE_SKUS,
            CloudProvider::Aws => AWS_SKUS,
        };
        catalog.iter().find(|s| s.name == instance_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogs_are_gated_by_provider() {
        let azure = SkuHandler::new(CloudProvider::Azure);
        let aws = SkuHandler::new(CloudProvider::Aws);
        assert!(azure.get("Standard_NC24s_v3").is_some());
        assert!(azure.get("p3.2xlarge").is_none());
        assert!(aws.get("p3.2xlarge").is_some());
        assert!(aws.get("Standard_NC24s_v3").is_none());
    }

    #[test]
    fn unknown_sku_is_none() {
        assert!(SkuHandler::default().get("Standard_D4s_v5").is_none());
    }

    #[test]
    fn total_memory_multiplies_gpu_count() {
        let sku = SkuHandler::new(CloudProvider::Aws).get("p4d.24xlarge").unwrap();
        assert_eq!(sku.total_gpu_memory_gib(), 320);
    }
}
