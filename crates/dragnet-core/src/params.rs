//! Typed schemas for the per-executor `config` maps.
//!
//! Task config arrives as an untyped JSON object from the submission
//! surface. Each task type has one concrete schema here; submission
//! validates against it so executors never see a malformed config. Extra
//! keys are tolerated (the dispatcher injects `dependencyData` into the
//! same map), missing or mistyped required keys are rejected.

use serde::Deserialize;
use serde_json::{Map, Value};

use dragnet_store::TaskType;

use crate::error::{OrchestrateError, Result};

/// Key under which upstream results are merged into a dependent's config.
pub const DEPENDENCY_DATA_KEY: &str = "dependencyData";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubdomainEnumParams {
    pub domain: String,
    pub wordlist: Option<String>,
    pub resolvers: Option<Vec<String>>,
    pub concurrency: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortScanParams {
    pub target: String,
    /// Port expression, e.g. `"1-1024"` or `"80,443,8080"`.
    pub ports: Option<String>,
    pub rate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnScanParams {
    pub target: String,
    pub templates: Option<Vec<String>>,
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDiscoveryParams {
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirScanParams {
    pub base_url: String,
    pub wordlist: Option<String>,
    pub extensions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebCrawlParams {
    pub start_url: String,
    pub max_depth: Option<u32>,
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitiveScanParams {
    pub target: String,
    pub rules: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMonitorParams {
    pub url: String,
    pub interval_secs: Option<u64>,
    pub selector: Option<String>,
}

/// Validated config, tagged by task type.
#[derive(Debug, Clone)]
pub enum ScanParams {
    SubdomainEnum(SubdomainEnumParams),
    PortScan(PortScanParams),
    VulnScan(VulnScanParams),
    AssetDiscovery(AssetDiscoveryParams),
    DirScan(DirScanParams),
    WebCrawl(WebCrawlParams),
    SensitiveScan(SensitiveScanParams),
    PageMonitor(PageMonitorParams),
}

fn parse<T: serde::de::DeserializeOwned>(
    task_type: TaskType,
    config: &Map<String, Value>,
) -> Result<T> {
    serde_json::from_value(Value::Object(config.clone())).map_err(|e| {
        OrchestrateError::Validation(format!("invalid {task_type} config: {e}"))
    })
}

fn require_non_empty(task_type: TaskType, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(OrchestrateError::Validation(format!(
            "invalid {task_type} config: {field} must not be empty"
        )));
    }
    Ok(())
}

fn require_http_url(task_type: TaskType, field: &str, value: &str) -> Result<()> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(OrchestrateError::Validation(format!(
            "invalid {task_type} config: {field} must be an http(s) URL"
        )));
    }
    Ok(())
}

/// Validate a raw config map against the schema for `task_type`.
///
/// Runs at submit time; execution never re-validates.
pub fn validate_config(task_type: TaskType, config: &Map<String, Value>) -> Result<ScanParams> {
    match task_type {
        TaskType::SubdomainEnum => {
            let params: SubdomainEnumParams = parse(task_type, config)?;
            require_non_empty(task_type, "domain", &params.domain)?;
            Ok(ScanParams::SubdomainEnum(params))
        }
        TaskType::PortScan => {
            let params: PortScanParams = parse(task_type, config)?;
            require_non_empty(task_type, "target", &params.target)?;
            Ok(ScanParams::PortScan(params))
        }
        TaskType::VulnScan => {
            let params: VulnScanParams = parse(task_type, config)?;
            require_non_empty(task_type, "target", &params.target)?;
            Ok(ScanParams::VulnScan(params))
        }
        TaskType::AssetDiscovery => {
            let params: AssetDiscoveryParams = parse(task_type, config)?;
            if params.targets.is_empty() {
                return Err(OrchestrateError::Validation(format!(
                    "invalid {task_type} config: targets must not be empty"
                )));
            }
            Ok(ScanParams::AssetDiscovery(params))
        }
        TaskType::DirScan => {
            let params: DirScanParams = parse(task_type, config)?;
            require_http_url(task_type, "baseUrl", &params.base_url)?;
            Ok(ScanParams::DirScan(params))
        }
        TaskType::WebCrawl => {
            let params: WebCrawlParams = parse(task_type, config)?;
            require_http_url(task_type, "startUrl", &params.start_url)?;
            Ok(ScanParams::WebCrawl(params))
        }
        TaskType::SensitiveScan => {
            let params: SensitiveScanParams = parse(task_type, config)?;
            require_non_empty(task_type, "target", &params.target)?;
            Ok(ScanParams::SensitiveScan(params))
        }
        TaskType::PageMonitor => {
            let params: PageMonitorParams = parse(task_type, config)?;
            require_http_url(task_type, "url", &params.url)?;
            Ok(ScanParams::PageMonitor(params))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn port_scan_accepts_minimal_config() {
        let config = map(json!({"target": "10.0.0.1"}));
        let params = validate_config(TaskType::PortScan, &config).unwrap();
        assert!(matches!(params, ScanParams::PortScan(p) if p.target == "10.0.0.1"));
    }

    #[test]
    fn port_scan_rejects_missing_target() {
        let config = map(json!({"ports": "1-1024"}));
        let result = validate_config(TaskType::PortScan, &config);
        assert!(matches!(result, Err(OrchestrateError::Validation(_))));
    }

    #[test]
    fn empty_target_rejected() {
        let config = map(json!({"target": "   "}));
        let result = validate_config(TaskType::VulnScan, &config);
        assert!(matches!(result, Err(OrchestrateError::Validation(_))));
    }

    #[test]
    fn extra_keys_tolerated() {
        let config = map(json!({
            "domain": "example.com",
            "dependencyData": {"some-task": {"hosts": ["h1"]}},
        }));
        assert!(validate_config(TaskType::SubdomainEnum, &config).is_ok());
    }

    #[test]
    fn dir_scan_requires_http_url() {
        let config = map(json!({"baseUrl": "ftp://example.com"}));
        let result = validate_config(TaskType::DirScan, &config);
        assert!(matches!(result, Err(OrchestrateError::Validation(_))));

        let config = map(json!({"baseUrl": "https://example.com"}));
        assert!(validate_config(TaskType::DirScan, &config).is_ok());
    }

    #[test]
    fn asset_discovery_requires_targets() {
        let config = map(json!({"targets": []}));
        let result = validate_config(TaskType::AssetDiscovery, &config);
        assert!(matches!(result, Err(OrchestrateError::Validation(_))));
    }

    #[test]
    fn mistyped_field_rejected() {
        let config = map(json!({"target": "10.0.0.1", "rate": "fast"}));
        let result = validate_config(TaskType::PortScan, &config);
        assert!(matches!(result, Err(OrchestrateError::Validation(_))));
    }
}
