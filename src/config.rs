//! Per-tenant submission settings. Read-only once loaded.

use crate::client::Endpoint;
use crate::envelope::SenderIdentity;
use crate::error::{VerifactuError, VerifactuResult};
use crate::profile::{DocumentProfile, RegulatoryMode, SchemaVersion, SystemInfo, profile_for};
use crate::store::TenantDirectory;
use crate::utils::{clean_tax_id, sanitize_system_id};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const PRODUCTION_ENDPOINT: &str =
    "https://www1.agenciatributaria.gob.es/wlpl/TIKE-CONT/ws/SistemaFacturacion/VerifactuSOAP";
pub const TEST_ENDPOINT: &str =
    "https://prewww1.aeat.es/wlpl/TIKE-CONT/ws/SistemaFacturacion/VerifactuSOAP";

/// Upper bound for every duration setting, one leap year.
pub const MAX_SETTING_SECS: u64 = 366 * 24 * 60 * 60;

/// Seconds from a setting, clamped to `MAX_SETTING_SECS`.
pub fn setting_duration(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_SETTING_SECS) as i64)
}

/// Selection and pacing limits for one scheduler run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulePolicy {
    pub enabled: bool,
    pub batch_size: usize,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// spacing between two sends for the same tenant
    pub min_interval_secs: u64,
    pub jitter_max_secs: u64,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 5,
            backoff_base_secs: 600,
            backoff_cap_secs: 3600,
            min_interval_secs: 60,
            jitter_max_secs: 60,
        }
    }
}

impl SchedulePolicy {
    pub fn min_interval(&self) -> chrono::Duration {
        setting_duration(self.min_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerPolicy {
    pub window_secs: u64,
    pub threshold: usize,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            window_secs: 900,
            threshold: 5,
        }
    }
}

/// Once-a-day run at a local wall-clock time. Uses the periodic policy unless
/// `use_custom_params` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DailySchedule {
    pub enabled: bool,
    pub hour: u32,
    pub minute: u32,
    pub use_custom_params: bool,
    pub policy: SchedulePolicy,
}

impl Default for DailySchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            hour: 2,
            minute: 0,
            use_custom_params: false,
            policy: SchedulePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanySubmissionConfig {
    pub tenant: String,
    pub company_name: String,
    pub issuer_tax_id: String,
    #[serde(default = "default_endpoint")]
    pub endpoint_url: String,
    pub credential_ref: String,
    #[serde(default)]
    pub mode: RegulatoryMode,
    #[serde(default)]
    pub schema: SchemaVersion,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub system: SystemInfo,
    #[serde(default)]
    pub periodic: SchedulePolicy,
    #[serde(default)]
    pub daily: DailySchedule,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerPolicy,
    #[serde(default = "default_watchdog_ttl")]
    pub watchdog_ttl_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// pending records older than this many days are reported as anomalies
    #[serde(default = "default_stale_days")]
    pub anomaly_stale_days: u32,
}

fn default_endpoint() -> String {
    TEST_ENDPOINT.to_string()
}
fn default_watchdog_ttl() -> u64 {
    1800
}
fn default_request_timeout() -> u64 {
    30
}
fn default_stale_days() -> u32 {
    7
}

impl CompanySubmissionConfig {
    /// Minimal configuration for `tenant`, every policy at its default.
    pub fn new(tenant: &str, company_name: &str, issuer_tax_id: &str, credential_ref: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            company_name: company_name.to_string(),
            issuer_tax_id: issuer_tax_id.to_string(),
            endpoint_url: default_endpoint(),
            credential_ref: credential_ref.to_string(),
            mode: RegulatoryMode::default(),
            schema: SchemaVersion::default(),
            time_zone: None,
            system: SystemInfo::default(),
            periodic: SchedulePolicy::default(),
            daily: DailySchedule::default(),
            circuit_breaker: CircuitBreakerPolicy::default(),
            watchdog_ttl_secs: default_watchdog_ttl(),
            request_timeout_secs: default_request_timeout(),
            anomaly_stale_days: default_stale_days(),
        }
    }

    pub fn validate(&self) -> VerifactuResult<()> {
        let fail = |msg: String| Err(VerifactuError::Configuration(msg));
        if self.tenant.trim().is_empty() {
            return fail("tenant id is empty".into());
        }
        if clean_tax_id(&self.issuer_tax_id).is_empty() || self.company_name.trim().is_empty() {
            return fail(format!("tenant {} has no issuer identity", self.tenant));
        }
        if !self.endpoint_url.starts_with("https://") && !self.endpoint_url.starts_with("http://")
        {
            return fail(format!(
                "tenant {} endpoint is not an http url: {}",
                self.tenant, self.endpoint_url
            ));
        }
        if self.credential_ref.trim().is_empty() {
            return fail(format!("tenant {} has no signing credential", self.tenant));
        }
        if let Some(zone) = self.time_zone.as_deref() {
            if zone.parse::<Tz>().is_err() {
                return fail(format!("tenant {} time zone {zone} is unknown", self.tenant));
            }
        }
        if sanitize_system_id(&self.system.system_id).is_empty() {
            return fail(format!("tenant {} system id is empty after sanitizing", self.tenant));
        }
        if self.daily.hour > 23 || self.daily.minute > 59 {
            return fail(format!(
                "tenant {} daily time {:02}:{:02} is out of range",
                self.tenant, self.daily.hour, self.daily.minute
            ));
        }
        let spans = [
            ("watchdog ttl", self.watchdog_ttl_secs),
            ("request timeout", self.request_timeout_secs),
            ("circuit breaker window", self.circuit_breaker.window_secs),
        ];
        for (name, secs) in spans {
            if secs > MAX_SETTING_SECS {
                return fail(format!("tenant {} {name} of {secs}s is too long", self.tenant));
            }
        }
        for policy in [&self.periodic, &self.daily.policy] {
            let spans = [
                ("backoff base", policy.backoff_base_secs),
                ("backoff cap", policy.backoff_cap_secs),
                ("minimum interval", policy.min_interval_secs),
                ("jitter", policy.jitter_max_secs),
            ];
            for (name, secs) in spans {
                if secs > MAX_SETTING_SECS {
                    return fail(format!("tenant {} {name} of {secs}s is too long", self.tenant));
                }
            }
            if policy.batch_size == 0 {
                return fail(format!("tenant {} batch size must be positive", self.tenant));
            }
            if policy.backoff_cap_secs < policy.backoff_base_secs {
                return fail(format!(
                    "tenant {} backoff cap is below the base",
                    self.tenant
                ));
            }
        }
        Ok(())
    }

    pub fn zone(&self) -> Tz {
        crate::timestamp::resolve_zone(self.time_zone.as_deref())
    }

    pub fn profile(&self) -> Box<dyn DocumentProfile> {
        profile_for(self.schema, self.system.clone())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            url: self.endpoint_url.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs.min(MAX_SETTING_SECS)),
        }
    }

    pub fn sender(&self) -> SenderIdentity {
        SenderIdentity {
            name: self.company_name.trim().to_string(),
            tax_id: clean_tax_id(&self.issuer_tax_id),
        }
    }

    pub fn daily_policy(&self) -> &SchedulePolicy {
        if self.daily.use_custom_params {
            &self.daily.policy
        } else {
            &self.periodic
        }
    }

    pub fn watchdog_ttl(&self) -> chrono::Duration {
        setting_duration(self.watchdog_ttl_secs)
    }

    pub fn breaker_window(&self) -> chrono::Duration {
        setting_duration(self.circuit_breaker.window_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    tenant: Vec<CompanySubmissionConfig>,
}

/// Tenant configurations kept in memory, usually loaded from a TOML file.
#[derive(Debug, Clone, Default)]
pub struct TenantRegistry {
    tenants: Vec<CompanySubmissionConfig>,
}

impl TenantRegistry {
    pub fn new(tenants: Vec<CompanySubmissionConfig>) -> VerifactuResult<Self> {
        for config in &tenants {
            config.validate()?;
        }
        Ok(Self { tenants })
    }

    pub fn from_toml_str(text: &str) -> VerifactuResult<Self> {
        let file: RegistryFile = toml::from_str(text)
            .map_err(|e| VerifactuError::Configuration(format!("tenant registry: {e}")))?;
        Self::new(file.tenant)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> VerifactuResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            VerifactuError::Configuration(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }
}

impl TenantDirectory for TenantRegistry {
    fn tenants(&self) -> VerifactuResult<Vec<CompanySubmissionConfig>> {
        Ok(self.tenants.clone())
    }
    fn tenant(&self, tenant: &str) -> VerifactuResult<Option<CompanySubmissionConfig>> {
        Ok(self.tenants.iter().find(|t| t.tenant == tenant).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
[[tenant]]
tenant = "acme"
company_name = "Acme SL"
issuer_tax_id = "ES B12345678"
credential_ref = "acme-cert"
mode = "on_request"
time_zone = "Atlantic/Canary"

[tenant.periodic]
batch_size = 10

[tenant.daily]
enabled = true
hour = 23
minute = 30

[[tenant]]
tenant = "globex"
company_name = "Globex SA"
issuer_tax_id = "A87654321"
credential_ref = "globex-cert"
endpoint_url = "https://www1.agenciatributaria.gob.es/wlpl/TIKE-CONT/ws/SistemaFacturacion/VerifactuSOAP"
"#;

    #[test]
    fn registry_loads_with_defaults() {
        let registry = TenantRegistry::from_toml_str(REGISTRY).unwrap();
        let acme = registry.tenant("acme").unwrap().unwrap();
        assert_eq!(acme.mode, RegulatoryMode::OnRequest);
        assert_eq!(acme.periodic.batch_size, 10);
        assert_eq!(acme.periodic.backoff_base_secs, 600);
        assert_eq!(acme.circuit_breaker.threshold, 5);
        assert_eq!(acme.watchdog_ttl_secs, 1800);
        assert_eq!(acme.zone(), chrono_tz::Atlantic::Canary);
        assert_eq!(acme.sender().tax_id, "B12345678");
        assert_eq!(acme.endpoint_url, TEST_ENDPOINT);
        // daily run borrows the periodic policy
        assert_eq!(acme.daily_policy().batch_size, 10);

        let globex = registry.tenant("globex").unwrap().unwrap();
        assert_eq!(globex.endpoint().timeout, Duration::from_secs(30));
        assert_eq!(registry.tenants().unwrap().len(), 2);
    }

    #[test]
    fn unknown_zone_is_a_configuration_error() {
        let mut config = CompanySubmissionConfig::new("t", "Acme", "B12345678", "cert");
        config.time_zone = Some("Mars/Olympus".into());
        assert!(matches!(
            config.validate(),
            Err(VerifactuError::Configuration(_))
        ));
    }

    #[test]
    fn missing_issuer_is_rejected() {
        let config = CompanySubmissionConfig::new("t", "Acme", "  ", "cert");
        assert!(config.validate().is_err());
        let config = CompanySubmissionConfig::new("t", "Acme", "B12345678", "cert");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn oversized_durations_are_refused() {
        let mut config = CompanySubmissionConfig::new("t", "Acme", "B12345678", "cert");
        config.watchdog_ttl_secs = 10_000_000_000_000_000;
        assert!(matches!(config.validate(), Err(VerifactuError::Configuration(_))));
        // conversions clamp for configs that skipped validation
        assert_eq!(config.watchdog_ttl().num_seconds(), MAX_SETTING_SECS as i64);

        let mut config = CompanySubmissionConfig::new("t", "Acme", "B12345678", "cert");
        config.daily.policy.backoff_cap_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = CompanySubmissionConfig::new("t", "Acme", "B12345678", "cert");
        config.circuit_breaker.window_secs = MAX_SETTING_SECS;
        assert!(config.validate().is_ok());
        config.periodic.min_interval_secs = MAX_SETTING_SECS + 1;
        assert!(config.validate().is_err());
        assert!(TenantRegistry::new(vec![config]).is_err());
    }

    #[test]
    fn bad_toml_is_a_configuration_error() {
        let result = TenantRegistry::from_toml_str("[[tenant]]\ntenant = 3");
        assert!(matches!(result, Err(VerifactuError::Configuration(_))));
    }
}
