//! Configuration validation
//!
//! Validates DealerSync configuration for correctness:
//! - Remote and DMS URLs are usable
//! - No duplicate tenant ids
//! - Appointment sync has somewhere to write
//! - Orchestrator paging stays within bounds

use super::sync_config::SyncConfig;
use super::tenant::TenantConfig;
use crate::SyncError;
use std::collections::HashSet;

/// Smallest and largest page the orchestrator will scan
pub const PAGE_SIZE_RANGE: std::ops::RangeInclusive<u32> = 50..=100;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub tenant: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tenant: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref tenant) = self.tenant {
            write!(f, "[{}] {}: {}", tenant, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a DealerSync configuration
pub fn validate_config(config: &SyncConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if !is_http_url(&config.remote.base_url) {
        errors.push(ValidationError::new(
            "remote.base_url",
            format!("Must be an http(s) URL, got '{}'", config.remote.base_url),
        ));
    }

    if let Some(ref dms) = config.dms {
        if !is_http_url(&dms.base_url) {
            errors.push(ValidationError::new(
                "dms.base_url",
                format!("Must be an http(s) URL, got '{}'", dms.base_url),
            ));
        }
    }

    if !PAGE_SIZE_RANGE.contains(&config.orchestrator.page_size) {
        errors.push(ValidationError::new(
            "orchestrator.page_size",
            format!(
                "Must be between {} and {}",
                PAGE_SIZE_RANGE.start(),
                PAGE_SIZE_RANGE.end()
            ),
        ));
    }

    if config.orchestrator.max_attempts == 0 {
        errors.push(ValidationError::new(
            "orchestrator.max_attempts",
            "Must be greater than 0",
        ));
    }

    let mut seen = HashSet::new();
    for tenant in &config.tenants {
        if !seen.insert(&tenant.tenant_id) {
            errors.push(ValidationError::new(
                "tenants",
                format!("Duplicate tenant id: {}", tenant.tenant_id),
            ));
        }
        if let Err(mut tenant_errors) = validate_tenant(tenant) {
            errors.append(&mut tenant_errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a single tenant
pub fn validate_tenant(tenant: &TenantConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if tenant.tenant_id.trim().is_empty() {
        errors.push(ValidationError::new("tenant_id", "Tenant id cannot be empty"));
    }

    if tenant.sync_appointments_enabled && tenant.calendars.is_empty() {
        errors.push(
            ValidationError::new(
                "calendars",
                "Appointment sync is enabled but no calendar is mapped",
            )
            .with_tenant(&tenant.tenant_id),
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and convert to a crate error
pub fn validate_config_result(config: &SyncConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        SyncError::Config(messages.join("; "))
    })
}

fn is_http_url(url: &str) -> bool {
    (url.starts_with("https://") || url.starts_with("http://")) && url.len() > "https://".len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AppointmentType;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::new().with_tenant(TenantConfig::new("d1"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_tenants() {
        let config = SyncConfig::new()
            .with_tenant(TenantConfig::new("d1"))
            .with_tenant(TenantConfig::new("d1"));
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("Duplicate tenant id")));
    }

    #[test]
    fn test_appointment_sync_needs_calendar() {
        let config =
            SyncConfig::new().with_tenant(TenantConfig::new("d1").with_appointment_sync(true));
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].tenant.as_deref(), Some("d1"));
        assert_eq!(errors[0].field, "calendars");

        let fixed = SyncConfig::new().with_tenant(
            TenantConfig::new("d1")
                .with_appointment_sync(true)
                .with_calendar(AppointmentType::Sales, "cal-1"),
        );
        assert!(validate_config(&fixed).is_ok());
    }

    #[test]
    fn test_page_size_bounds() {
        let mut config = SyncConfig::new();
        config.orchestrator.page_size = 500;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "orchestrator.page_size");
    }

    #[test]
    fn test_bad_remote_url() {
        let config = SyncConfig::new().with_remote_url("crm.example.com");
        let err = validate_config_result(&config).unwrap_err();
        assert!(err.to_string().contains("remote.base_url"));
    }
}
