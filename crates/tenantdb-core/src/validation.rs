//! Input validation for tenant registry data
//!
//! Provides validation functions to prevent:
//! - Path traversal through connection descriptors
//! - Malformed tenant identifiers and routing keys
//! - Excessively long inputs

use crate::{Result, TenancyError};

/// Minimum length for tenant identifiers.
pub const MIN_TENANT_ID_LEN: usize = 3;

/// Maximum length for tenant identifiers.
pub const MAX_TENANT_ID_LEN: usize = 63;

/// Maximum length for routing keys (DNS label limit).
pub const MAX_ROUTING_KEY_LEN: usize = 63;

/// Maximum length for tenant display names.
pub const MAX_TENANT_NAME_LEN: usize = 200;

/// Validate generic identifier
///
/// Requirements:
/// - Not empty
/// - Alphanumeric, underscore, hyphen only
pub fn validate_identifier(identifier: &str, field_name: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(TenancyError::ValidationError(format!(
            "{} cannot be empty",
            field_name
        )));
    }

    if !identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(TenancyError::ValidationError(format!(
            "{} contains invalid characters (allowed: alphanumeric, _, -)",
            field_name
        )));
    }

    Ok(())
}

/// Validate tenant identifier
///
/// Requirements:
/// - 3-63 characters
/// - Lowercase alphanumeric, underscore, hyphen
/// - Must start with alphanumeric character
/// - Cannot end with hyphen
pub fn validate_tenant_id(id: &str) -> Result<()> {
    validate_identifier(id, "tenant_id")?;

    if id.len() < MIN_TENANT_ID_LEN {
        return Err(TenancyError::ValidationError(format!(
            "tenant_id too short: {} < {} characters",
            id.len(),
            MIN_TENANT_ID_LEN
        )));
    }

    if id.len() > MAX_TENANT_ID_LEN {
        return Err(TenancyError::ValidationError(format!(
            "tenant_id too long: {} > {} characters",
            id.len(),
            MAX_TENANT_ID_LEN
        )));
    }

    if id.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(TenancyError::ValidationError(
            "tenant_id must be lowercase".to_string(),
        ));
    }

    if let Some(first) = id.chars().next() {
        if !first.is_ascii_alphanumeric() {
            return Err(TenancyError::ValidationError(
                "tenant_id must start with alphanumeric character".to_string(),
            ));
        }
    }

    if id.ends_with('-') {
        return Err(TenancyError::ValidationError(
            "tenant_id cannot end with hyphen".to_string(),
        ));
    }

    Ok(())
}

/// Validate routing key (subdomain label)
///
/// Requirements:
/// - 1-63 characters
/// - Lowercase alphanumeric and hyphen only
/// - Cannot start or end with hyphen
pub fn validate_routing_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(TenancyError::ValidationError(
            "routing_key cannot be empty".to_string(),
        ));
    }

    if key.len() > MAX_ROUTING_KEY_LEN {
        return Err(TenancyError::ValidationError(format!(
            "routing_key too long: {} > {} characters",
            key.len(),
            MAX_ROUTING_KEY_LEN
        )));
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(TenancyError::ValidationError(
            "routing_key contains invalid characters (allowed: a-z, 0-9, -)".to_string(),
        ));
    }

    if key.starts_with('-') || key.ends_with('-') {
        return Err(TenancyError::ValidationError(
            "routing_key cannot start or end with hyphen".to_string(),
        ));
    }

    Ok(())
}

/// Validate tenant display name
pub fn validate_tenant_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(TenancyError::ValidationError(
            "Tenant name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_TENANT_NAME_LEN {
        return Err(TenancyError::ValidationError(format!(
            "Tenant name too long: {} > {} characters",
            name.len(),
            MAX_TENANT_NAME_LEN
        )));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(TenancyError::ValidationError(
            "Tenant name contains control characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate descriptor path for traversal attacks
///
/// Prevents:
/// - .. path components
/// - Null bytes
pub fn validate_descriptor_path(path: &str) -> Result<()> {
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(TenancyError::ValidationError(
            "Path contains traversal pattern (..)".to_string(),
        ));
    }

    if path.contains('\0') {
        return Err(TenancyError::ValidationError(
            "Path contains null byte".to_string(),
        ));
    }

    Ok(())
}
