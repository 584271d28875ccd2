use crate::config::types::{Config, CrawlerConfig, DiseaseEntry, SourceEntry, UserAgentConfig};
use crate::storage::AssociationMethod;
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_storage_config(&config.storage)?;
    validate_diseases(&config.disease)?;
    validate_sources(&config.source, &config.disease)?;
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    validate_rate_limit("default-rate-limit", config.default_rate_limit)?;

    if config.progress_flush_every < 1 {
        return Err(ConfigError::Validation(format!(
            "progress-flush-every must be >= 1, got {}",
            config.progress_flush_every
        )));
    }

    if config.stale_job_minutes < 1 {
        return Err(ConfigError::Validation(format!(
            "stale-job-minutes must be >= 1, got {}",
            config.stale_job_minutes
        )));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    // Validate crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

/// Validates storage configuration
fn validate_storage_config(config: &crate::config::types::StorageConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates disease entries: non-empty names, unique ignoring case
fn validate_diseases(diseases: &[DiseaseEntry]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();

    for entry in diseases {
        let name = entry.name.trim();
        if name.is_empty() {
            return Err(ConfigError::Validation(
                "Disease name cannot be empty".to_string(),
            ));
        }
        if !seen.insert(name.to_lowercase()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate disease '{}'",
                name
            )));
        }
    }

    Ok(())
}

/// Validates source entries against the disease catalog
fn validate_sources(sources: &[SourceEntry], diseases: &[DiseaseEntry]) -> Result<(), ConfigError> {
    let known: HashSet<String> = diseases
        .iter()
        .map(|d| d.name.trim().to_lowercase())
        .collect();
    let mut names = HashSet::new();

    for entry in sources {
        if entry.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Source name cannot be empty".to_string(),
            ));
        }
        if !names.insert(entry.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate source '{}'",
                entry.name
            )));
        }
        if entry.connector.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "Source '{}' must name a connector",
                entry.name
            )));
        }
        if let Some(rate) = entry.rate_limit {
            validate_rate_limit(&format!("rate-limit of source '{}'", entry.name), rate)?;
        }

        match entry.association_method {
            AssociationMethod::Linked => {
                if entry.linked_diseases.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Linked source '{}' must list at least one disease",
                        entry.name
                    )));
                }
                for disease in &entry.linked_diseases {
                    if !known.contains(&disease.trim().to_lowercase()) {
                        return Err(ConfigError::Validation(format!(
                            "Source '{}' links unknown disease '{}'",
                            entry.name, disease
                        )));
                    }
                }
            }
            AssociationMethod::Search => {
                if !entry.linked_diseases.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Search source '{}' cannot list linked diseases",
                        entry.name
                    )));
                }
            }
        }

        if let Some(base) = entry.config.get("base-url").and_then(|v| v.as_str()) {
            Url::parse(base).map_err(|e| {
                ConfigError::InvalidUrl(format!(
                    "Invalid base-url '{}' for source '{}': {}",
                    base, entry.name, e
                ))
            })?;
        }
    }

    Ok(())
}

/// Rates must be positive and finite
fn validate_rate_limit(what: &str, rate: f64) -> Result<(), ConfigError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "{} must be a positive number of calls per second, got {}",
            what, rate
        )));
    }
    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact_email cannot be empty".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
