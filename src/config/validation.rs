use crate::config::types::{
    BrokerConfig, Config, FetchConfig, FrontierConfig, ListenerConfig, MonitorConfig,
    StoreConfig, SupervisorConfig, UserAgentConfig,
};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_store_config(&config.store)?;
    validate_broker_config(&config.broker)?;
    validate_frontier_config(&config.frontier)?;
    validate_fetch_config(&config.fetch)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_listener_config(&config.listener)?;
    validate_supervisor_config(&config.supervisor)?;
    validate_monitor_config(&config.monitor)?;
    Ok(())
}

fn validate_store_config(config: &StoreConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.html_dir.is_empty() {
        return Err(ConfigError::Validation("html_dir cannot be empty".to_string()));
    }

    Ok(())
}

fn validate_broker_config(config: &BrokerConfig) -> Result<(), ConfigError> {
    if config.host.is_empty() {
        return Err(ConfigError::Validation("broker host cannot be empty".to_string()));
    }

    for tube in [&config.crawl_tube, &config.page_tube] {
        validate_tube_name(tube)?;
    }

    if config.crawl_tube == config.page_tube {
        return Err(ConfigError::Validation(format!(
            "crawl_tube and page_tube must differ, both are '{}'",
            config.crawl_tube
        )));
    }

    if config.visibility_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "visibility_timeout_secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Beanstalkd tube names: 1-200 bytes of letters, digits and `-+/;.$_()`,
/// not starting with a hyphen.
fn validate_tube_name(name: &str) -> Result<(), ConfigError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-+/;.$_()".contains(c));

    if name.is_empty() || name.len() > 200 || name.starts_with('-') || !valid_chars {
        return Err(ConfigError::Validation(format!(
            "invalid tube name '{}'",
            name
        )));
    }

    Ok(())
}

fn validate_frontier_config(config: &FrontierConfig) -> Result<(), ConfigError> {
    if config.max_queue_size < 1 {
        return Err(ConfigError::Validation(
            "max_queue_size must be >= 1".to_string(),
        ));
    }

    if config.default_max_pages < 1 {
        return Err(ConfigError::Validation(
            "default_max_pages must be >= 1".to_string(),
        ));
    }

    if config.concurrency_per_domain < 1 || config.concurrency_per_domain > 64 {
        return Err(ConfigError::Validation(format!(
            "concurrency_per_domain must be between 1 and 64, got {}",
            config.concurrency_per_domain
        )));
    }

    if config.sitemap_max_age_days < 1 {
        return Err(ConfigError::Validation(format!(
            "sitemap_max_age_days must be >= 1, got {}",
            config.sitemap_max_age_days
        )));
    }

    if config.control_poll_secs < 1 {
        return Err(ConfigError::Validation(
            "control_poll_secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_fetch_config(config: &FetchConfig) -> Result<(), ConfigError> {
    if config.timeout_secs < 1 {
        return Err(ConfigError::Validation("timeout_secs must be >= 1".to_string()));
    }

    if config.backoff_factor < 1.0 {
        return Err(ConfigError::Validation(format!(
            "backoff_factor must be >= 1.0, got {}",
            config.backoff_factor
        )));
    }

    if let Some(proxy) = &config.proxy_url {
        Url::parse(proxy)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid proxy_url: {}", e)))?;
    }

    if let Some(endpoint) = &config.render_endpoint {
        Url::parse(endpoint)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid render_endpoint: {}", e)))?;
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
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

/// Basic email validation: one `@` with a dotted domain part
fn validate_email(email: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid contact_email: '{}'",
            email
        )));
    }
    Ok(())
}

fn validate_listener_config(config: &ListenerConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_crawlers < 1 {
        return Err(ConfigError::Validation(
            "max_concurrent_crawlers must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_supervisor_config(config: &SupervisorConfig) -> Result<(), ConfigError> {
    if config.backoff_base_secs < 1 || config.backoff_max_secs < config.backoff_base_secs {
        return Err(ConfigError::Validation(format!(
            "backoff must satisfy 1 <= base ({}) <= max ({})",
            config.backoff_base_secs, config.backoff_max_secs
        )));
    }

    if config.max_restarts < 1 {
        return Err(ConfigError::Validation("max_restarts must be >= 1".to_string()));
    }

    if config.heartbeat_stale_secs <= config.heartbeat_interval_secs {
        return Err(ConfigError::Validation(format!(
            "heartbeat_stale_secs ({}) must exceed heartbeat_interval_secs ({})",
            config.heartbeat_stale_secs, config.heartbeat_interval_secs
        )));
    }

    Ok(())
}

fn validate_monitor_config(config: &MonitorConfig) -> Result<(), ConfigError> {
    if config.failure_threshold < 1 || config.success_threshold < 1 {
        return Err(ConfigError::Validation(
            "circuit thresholds must be >= 1".to_string(),
        ));
    }

    if config.probe_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "probe_interval_secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}
