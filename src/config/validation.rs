//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes and listeners reference existing pools)
//! - Validate value ranges (thresholds ordered, sizes > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use crate::config::schema::{GatewayConfig, ListenerMode};
use crate::load_balancer::backend::BackendTarget;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("routing.default_pool is not set")]
    MissingDefaultPool,
    #[error("{context} references unknown pool '{pool}'")]
    UnknownPool { context: String, pool: String },
    #[error("transport listener '{0}' has no pool")]
    TransportListenerWithoutPool(String),
    #[error("duplicate backend name '{0}'")]
    DuplicateBackend(String),
    #[error("backend '{name}' has invalid address '{address}'")]
    InvalidAddress { name: String, address: String },
    #[error("backend '{0}' has zero weight")]
    ZeroWeight(String),
    #[error("soft_failure_threshold ({soft}) must be between 1 and hard_failure_threshold ({hard})")]
    ThresholdOrder { soft: u32, hard: u32 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let pools: HashSet<String> = config.pool_names().into_iter().collect();

    let mut seen = HashSet::new();
    for backend in &config.backends {
        if !seen.insert(backend.name.as_str()) {
            errors.push(ValidationError::DuplicateBackend(backend.name.clone()));
        }
        if BackendTarget::parse(&backend.address).is_err() {
            errors.push(ValidationError::InvalidAddress {
                name: backend.name.clone(),
                address: backend.address.clone(),
            });
        }
        if backend.weight == 0 {
            errors.push(ValidationError::ZeroWeight(backend.name.clone()));
        }
    }

    match &config.routing.default_pool {
        None => errors.push(ValidationError::MissingDefaultPool),
        Some(pool) if !pools.contains(pool) => errors.push(ValidationError::UnknownPool {
            context: "routing.default_pool".to_string(),
            pool: pool.clone(),
        }),
        Some(_) => {}
    }

    for route in &config.routes {
        if !pools.contains(&route.pool) {
            errors.push(ValidationError::UnknownPool {
                context: format!("route '{}'", route.name),
                pool: route.pool.clone(),
            });
        }
    }

    for listener in &config.listeners {
        match (&listener.mode, &listener.pool) {
            (ListenerMode::Transport, None) => {
                errors.push(ValidationError::TransportListenerWithoutPool(listener.name.clone()))
            }
            (_, Some(pool)) if !pools.contains(pool) => errors.push(ValidationError::UnknownPool {
                context: format!("listener '{}'", listener.name),
                pool: pool.clone(),
            }),
            _ => {}
        }
    }

    let health = &config.health_check;
    if health.soft_failure_threshold == 0
        || health.soft_failure_threshold > health.hard_failure_threshold
    {
        errors.push(ValidationError::ThresholdOrder {
            soft: health.soft_failure_threshold,
            hard: health.hard_failure_threshold,
        });
    }
    if health.interval_ms == 0 {
        errors.push(ValidationError::Zero("health_check.interval_ms"));
    }
    if config.connection_pool.max_size == 0 {
        errors.push(ValidationError::Zero("connection_pool.max_size"));
    }
    if config.sessions.max_sessions == 0 {
        errors.push(ValidationError::Zero("sessions.max_sessions"));
    }
    if config.sessions.replay_buffer_size == 0 {
        errors.push(ValidationError::Zero("sessions.replay_buffer_size"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
