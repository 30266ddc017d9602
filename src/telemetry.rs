// Copyright (c) 2024 Botho Foundation

//! OpenTelemetry tracing configuration for the overlay's structured logs.
//!
//! This module provides optional OTLP (OpenTelemetry Protocol) export for
//! tracing peer connection, routing, and DHT events across nodes. When
//! enabled, traces are exported to a collector (such as Jaeger) for
//! visualization and debugging.
//!
//! # Configuration
//!
//! Telemetry is configured via the config file:
//!
//! ```toml
//! [telemetry]
//! enabled = true
//! endpoint = "http://localhost:4317"  # OTLP gRPC endpoint
//! service_name = "peerpigeon-node"
//! sampling_rate = 0.1  # 10% of traces
//! ```

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{RandomIdGenerator, Sampler, Tracer},
    Resource,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether telemetry is enabled
    #[serde(default)]
    pub enabled: bool,
    /// OTLP endpoint (gRPC)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Service name for traces
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Sampling rate (0.0 to 1.0)
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
}

fn default_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "peerpigeon-node".to_string()
}

fn default_sampling_rate() -> f64 {
    1.0
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            service_name: default_service_name(),
            sampling_rate: default_sampling_rate(), // Sample all traces by default when enabled
        }
    }
}

/// Initialize the tracing subscriber with optional OpenTelemetry export.
///
/// This sets up:
/// - Console logging via tracing_subscriber::fmt
/// - Optional OTLP export when telemetry is enabled
///
/// # Arguments
///
/// * `config` - Telemetry configuration
/// * `verbose` - Whether to enable debug-level logging
///
/// # Returns
///
/// Returns a guard that must be held for the duration of the program.
/// When dropped, it will flush any pending traces.
pub fn init_tracing(config: &TelemetryConfig, verbose: bool) -> Result<Option<TelemetryGuard>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(level));

    if config.enabled {
        // Set up OpenTelemetry with OTLP exporter
        let tracer = init_otlp_tracer(config)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(telemetry_layer)
            .init();

        tracing::info!(
            endpoint = %config.endpoint,
            service = %config.service_name,
            sampling_rate = config.sampling_rate,
            "OpenTelemetry tracing enabled"
        );

        Ok(Some(TelemetryGuard))
    } else {
        tracing_subscriber::registry().with(fmt_layer).init();

        Ok(None)
    }
}

/// Initialize OTLP tracer and return it
fn init_otlp_tracer(config: &TelemetryConfig) -> Result<Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(config.endpoint.clone());

    let sampler = if config.sampling_rate >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sampling_rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sampling_rate)
    };

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            opentelemetry_sdk::trace::config()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", config.service_name.clone()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .install_batch(runtime::Tokio)
        .context("Failed to install OTLP tracer")?;

    Ok(tracer)
}

/// Guard that ensures traces are flushed on shutdown.
///
/// Hold this for the duration of your program. When dropped,
/// it will flush any pending traces to the collector.
pub struct TelemetryGuard;

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.endpoint, "http://localhost:4317");
        assert_eq!(config.service_name, "peerpigeon-node");
        assert_eq!(config.sampling_rate, 1.0);
    }

    #[test]
    fn test_telemetry_config_sampling_bounds() {
        // Test that sampling rate is clamped properly
        let config = TelemetryConfig {
            enabled: true,
            sampling_rate: 1.5, // > 1.0
            ..Default::default()
        };
        // Should use AlwaysOn when >= 1.0
        assert!(config.sampling_rate >= 1.0);

        let config = TelemetryConfig {
            enabled: true,
            sampling_rate: -0.5, // < 0.0
            ..Default::default()
        };
        // Should use AlwaysOff when <= 0.0
        assert!(config.sampling_rate <= 0.0);
    }
}
