use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Context, Result};
use delivery_plugin::LogLevel;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub const SERVICE_NAME: &str = "script-delivery";
/// Target of the one-line JSON report emitted per delivery.
pub const DELIVERY_TARGET: &str = "delivery";

const LOG_FILE: &str = "script_delivery.log";
const EVENT_FILE: &str = "script_delivery_events.log";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>, otel_endpoint: Option<String>) -> Self {
        Self { log_level, log_dir, otel_endpoint }
    }

    /// `EnvFilter` directive: `RUST_LOG` wins over the configured level.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.log_level.as_filter()))
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(LogLevel::Info, None, None)
    }
}

/// Keeps the OTLP providers alive. Dropping it without `shutdown` loses
/// whatever is still batched.
pub struct Telemetry {
    logger_provider: SdkLoggerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Err(err) = self.logger_provider.shutdown() {
            error!("otlp log provider shutdown: {err}");
        }
        if let Err(err) = self.meter_provider.shutdown() {
            error!("otlp meter provider shutdown: {err}");
        }
    }
}

/// Install the global subscriber.
///
/// - with an OTLP endpoint: logs and metrics go to the collector over
///   HTTP, plus a local fmt layer;
/// - with a log dir: a daily rolling text log, and a JSON file with one line
///   per delivery (target `delivery`);
/// - otherwise: fmt to stderr.
pub fn init_tracing(config: &LogConfig) -> Result<Option<Telemetry>> {
    if let Some(endpoint) = &config.otel_endpoint {
        let telemetry = init_otlp(config, endpoint)?;
        info!(endpoint = %endpoint, "otlp telemetry enabled");
        return Ok(Some(telemetry));
    }

    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
            let txt_layer = fmt::layer()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE))
                .with_ansi(false)
                .with_filter(config.filter());
            let json_layer = fmt::layer()
                .json()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, EVENT_FILE))
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{DELIVERY_TARGET}=info")));
            Registry::default()
                .with(txt_layer)
                .with(json_layer)
                .try_init()
                .context("installing file subscriber")?;
        }
        None => {
            Registry::default()
                .with(fmt::layer().with_writer(std::io::stderr).with_filter(config.filter()))
                .try_init()
                .context("installing stderr subscriber")?;
        }
    }
    Ok(None)
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_otlp(config: &LogConfig, endpoint: &str) -> Result<Telemetry> {
    let log_exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{endpoint}/v1/logs"))
        .build()
        .context("building otlp log exporter")?;
    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter)
        .with_resource(resource())
        .build();

    let metric_exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{endpoint}/v1/metrics"))
        .build()
        .context("building otlp metric exporter")?;
    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(resource())
        .build();

    // the exporters' own http stack must not feed back into the bridge
    let bridge_filter = config
        .filter()
        .add_directive("hyper=off".parse()?)
        .add_directive("reqwest=off".parse()?)
        .add_directive("opentelemetry=off".parse()?);
    let otel_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(bridge_filter);
    let fmt_layer = fmt::layer().with_thread_names(true).with_filter(config.filter());

    Registry::default()
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
        .context("installing otlp subscriber")?;

    global::set_meter_provider(meter_provider.clone());

    Ok(Telemetry { logger_provider, meter_provider })
}

/// Counters and latency for script deliveries.
#[derive(Clone)]
pub struct DeliveryMetrics {
    started: Counter<u64>,
    succeeded: Counter<u64>,
    failed: Counter<u64>,
    latency_ms: Histogram<f64>,
}

impl std::fmt::Debug for DeliveryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeliveryMetrics")
    }
}

impl Default for DeliveryMetrics {
    fn default() -> Self {
        Self::new(&global::meter(SERVICE_NAME))
    }
}

impl DeliveryMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            started: meter
                .u64_counter("deliveries_started")
                .with_description("Deliveries handed to a script")
                .build(),
            succeeded: meter.u64_counter("deliveries_succeeded").build(),
            failed: meter.u64_counter("deliveries_failed").build(),
            latency_ms: meter
                .f64_histogram("delivery_latency_ms")
                .with_description("Script call latency per delivery")
                .with_unit("ms")
                .build(),
        }
    }

    /// Time `deliver`, count its outcome and emit the `delivery` report line.
    pub fn instrument_delivery(&self, plugin: &str, notification: &str, deliver: impl FnOnce() -> bool) -> bool {
        let attributes = [KeyValue::new("plugin", plugin.to_string())];
        self.started.add(1, &attributes);
        let start = Instant::now();

        let delivered = deliver();

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.latency_ms.record(elapsed, &attributes);
        if delivered {
            self.succeeded.add(1, &attributes);
        } else {
            self.failed.add(1, &attributes);
        }

        tracing::event!(
            target: DELIVERY_TARGET,
            tracing::Level::INFO,
            plugin,
            notification,
            latency_ms = elapsed,
            status = if delivered { "ok" } else { "error" },
        );
        delivered
    }
}
