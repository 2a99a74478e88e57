use std::time::Duration;

use envconfig::Envconfig;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio::signal::unix::{signal, SignalKind};
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use flag_engine::config::Config;
use flag_engine::server::serve;

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut interrupt =
        signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };
    tracing::info!("Shutdown signal received, draining");
}

/// OTLP span exporter for the flag engine, sampled at `otel_sampling_rate`.
fn otlp_tracer(config: &Config, endpoint: &str) -> Tracer {
    let trace_config = opentelemetry_sdk::trace::Config::default()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            config.otel_sampling_rate,
        ))))
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            config.otel_service_name.clone(),
        )]));

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(trace_config)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_timeout(Duration::from_secs(config.otel_export_timeout_secs)),
        )
        .install_batch(runtime::Tokio)
        .expect("Failed to initialize OpenTelemetry tracer")
}

fn init_tracing(config: &Config) {
    let stdout = fmt::layer().with_target(true).with_thread_ids(true);
    let log_layer = if *config.debug {
        stdout
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        stdout
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };

    let otel_layer = config.otel_url.as_deref().map(|endpoint| {
        OpenTelemetryLayer::new(otlp_tracer(config, endpoint))
            .with_filter(LevelFilter::from_level(config.otel_log_level))
    });

    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("Invalid configuration:");

    init_tracing(&config);

    if let Err(e) = config.validate() {
        panic!("Invalid configuration: {e}");
    }

    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .expect("could not bind port");
    serve(config, listener, shutdown_signal()).await;
}
