use anyhow::Result;
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Response, Server,
};
use lazy_static::lazy_static;
use log::{debug, error, info};
use prometheus::{
    register_gauge_vec_with_registry, register_gauge_with_registry,
    register_histogram_vec_with_registry, register_histogram_with_registry, Encoder, Gauge,
    GaugeVec, Histogram, HistogramVec, Registry, TextEncoder,
};

use crate::configuration::Register;

struct PrometheusExporter {
    bind_address: String,
}

lazy_static! {
    pub static ref REGISTRY: Registry =
        Registry::new_custom(Some("auction_engine".to_string()), None).unwrap();
    pub static ref ACTIVE_ACTOR_INSTANCES_COUNT: GaugeVec = register_gauge_vec_with_registry!(
        "active_actor_instances_count",
        "Number of active 'actor' instances",
        &["instance"],
        REGISTRY
    )
    .unwrap();
    pub static ref ACTIVE_HANDLE_INSTANCES_COUNT: GaugeVec = register_gauge_vec_with_registry!(
        "active_handle_instances_count",
        "Number of active 'handle' instances",
        &["instance"],
        REGISTRY
    )
    .unwrap();
    pub static ref ACTIVE_WORKFLOWS_COUNT: Gauge = register_gauge_with_registry!(
        "active_workflows_count",
        "Number of workflows currently executing",
        REGISTRY
    )
    .unwrap();
    pub static ref BIDS_SUBMITTED_COUNT: GaugeVec = register_gauge_vec_with_registry!(
        "bids_submitted_count",
        "Number of accepted bids, by mechanism",
        &["mechanism"],
        REGISTRY
    )
    .unwrap();
    pub static ref BIDS_REJECTED_COUNT: GaugeVec = register_gauge_vec_with_registry!(
        "bids_rejected_count",
        "Number of rejected bids, by mechanism",
        &["mechanism"],
        REGISTRY
    )
    .unwrap();
    pub static ref EVENTS_APPENDED_COUNT: Gauge = register_gauge_with_registry!(
        "events_appended_count",
        "Number of entries appended to the event log",
        REGISTRY
    )
    .unwrap();
    pub static ref AUCTION_FINALIZATION_TIME: HistogramVec =
        register_histogram_vec_with_registry!(
            "auction_finalization_time",
            "Time spent in seconds clearing an auction",
            &["mechanism"],
            REGISTRY
        )
        .unwrap();
    pub static ref WORKFLOW_EXECUTION_TIME: Histogram = register_histogram_with_registry!(
        "workflow_execution_time",
        "Time spent in seconds executing a workflow",
        REGISTRY
    )
    .unwrap();
}

#[macro_export]
macro_rules! metrics_update {
    ( inc $metric:ident ) => {
        $crate::actors::prometheus_exporter::$metric.inc();
    };

    ( inc $metric:ident, $labels:expr) => {
        $crate::actors::prometheus_exporter::$metric
            .with_label_values($labels)
            .inc();
    };

    ( inc total $metric:ident, $labels:expr) => {
        $crate::actors::prometheus_exporter::$metric
            .with_label_values($labels)
            .inc();

        $crate::actors::prometheus_exporter::$metric
            .with_label_values(&["total"])
            .inc();
    };

    ( dec $metric:ident ) => {
        $crate::actors::prometheus_exporter::$metric.dec();
    };

    ( dec $metric:ident, $labels:expr) => {
        $crate::actors::prometheus_exporter::$metric
            .with_label_values($labels)
            .dec();
    };

    ( dec total $metric:ident, $labels:expr) => {
        $crate::actors::prometheus_exporter::$metric
            .with_label_values($labels)
            .dec();

        $crate::actors::prometheus_exporter::$metric
            .with_label_values(&["total"])
            .dec();
    };

    ( timer $metric:ident, $labels:expr) => {
        $crate::actors::prometheus_exporter::$metric
            .with_label_values($labels)
            .start_timer()
    };

    ( timer $metric:ident) => {
        $crate::actors::prometheus_exporter::$metric.start_timer()
    };

    ( timer observe $timer:ident) => {
        $timer.observe_duration()
    };

    ( timer discard $timer:ident) => {
        $timer.stop_and_discard()
    };
}

impl PrometheusExporter {
    fn new(bind_address: String) -> Self {
        PrometheusExporter { bind_address }
    }

    async fn start_server(&self) {
        let addr = match self.bind_address.parse() {
            Ok(addr) => addr,
            Err(err) => {
                error!(
                    "Invalid prometheus exporter bind address {}: {}",
                    self.bind_address, err
                );
                return;
            }
        };

        let exporter_join_handle = tokio::spawn(async move {
            info!("Prometheus exporter started on http://{}", addr);

            let serve_future = Server::bind(&addr).serve(make_service_fn(|_| async {
                Ok::<_, hyper::Error>(service_fn(|_req| async {
                    let encoder = TextEncoder::new();

                    let metric_families = REGISTRY.gather();
                    let mut buffer = vec![];

                    encoder.encode(&metric_families, &mut buffer).unwrap();

                    let response = Response::builder()
                        .status(200)
                        .header(CONTENT_TYPE, encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap();

                    Ok::<_, hyper::Error>(response)
                }))
            }));

            if let Err(err) = serve_future.await {
                error!("Server error: {}", err);
            }
        });

        if let Err(err) = exporter_join_handle.await {
            error!("Prometheus exporter has been killed: {}", err);
        }
    }

    async fn run(&mut self) {
        self.start_server().await;
    }
}

#[derive(Clone)]
pub struct PrometheusExporterHandle {}

impl PrometheusExporterHandle {
    /// No-op when the configuration carries no bind address.
    pub async fn new(register: &Register) -> Result<Self> {
        match register.config.get_prometheus_exporter_bind_address() {
            Some(bind_address) => {
                let mut prometheus_exporter = PrometheusExporter::new(bind_address);
                tokio::spawn(async move { prometheus_exporter.run().await });
            }
            None => {
                debug!("Prometheus exporter disabled: no bind address configured");
            }
        }

        Ok(Self {})
    }
}
