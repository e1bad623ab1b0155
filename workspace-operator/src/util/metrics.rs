use http_body_util::Full;
use hyper::{Request, Response, body::Bytes, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use owo_colors::OwoColorize;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder};

/// Per-controller counters and latency histograms, registered on the default
/// registry and served by [`run_metrics_server`].
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
    pub action_counter: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = IntCounterVec::new(
            Opts::new(
                format!("{controller}_reconcile_total"),
                "Total number of reconcile invocations",
            ),
            &["name", "namespace"],
        )
        .expect("build reconcile counter");
        let read_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("{controller}_read_phase_seconds"),
                "Latency of the read phase of reconciliation",
            ),
            &["name", "namespace", "action"],
        )
        .expect("build read histogram");
        let write_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("{controller}_write_phase_seconds"),
                "Latency of the write phase of reconciliation",
            ),
            &["name", "namespace", "action"],
        )
        .expect("build write histogram");
        let action_counter = IntCounterVec::new(
            Opts::new(
                format!("{controller}_action_total"),
                "Reconcile outcomes by action",
            ),
            &["name", "namespace", "action"],
        )
        .expect("build action counter");

        let registry = prometheus::default_registry();
        registry
            .register(Box::new(reconcile_counter.clone()))
            .expect("register reconcile counter");
        registry
            .register(Box::new(read_histogram.clone()))
            .expect("register read histogram");
        registry
            .register(Box::new(write_histogram.clone()))
            .expect("register write histogram");
        registry
            .register(Box::new(action_counter.clone()))
            .expect("register action counter");

        ControllerMetrics {
            reconcile_counter,
            read_histogram,
            write_histogram,
            action_counter,
        }
    }
}

/// Serves `/metrics`, `/healthz` and `/readyz` on the given port.
pub async fn run_metrics_server(port: u16) {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .expect("bind metrics listener");
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("metrics accept failed: {e}");
                continue;
            }
        };
        tokio::spawn(async move {
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                let response = match req.uri().path() {
                    "/metrics" => {
                        let mut buf = Vec::new();
                        let encoder = TextEncoder::new();
                        if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
                            eprintln!("metrics encode failed: {e}");
                        }
                        Response::new(Full::new(Bytes::from(buf)))
                    }
                    "/healthz" | "/readyz" => Response::new(Full::new(Bytes::from_static(b"ok"))),
                    _ => Response::builder()
                        .status(404)
                        .body(Full::new(Bytes::from_static(b"not found")))
                        .unwrap(),
                };
                Ok::<_, std::convert::Infallible>(response)
            });
            let io = TokioIo::new(stream);
            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                eprintln!("metrics connection error: {e}");
            }
        });
    }
}
