//! Batched, time-triggered asynchronous metrics shipper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::check::{Checker, Object};
use crate::http_client::HttpClient;
use crate::metrics::line_protocol;
use crate::metrics::point::{Point, Tags};
use crate::metrics::probe;
use crate::units::truncate_to_char_boundary;

/// Wait for `stop_rx` to report a stop signal without holding the
/// watch guard across the call; keeps the returned future `Send` when
/// combined with other branches in a `tokio::select!`.
async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) -> Result<(), watch::error::RecvError> {
    stop_rx.wait_for(|stopped| *stopped).await?;
    Ok(())
}

/// Points accumulated before a flush is forced.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Ingestion endpoint used when none is configured.
pub const DEFAULT_URI: &str = "http://localhost:8086";

/// Interval of the periodic flush.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Error response bodies are truncated to this size before logging; the
/// ingestion endpoint is known to echo entire payloads back.
const MAX_ERROR_BODY_SIZE: usize = 200;

/// Metrics pipeline errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Invalid or missing configuration value.
    #[error("{0}")]
    Config(String),

    /// The configured URI could not be parsed.
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] url::ParseError),
}

/// Metrics client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsCfg {
    #[serde(default)]
    pub uri: String,

    pub bucket: String,

    /// Only used by 2.x ingestion endpoints; optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,

    #[serde(default)]
    pub batch_size: usize,

    /// Tags merged under every point; empty values are never written.
    #[serde(default)]
    pub tags: HashMap<String, String>,

    #[serde(default)]
    pub log_requests: bool,
}

impl Object for MetricsCfg {
    fn check(&self, c: &mut Checker) {
        c.check_string_uri("uri", &self.uri);
        c.check_string_not_empty("bucket", &self.bucket);

        if self.batch_size != 0 {
            c.check_int_min("batch_size", self.batch_size as i64, 1);
        }

        c.with_child("tags", |c| {
            for (name, value) in &self.tags {
                c.check_string_not_empty(name.clone(), value);
            }
        });
    }
}

/// Cloneable handle to the metrics pipeline.
///
/// All point submission goes through the ingress channel; the batch buffer
/// is owned by the worker task.
#[derive(Clone)]
pub struct MetricsClient {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: MetricsCfg,
    base_tags: Tags,
    write_url: Url,
    http: Arc<HttpClient>,

    points_tx: Mutex<Option<mpsc::Sender<Vec<Point>>>>,
    points_rx: Mutex<Option<mpsc::Receiver<Vec<Point>>>>,

    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MetricsClient {
    /// Build a client from its configuration, the HTTP client reserved for
    /// the ingestion endpoint, and the local hostname.
    pub fn new(
        mut cfg: MetricsCfg,
        http: Arc<HttpClient>,
        hostname: &str,
    ) -> Result<Self, MetricsError> {
        if cfg.uri.is_empty() {
            cfg.uri = DEFAULT_URI.to_string();
        }

        if cfg.bucket.is_empty() {
            return Err(MetricsError::Config("missing or empty bucket".to_string()));
        }

        if cfg.batch_size == 0 {
            cfg.batch_size = DEFAULT_BATCH_SIZE;
        }

        let mut write_url = Url::parse(&cfg.uri)?;
        {
            let path = format!("{}/api/v2/write", write_url.path().trim_end_matches('/'));
            write_url.set_path(&path);

            let mut query = write_url.query_pairs_mut();
            query.append_pair("bucket", &cfg.bucket);
            if let Some(org) = &cfg.org {
                query.append_pair("org", org);
            }
        }

        let mut base_tags = Tags::new();
        if !hostname.is_empty() {
            base_tags.insert("host".to_string(), hostname.to_string());
        }
        for (name, value) in &cfg.tags {
            base_tags.insert(name.clone(), value.clone());
        }

        let (points_tx, points_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                base_tags,
                write_url,
                http,
                points_tx: Mutex::new(Some(points_tx)),
                points_rx: Mutex::new(Some(points_rx)),
                stop_tx,
                stop_rx,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the worker and the self-probe tasks.
    pub fn start(&self) {
        let points_rx = self
            .inner
            .points_rx
            .lock()
            .expect("points channel lock poisoned")
            .take()
            .expect("metrics client already started");

        let worker = Worker {
            batch_size: self.inner.cfg.batch_size,
            base_tags: self.inner.base_tags.clone(),
            write_url: self.inner.write_url.clone(),
            http: Arc::clone(&self.inner.http),
            buffer: Vec::new(),
        };

        let worker_task = tokio::spawn(worker.run(points_rx, self.inner.stop_rx.clone()));
        let probe_task = tokio::spawn(probe::run(self.clone(), self.inner.stop_rx.clone()));

        let mut tasks = self.inner.tasks.lock().expect("task lock poisoned");
        tasks.push(worker_task);
        tasks.push(probe_task);
    }

    /// Submit one point.
    pub async fn enqueue_point(&self, point: Point) {
        self.enqueue_points(vec![point]).await;
    }

    /// Submit a batch of points.
    ///
    /// Never blocks while the client is stopping: the submission selects
    /// between the ingress channel and stop detection, dropping the points
    /// silently in the latter case.
    pub async fn enqueue_points(&self, points: Vec<Point>) {
        let Some(points_tx) = self
            .inner
            .points_tx
            .lock()
            .expect("points channel lock poisoned")
            .clone()
        else {
            return;
        };

        let mut stop_rx = self.inner.stop_rx.clone();

        tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => {}
            _ = points_tx.send(points) => {}
        }
    }

    /// Signal the worker to stop and wait for the final flush.
    pub async fn stop(&self) {
        let _ = self.inner.stop_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().expect("task lock poisoned");
            tasks.drain(..).collect()
        };

        for task in tasks {
            let _ = task.await;
        }
    }

    /// Close the ingress channel.
    pub fn terminate(&self) {
        self.inner
            .points_tx
            .lock()
            .expect("points channel lock poisoned")
            .take();
    }
}

/// Worker state; owned by the worker task.
struct Worker {
    batch_size: usize,
    base_tags: Tags,
    write_url: Url,
    http: Arc<HttpClient>,
    buffer: Vec<Point>,
}

impl Worker {
    async fn run(
        mut self,
        mut points_rx: mpsc::Receiver<Vec<Point>>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wait_for_stop(&mut stop_rx) => {
                    // Points already queued on the ingress belong to this
                    // run; fold them into the one final flush.
                    while let Ok(points) = points_rx.try_recv() {
                        self.buffer_points(points);
                    }

                    self.flush().await;
                    return;
                }

                received = points_rx.recv() => match received {
                    Some(points) => self.enqueue_points(points).await,
                    None => {
                        self.flush().await;
                        return;
                    }
                },

                _ = ticker.tick() => self.flush().await,
            }
        }
    }

    async fn enqueue_points(&mut self, points: Vec<Point>) {
        self.buffer_points(points);

        if self.buffer.len() >= self.batch_size {
            self.flush().await;
        }
    }

    fn buffer_points(&mut self, points: Vec<Point>) {
        for mut point in points {
            self.finalize_point(&mut point);
            self.buffer.push(point);
        }
    }

    /// Merge the base tags under the point tags; empty values are dropped,
    /// point tags win on collision.
    fn finalize_point(&self, point: &mut Point) {
        let mut tags = Tags::new();

        for (key, value) in &self.base_tags {
            if !value.is_empty() {
                tags.insert(key.clone(), value.clone());
            }
        }

        for (key, value) in &point.tags {
            if !value.is_empty() {
                tags.insert(key.clone(), value.clone());
            }
        }

        point.tags = tags;
    }

    /// Ship the buffered points; on failure the buffer is retained for the
    /// next attempt.
    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        match self.send_points().await {
            Ok(()) => self.buffer.clear(),
            Err(err) => tracing::error!("cannot send points: {err}"),
        }
    }

    async fn send_points(&self) -> Result<(), String> {
        let mut body = String::new();
        line_protocol::encode_points(self.buffer.iter(), &mut body);

        let request = self
            .http
            .request(Method::POST, self.write_url.clone())
            .body(body)
            .build()
            .map_err(|err| format!("cannot create request: {err}"))?;

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|err| format!("cannot send request: {err}"))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = match response.text().await {
                Ok(body) => body,
                Err(err) => {
                    tracing::error!("cannot read response body: {err}");
                    String::new()
                }
            };

            if body.len() > MAX_ERROR_BODY_SIZE {
                truncate_to_char_boundary(&mut body, MAX_ERROR_BODY_SIZE);
                body.push_str(" [truncated]");
            }

            let detail = if body.is_empty() {
                String::new()
            } else {
                format!(" ({body})")
            };

            return Err(format!(
                "request failed with status {}{detail}",
                status.as_u16()
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::point::Fields;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::routing::post;
    use axum::Router;

    struct Sink {
        requests: AtomicUsize,
        bodies: Mutex<Vec<String>>,
    }

    async fn start_sink() -> (String, Arc<Sink>) {
        let sink = Arc::new(Sink {
            requests: AtomicUsize::new(0),
            bodies: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route(
                "/api/v2/write",
                post(|State(sink): State<Arc<Sink>>, body: String| async move {
                    sink.requests.fetch_add(1, Ordering::SeqCst);
                    sink.bodies.lock().unwrap().push(body);
                    axum::http::StatusCode::NO_CONTENT
                }),
            )
            .with_state(Arc::clone(&sink));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), sink)
    }

    fn test_client(uri: &str, batch_size: usize) -> MetricsClient {
        let cfg = MetricsCfg {
            uri: uri.to_string(),
            bucket: "main".to_string(),
            batch_size,
            ..Default::default()
        };

        let http = Arc::new(HttpClient::new(Default::default()).unwrap());
        MetricsClient::new(cfg, http, "testhost").unwrap()
    }

    fn test_point(name: &str) -> Point {
        Point::new(name, Tags::new(), Fields::from([("a".into(), 1i64.into())]))
    }

    async fn wait_for_requests(sink: &Sink, expected: usize, budget: Duration) {
        let deadline = tokio::time::Instant::now() + budget;
        while sink.requests.load(Ordering::SeqCst) < expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {expected} requests, got {}",
                sink.requests.load(Ordering::SeqCst)
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_cfg_check() {
        let cfg = MetricsCfg {
            uri: "http://localhost:8086".to_string(),
            bucket: "main".to_string(),
            ..Default::default()
        };

        let mut c = Checker::new();
        cfg.check(&mut c);
        assert!(c.errors().is_empty());

        let cfg = MetricsCfg::default();
        let mut c = Checker::new();
        cfg.check(&mut c);

        let codes: Vec<&str> = c.errors().iter().map(|e| e.code.as_str()).collect();
        assert!(codes.contains(&"empty_uri"));
        assert!(codes.contains(&"empty_string"));
    }

    #[test]
    fn test_missing_bucket() {
        let http = Arc::new(HttpClient::new(Default::default()).unwrap());
        let result = MetricsClient::new(MetricsCfg::default(), http, "h");
        assert!(matches!(result, Err(MetricsError::Config(_))));
    }

    #[test]
    fn test_write_url() {
        let client = test_client("http://localhost:8086", 10);
        assert_eq!(
            client.inner.write_url.as_str(),
            "http://localhost:8086/api/v2/write?bucket=main"
        );
    }

    #[tokio::test]
    async fn test_batch_size_triggers_flush() {
        let (uri, sink) = start_sink().await;
        let client = test_client(&uri, 3);
        client.start();

        for i in 0..3 {
            client.enqueue_point(test_point(&format!("m{i}"))).await;
        }

        // The flush must be batch-triggered, well before the 1 s tick.
        wait_for_requests(&sink, 1, Duration::from_millis(500)).await;
        assert_eq!(sink.requests.load(Ordering::SeqCst), 1);

        let bodies = sink.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].lines().count(), 3);
        assert!(bodies[0].starts_with("m0,host=testhost a=1i\n"));

        drop(bodies);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_on_tick() {
        let (uri, sink) = start_sink().await;
        let client = test_client(&uri, 100);
        client.start();

        client.enqueue_point(test_point("m1")).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.requests.load(Ordering::SeqCst), 0);

        wait_for_requests(&sink, 1, Duration::from_secs(2)).await;

        client.stop().await;
    }

    #[tokio::test]
    async fn test_stop_flushes_once_and_enqueue_does_not_block() {
        let (uri, sink) = start_sink().await;
        let client = test_client(&uri, 100);
        client.start();

        client.enqueue_point(test_point("m1")).await;
        client.stop().await;

        assert_eq!(sink.requests.load(Ordering::SeqCst), 1);

        // Submissions after stop return immediately and are dropped.
        tokio::time::timeout(Duration::from_millis(100), client.enqueue_point(test_point("m2")))
            .await
            .expect("enqueue blocked during stop");

        client.terminate();
        assert_eq!(sink.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_base_tags_merge() {
        let (uri, sink) = start_sink().await;

        let cfg = MetricsCfg {
            uri,
            bucket: "main".to_string(),
            batch_size: 1,
            tags: HashMap::from([
                ("env".to_string(), "prod".to_string()),
                ("empty".to_string(), String::new()),
            ]),
            ..Default::default()
        };

        let http = Arc::new(HttpClient::new(Default::default()).unwrap());
        let client = MetricsClient::new(cfg, http, "testhost").unwrap();
        client.start();

        // The point tag wins over the base tag of the same name.
        let point = Point::new(
            "m",
            Tags::from([("env".into(), "dev".into())]),
            Fields::from([("a".into(), 1i64.into())]),
        );
        client.enqueue_point(point).await;

        wait_for_requests(&sink, 1, Duration::from_millis(500)).await;

        let bodies = sink.bodies.lock().unwrap();
        assert_eq!(bodies[0], "m,env=dev,host=testhost a=1i\n");

        drop(bodies);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_failed_flush_retains_buffer() {
        // No listener: every flush attempt fails.
        let client = test_client("http://127.0.0.1:1", 1);
        client.start();

        client.enqueue_point(test_point("m1")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        client.stop().await;

        // The buffer survived the failed attempts.
        // (Nothing to assert against a sink; the invariant is that stop did
        // not panic and the worker exited with the points still retained.)
    }
}
