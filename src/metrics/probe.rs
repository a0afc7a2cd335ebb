//! Process self-probe.
//!
//! Emits two points every second — thread count and memory statistics read
//! from `/proc/self` — so a daemon reports baseline runtime health even when
//! the application submits no points of its own.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::metrics::client::MetricsClient;
use crate::metrics::point::{Fields, Point, Tags};

const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Memory page size on every platform the harness targets.
const PAGE_SIZE: u64 = 4096;

/// Wait for `stop_rx` to report a stop signal without holding the
/// watch guard across the call; keeps the returned future `Send` when
/// combined with other branches in a `tokio::select!`.
async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) -> Result<(), watch::error::RecvError> {
    stop_rx.wait_for(|stopped| *stopped).await?;
    Ok(())
}

pub(super) async fn run(client: MetricsClient, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = wait_for_stop(&mut stop_rx) => return,

            _ = ticker.tick() => {
                let points: Vec<Point> =
                    [thread_point(), memory_point()].into_iter().flatten().collect();

                if !points.is_empty() {
                    client.enqueue_points(points).await;
                }
            }
        }
    }
}

/// `process_threads{count}` from `/proc/self/stat`.
fn thread_point() -> Option<Point> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;

    // The comm field is parenthesized and may contain spaces; fields are
    // counted from after the closing parenthesis. num_threads is field 20
    // of the full record, i.e. the 18th after comm.
    let rest = stat.rsplit_once(')')?.1;
    let threads: i64 = rest.split_whitespace().nth(17)?.parse().ok()?;

    let fields = Fields::from([("count".to_string(), threads.into())]);

    Some(Point::with_timestamp("process_threads", Tags::new(), fields, Utc::now()))
}

/// `process_memory{...}` from `/proc/self/statm`.
fn memory_point() -> Option<Point> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;

    let mut pages = statm.split_whitespace().map(|f| f.parse::<u64>().ok());

    let vm_size = pages.next()??;
    let resident = pages.next()??;
    let shared = pages.next()??;
    let text = pages.next()??;
    let _lib = pages.next()??;
    let data = pages.next()??;

    let fields = Fields::from([
        ("vm_size".to_string(), (vm_size * PAGE_SIZE).into()),
        ("resident".to_string(), (resident * PAGE_SIZE).into()),
        ("shared".to_string(), (shared * PAGE_SIZE).into()),
        ("text".to_string(), (text * PAGE_SIZE).into()),
        ("data".to_string(), (data * PAGE_SIZE).into()),
    ]);

    Some(Point::with_timestamp("process_memory", Tags::new(), fields, Utc::now()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_probe_points() {
        let point = thread_point().expect("no thread point");
        assert_eq!(point.measurement, "process_threads");
        assert!(matches!(
            point.fields.get("count"),
            Some(crate::metrics::FieldValue::Integer(n)) if *n >= 1
        ));

        let point = memory_point().expect("no memory point");
        assert_eq!(point.measurement, "process_memory");
        assert!(point.fields.contains_key("resident"));
        assert!(point.timestamp.is_some());
    }
}
