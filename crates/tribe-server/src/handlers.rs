//! HTTP handlers for the Tribecast server.
//!
//! Each SSE request is one broker listener; the listener leaves the broker
//! when the response stream is dropped.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tribecast_core::{Broker, GroupKey, ListenerChannel};

/// Interval between broker statistics samples.
const STATS_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The event broker.
    pub broker: Broker,
    /// Server configuration.
    pub config: Config,
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.events_path, get(events_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Run the HTTP server until Ctrl-C, then shut the broker down.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, broker: Broker) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => spawn_stats_sampler(broker.clone()),
            Err(e) => error!("Failed to start metrics server: {:#}", e),
        }
    }

    let state = Arc::new(AppState {
        broker: broker.clone(),
        config: config.clone(),
    });

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Tribecast server listening on {}", addr);
    info!(
        "SSE endpoint: http://{}{}?user=<user>&tribe=<tribe>",
        addr, config.transport.events_path
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(broker.clone()))
        .await?;

    // Catch listeners that joined while the signal was being handled.
    broker.shutdown().await;
    info!("Tribecast server stopped");

    Ok(())
}

/// Resolves on Ctrl-C after closing every listener, so open SSE streams end
/// and graceful shutdown can complete.
async fn shutdown_signal(broker: Broker) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    broker.shutdown().await;
}

fn spawn_stats_sampler(broker: Broker) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_SAMPLE_INTERVAL);
        loop {
            interval.tick().await;
            metrics::record_broker_stats(&broker.stats());
        }
    });
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Broker statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.broker.stats())
}

/// Query of the events endpoint.
#[derive(Debug, Deserialize)]
struct EventsQuery {
    user: String,
    tribe: GroupKey,
}

/// A listener owned by one SSE response.
struct SseSession {
    broker: Broker,
    listener: ListenerChannel,
    _metrics: ConnectionMetricsGuard,
}

impl Drop for SseSession {
    fn drop(&mut self) {
        self.broker.leave(self.listener.id());
        debug!(
            listener = %self.listener.id(),
            user = %self.listener.user(),
            group = self.listener.group(),
            "SSE stream closed"
        );
    }
}

/// Server-sent events handler.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    if query.user.is_empty() {
        return (StatusCode::BAD_REQUEST, "user must not be empty").into_response();
    }

    let listener = state.broker.join(query.user, query.tribe);
    debug!(
        listener = %listener.id(),
        user = %listener.user(),
        group = listener.group(),
        "SSE stream opened"
    );

    let session = SseSession {
        broker: state.broker.clone(),
        listener,
        _metrics: ConnectionMetricsGuard::new(),
    };

    let events = stream::unfold(session, |mut session| async move {
        let event = session.listener.recv().await?;
        metrics::record_event(event.data_len());
        let frame = SseEvent::default().data(event.data());
        Some((Ok::<_, Infallible>(frame), session))
    });

    let keep_alive = Duration::from_secs(state.config.transport.keep_alive_secs.max(1));
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(keep_alive))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout, Instant};
    use tribe_protocol::{codec, PresenceUpdate, Record};
    use tribecast_core::{Event, MemoryUpstream};

    const WAIT: Duration = Duration::from_secs(2);

    async fn spawn_app(broker: Broker) -> SocketAddr {
        let mut config = Config::default();
        config.transport.keep_alive_secs = 1;
        let state = Arc::new(AppState { broker, config });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(state)).await.unwrap();
        });
        addr
    }

    async fn request(addr: SocketAddr, path: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        stream
    }

    async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
        let mut received = Vec::new();
        let deadline = Instant::now() + WAIT;
        loop {
            let text = String::from_utf8_lossy(&received).into_owned();
            if text.contains(needle) {
                return text;
            }
            let mut chunk = [0u8; 1024];
            let n = timeout(deadline.saturating_duration_since(Instant::now()), stream.read(&mut chunk))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, got {text:?}"))
                .unwrap();
            assert!(n > 0, "connection closed before {needle:?}, got {text:?}");
            received.extend_from_slice(&chunk[..n]);
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_health() {
        let broker = Broker::new(Arc::new(MemoryUpstream::new()));
        let addr = spawn_app(broker).await;

        let mut stream = request(addr, "/health").await;
        let response = read_until(&mut stream, "\"status\":\"ok\"").await;
        assert!(response.starts_with("HTTP/1.1 200"));
    }

    #[tokio::test]
    async fn test_sse_receives_group_events() {
        let broker = Broker::new(Arc::new(MemoryUpstream::new()));
        let addr = spawn_app(broker.clone()).await;

        let mut stream = request(addr, "/s/events?user=player-1&tribe=7").await;
        let headers = read_until(&mut stream, "\r\n\r\n").await;
        assert!(headers.starts_with("HTTP/1.1 200"));
        assert!(headers.contains("text/event-stream"));

        wait_until(|| broker.group_listener_count(7) == 1).await;
        broker
            .send_to_group(7, Event::new(r#"{"hello":1}"#))
            .await
            .unwrap();
        read_until(&mut stream, "data: {\"hello\":1}").await;
    }

    #[tokio::test]
    async fn test_sse_streams_upstream_records() {
        let upstream = Arc::new(MemoryUpstream::new());
        let broker = Broker::new(upstream.clone());
        let addr = spawn_app(broker.clone()).await;

        let mut stream = request(addr, "/s/events?user=player-1&tribe=42").await;
        read_until(&mut stream, "\r\n\r\n").await;
        wait_until(|| upstream.subscriber_count("tribemsg:42") == 1).await;

        let record = Record::PresenceUpdate(PresenceUpdate {
            player_id: 9,
            last_online_at: 1_700_000_000,
        });
        upstream.publish("tribemsg:42", codec::encode(&record, 1, 0));
        read_until(&mut stream, r#"data: {"PlayerID":9,"LastOnlineAt":1700000000}"#).await;
    }

    #[tokio::test]
    async fn test_disconnect_leaves_broker() {
        let broker = Broker::new(Arc::new(MemoryUpstream::new()));
        let addr = spawn_app(broker.clone()).await;

        let mut stream = request(addr, "/s/events?user=player-1&tribe=7").await;
        read_until(&mut stream, "\r\n\r\n").await;
        wait_until(|| broker.group_listener_count(7) == 1).await;
        drop(stream);

        let deadline = Instant::now() + WAIT;
        while broker.group_listener_count(7) != 0 {
            assert!(Instant::now() < deadline, "listener never left");
            // Writes to the dead socket surface the disconnect.
            let _ = broker.send_to_group(7, Event::new("ping")).await;
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_bad_query_rejected() {
        let broker = Broker::new(Arc::new(MemoryUpstream::new()));
        let addr = spawn_app(broker.clone()).await;

        let mut stream = request(addr, "/s/events?tribe=7").await;
        let response = read_until(&mut stream, "\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400"));

        let mut stream = request(addr, "/s/events?user=&tribe=7").await;
        let response = read_until(&mut stream, "\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400"));

        let mut stream = request(addr, "/s/events?user=a&tribe=abc").await;
        let response = read_until(&mut stream, "\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400"));

        assert_eq!(broker.stats().listeners, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let broker = Broker::new(Arc::new(MemoryUpstream::new()));
        let _listener = broker.join("player-1", 7);
        let addr = spawn_app(broker).await;

        let mut stream = request(addr, "/stats").await;
        let response = read_until(&mut stream, "\"active_subscriptions\":1").await;
        assert!(response.contains("\"listeners\":1"));
    }
}
