//! Readiness polling against the service's health endpoint.

use reqwest::Client;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

pub const HEALTH_PATH: &str = "/health";

/// Something that can tell whether a freshly spawned service answers.
///
/// `probe` must be safe to drop at any await point; the supervisor cancels it
/// by dropping the future when a stop arrives mid-probe.
#[async_trait::async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, addr: SocketAddr) -> bool;
}

/// Polls `GET /health` at a fixed interval until it answers 2xx or the
/// attempt budget runs out.
pub struct HttpProber {
    http: Client,
    interval: Duration,
    attempts: u32,
}

impl HttpProber {
    pub fn new(interval: Duration, attempts: u32) -> Self {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(interval)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            interval,
            attempts: attempts.max(1),
        }
    }

    /// Single health request; any transport error counts as "not yet".
    pub async fn check_once(&self, addr: SocketAddr) -> bool {
        let url = format!("http://{}{}", addr, HEALTH_PATH);
        match self.http.get(&url).timeout(self.interval).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::trace!("Health check on {} failed: {}", addr, e);
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for HttpProber {
    /// Requests go out on a fixed cadence and the whole probe is capped at
    /// `interval * attempts`, however long individual requests hang.
    async fn probe(&self, addr: SocketAddr) -> bool {
        let budget = self.interval * self.attempts;
        let mut ticks = tokio::time::interval(self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let polling = async {
            for attempt in 1..=self.attempts {
                ticks.tick().await;
                if self.check_once(addr).await {
                    tracing::info!("Service on {} ready after {} attempt(s)", addr, attempt);
                    return true;
                }
            }
            false
        };
        match tokio::time::timeout(budget, polling).await {
            Ok(true) => true,
            _ => {
                tracing::warn!(
                    "Service on {} not ready within {:?} ({} attempts)",
                    addr,
                    budget,
                    self.attempts
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server answering every request with `status`.
    async fn serve(status: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let body = r#"{"status":"healthy"}"#;
                    let resp = format!(
                        "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(resp.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn ready_service_passes() {
        let addr = serve("200 OK").await;
        let prober = HttpProber::new(Duration::from_millis(200), 5);
        assert!(prober.probe(addr).await);
    }

    #[tokio::test]
    async fn unhealthy_status_exhausts_budget() {
        let addr = serve("503 Service Unavailable").await;
        let prober = HttpProber::new(Duration::from_millis(20), 3);
        assert!(!prober.probe(addr).await);
    }

    #[tokio::test]
    async fn nothing_listening_gives_up() {
        let port = crate::port::allocate(0, 0).unwrap();
        let prober = HttpProber::new(Duration::from_millis(20), 3);
        let started = std::time::Instant::now();
        assert!(!prober.probe(crate::port::loopback(port)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn dropping_the_probe_cancels_it() {
        let port = crate::port::allocate(0, 0).unwrap();
        let prober = HttpProber::new(Duration::from_millis(50), 1_000);
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            prober.probe(crate::port::loopback(port)),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn hanging_health_endpoint_stays_within_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let prober = HttpProber::new(Duration::from_millis(200), 5);
        let started = std::time::Instant::now();
        assert!(!prober.probe(addr).await);
        let took = started.elapsed();
        assert!(took < Duration::from_millis(1_300), "took {:?}", took);
    }
}
