//! Individual health checks and the HTTP probe runner.
//!
//! The production runner performs HTTP probes against agent endpoints
//! with a manual http1 handshake, mirroring how instances expose
//! `/healthz`, `/readyz`, and `/stats`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use cutover_state::{CheckStatus, HealthCheck, epoch_secs};

/// One check in the fixed battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    ApiReachability,
    DependencyConnectivity,
    ResourceSaturation,
    ErrorRate,
}

impl CheckKind {
    /// The fixed battery executed on every probe invocation.
    pub const BATTERY: [CheckKind; 4] = [
        CheckKind::ApiReachability,
        CheckKind::DependencyConnectivity,
        CheckKind::ResourceSaturation,
        CheckKind::ErrorRate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ApiReachability => "api_reachability",
            Self::DependencyConnectivity => "dependency_connectivity",
            Self::ResourceSaturation => "resource_saturation",
            Self::ErrorRate => "error_rate",
        }
    }

    fn endpoint(&self) -> &'static str {
        match self {
            Self::ApiReachability => "/healthz",
            Self::DependencyConnectivity => "/readyz",
            Self::ResourceSaturation | Self::ErrorRate => "/stats",
        }
    }
}

/// Errors a check runner can produce.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("malformed stats payload: {0}")]
    Malformed(String),

    #[error("agent address unknown: {0}")]
    UnknownAgent(String),
}

impl ProbeError {
    /// Transient errors (network blips) get a bounded retry before being
    /// treated as a check failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Request(_))
    }
}

pub type CheckFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HealthCheck, ProbeError>> + Send + 'a>>;

/// Executes a single named check against a single agent.
///
/// Boxed-future trait so the prober and executor can hold it as a
/// trait object; tests substitute scripted runners.
pub trait CheckRunner: Send + Sync {
    fn run<'a>(&'a self, agent_id: &'a str, check: CheckKind) -> CheckFuture<'a>;
}

/// Production runner: HTTP probes against agent instance endpoints.
pub struct HttpCheckRunner {
    /// agent_id → `ip:port` of the instance to probe.
    addresses: HashMap<String, String>,
}

impl HttpCheckRunner {
    pub fn new(addresses: HashMap<String, String>) -> Self {
        Self { addresses }
    }
}

impl CheckRunner for HttpCheckRunner {
    fn run<'a>(&'a self, agent_id: &'a str, check: CheckKind) -> CheckFuture<'a> {
        Box::pin(async move {
            let address = self
                .addresses
                .get(agent_id)
                .ok_or_else(|| ProbeError::UnknownAgent(agent_id.to_string()))?;
            let (status, body, elapsed_ms) = http_get(address, check.endpoint()).await?;
            Ok(evaluate(check, status, &body, elapsed_ms))
        })
    }
}

/// Turn an HTTP response into a check verdict.
fn evaluate(check: CheckKind, status: http::StatusCode, body: &[u8], elapsed_ms: f64) -> HealthCheck {
    let mut metrics = HashMap::new();
    metrics.insert("response_time_ms".to_string(), elapsed_ms);

    let (verdict, message) = match check {
        CheckKind::ApiReachability | CheckKind::DependencyConnectivity => {
            if status.is_success() {
                (CheckStatus::Pass, "ok".to_string())
            } else {
                (CheckStatus::Fail, format!("endpoint returned {status}"))
            }
        }
        CheckKind::ResourceSaturation => match parse_stats(body) {
            Ok(stats) => {
                let cpu = stats.get("cpu_pct").copied().unwrap_or(0.0);
                let mem = stats.get("mem_pct").copied().unwrap_or(0.0);
                metrics.insert("cpu_pct".to_string(), cpu);
                metrics.insert("mem_pct".to_string(), mem);
                let worst = cpu.max(mem);
                if worst > 95.0 {
                    (CheckStatus::Fail, format!("saturation at {worst:.0}%"))
                } else if worst > 80.0 {
                    (CheckStatus::Warn, format!("saturation at {worst:.0}%"))
                } else {
                    (CheckStatus::Pass, "ok".to_string())
                }
            }
            Err(e) => (CheckStatus::Fail, e.to_string()),
        },
        CheckKind::ErrorRate => match parse_stats(body) {
            Ok(stats) => {
                let rate = stats.get("error_rate_pct").copied().unwrap_or(0.0);
                metrics.insert("error_rate_pct".to_string(), rate);
                if rate > 5.0 {
                    (CheckStatus::Fail, format!("error rate {rate:.1}%"))
                } else if rate > 1.0 {
                    (CheckStatus::Warn, format!("error rate {rate:.1}%"))
                } else {
                    (CheckStatus::Pass, "ok".to_string())
                }
            }
            Err(e) => (CheckStatus::Fail, e.to_string()),
        },
    };

    HealthCheck {
        name: check.name().to_string(),
        status: verdict,
        message,
        metrics,
        checked_at: epoch_secs(),
    }
}

fn parse_stats(body: &[u8]) -> Result<HashMap<String, f64>, ProbeError> {
    serde_json::from_slice(body).map_err(|e| ProbeError::Malformed(e.to_string()))
}

/// Perform one HTTP GET and return status, body, and elapsed milliseconds.
async fn http_get(
    address: &str,
    path: &str,
) -> Result<(http::StatusCode, bytes::Bytes, f64), ProbeError> {
    use http_body_util::BodyExt;

    let uri = format!("http://{address}{path}");
    let started = Instant::now();

    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| {
            debug!(error = %e, %uri, "probe connection failed");
            ProbeError::Connect(e.to_string())
        })?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProbeError::Connect(e.to_string()))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(&uri)
        .header("host", address)
        .header("user-agent", "cutover-health/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| ProbeError::Request(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ProbeError::Request(e.to_string()))?;

    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ProbeError::Request(e.to_string()))?
        .to_bytes();

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    Ok((status, body, elapsed_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_has_fixed_order_and_names() {
        let names: Vec<&str> = CheckKind::BATTERY.iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec![
                "api_reachability",
                "dependency_connectivity",
                "resource_saturation",
                "error_rate",
            ]
        );
    }

    #[test]
    fn reachability_pass_and_fail_on_status() {
        let ok = evaluate(CheckKind::ApiReachability, http::StatusCode::OK, b"", 12.0);
        assert_eq!(ok.status, CheckStatus::Pass);
        assert_eq!(ok.metrics["response_time_ms"], 12.0);

        let bad = evaluate(
            CheckKind::ApiReachability,
            http::StatusCode::SERVICE_UNAVAILABLE,
            b"",
            12.0,
        );
        assert_eq!(bad.status, CheckStatus::Fail);
    }

    #[test]
    fn error_rate_thresholds() {
        let pass = evaluate(
            CheckKind::ErrorRate,
            http::StatusCode::OK,
            br#"{"error_rate_pct": 0.2}"#,
            5.0,
        );
        assert_eq!(pass.status, CheckStatus::Pass);

        let warn = evaluate(
            CheckKind::ErrorRate,
            http::StatusCode::OK,
            br#"{"error_rate_pct": 2.5}"#,
            5.0,
        );
        assert_eq!(warn.status, CheckStatus::Warn);

        let fail = evaluate(
            CheckKind::ErrorRate,
            http::StatusCode::OK,
            br#"{"error_rate_pct": 8.0}"#,
            5.0,
        );
        assert_eq!(fail.status, CheckStatus::Fail);
        assert_eq!(fail.metrics["error_rate_pct"], 8.0);
    }

    #[test]
    fn saturation_thresholds() {
        let warn = evaluate(
            CheckKind::ResourceSaturation,
            http::StatusCode::OK,
            br#"{"cpu_pct": 85.0, "mem_pct": 40.0}"#,
            5.0,
        );
        assert_eq!(warn.status, CheckStatus::Warn);

        let fail = evaluate(
            CheckKind::ResourceSaturation,
            http::StatusCode::OK,
            br#"{"cpu_pct": 10.0, "mem_pct": 97.0}"#,
            5.0,
        );
        assert_eq!(fail.status, CheckStatus::Fail);
    }

    #[test]
    fn malformed_stats_is_a_fail_not_a_skip() {
        let check = evaluate(
            CheckKind::ErrorRate,
            http::StatusCode::OK,
            b"not json",
            5.0,
        );
        assert_eq!(check.status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn probe_to_closed_port_is_transient_connect_error() {
        let runner = HttpCheckRunner::new(HashMap::from([(
            "agent-1".to_string(),
            "127.0.0.1:1".to_string(),
        )]));
        let err = runner
            .run("agent-1", CheckKind::ApiReachability)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unknown_agent_is_not_transient() {
        let runner = HttpCheckRunner::new(HashMap::new());
        let err = runner
            .run("agent-9", CheckKind::ApiReachability)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
