//! HTTP surface of the distributor agent.
//!
//! The orchestration layer reaches the engine through these routes:
//!
//! | Method | Path | Success |
//! |--------|------|---------|
//! | POST | `/plug/vip/:vip` | 202 with the distributor identity |
//! | POST | `/unplug/vip/:vip` | 202 |
//! | POST | `/register/vip/:vip` | 200 with `{slot}` |
//! | POST | `/unregister/vip/:vip` | 200 with `{slot}` |
//! | GET | `/status`, `/status/:lb_id` | 200 with status reports |
//! | GET | `/state/:lb_id` | 200 with the slot table |
//! | PUT | `/state/:lb_id` | 204 |
//! | GET | `/info`, `/diagnostics` | 200 |
//!
//! Failures map by kind: usage 400, unknown load balancer 404, limit 409,
//! instance 500, fatal 503.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use fleetlb_core::{AmphoraId, LoadBalancerId};

use crate::distributor::SlotTable;
use crate::engine::{
    BootStatus, DistributorEngine, DistributorInfo, PlugVipRequest, RegisterRequest,
    StatusReport, UnregisterRequest, ACTIVE_ACTIVE_ALGORITHM,
};
use crate::error::{Error, ErrorKind};

/// Body of `POST /plug/vip/:vip`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlugVipBody {
    /// VIP subnet.
    pub subnet_cidr: String,
    /// VIP subnet gateway.
    pub gateway: Option<IpAddr>,
    /// MAC of the host interface facing the VIP network.
    pub mac_address: String,
    /// Load balancer.
    pub lb_id: LoadBalancerId,
    /// Cluster algorithm tag.
    pub cluster_alg_type: String,
    /// Slot count.
    pub cluster_min_size: u32,
}

/// Body of `POST /unplug/vip/:vip`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnplugVipBody {
    /// Load balancer.
    pub lb_id: LoadBalancerId,
}

/// Body of `POST /register/vip/:vip`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBody {
    /// VIP subnet.
    pub subnet_cidr: String,
    /// VIP subnet gateway.
    pub gateway: Option<IpAddr>,
    /// Load balancer.
    pub lb_id: LoadBalancerId,
    /// Amphora to bind.
    pub amphora_id: AmphoraId,
    /// Amphora MAC.
    pub amphora_mac: String,
    /// Cluster algorithm tag.
    pub cluster_alg_type: String,
    /// Specific slot to bind.
    #[serde(default)]
    pub cluster_slot: Option<u32>,
}

/// Body of `POST /unregister/vip/:vip`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterBody {
    /// VIP subnet.
    pub subnet_cidr: String,
    /// VIP subnet gateway.
    pub gateway: Option<IpAddr>,
    /// Load balancer.
    pub lb_id: LoadBalancerId,
    /// Amphora to unbind.
    pub amphora_id: AmphoraId,
    /// Cluster algorithm tag.
    pub cluster_alg_type: String,
}

/// Response carrying a slot number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotResponse {
    /// Slot number.
    pub slot: u32,
}

/// Response of `GET /info`.
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    /// Agent version.
    pub version: &'static str,
    /// Engine boot state.
    pub boot: BootStatus,
    /// Cached distributors.
    pub distributors: usize,
}

/// Response of `GET /diagnostics`.
#[derive(Debug, Serialize)]
pub struct DiagnosticsResponse {
    /// Engine boot state.
    pub boot: BootStatus,
    /// Configured distributor ceiling.
    pub max_distributors: usize,
    /// Configured slot ceiling.
    pub max_cluster_size: u32,
    /// Distributor count at which the engine reports FULL.
    pub soft_capacity: usize,
    /// OpenFlow protocol in use.
    pub openflow_protocol: String,
    /// Status of every distributor.
    pub distributors: Vec<StatusReport>,
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// HTTP error with a stable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Returns an error response for invalid input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST",
            message: message.into(),
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let (status, code) = match (&err, err.kind()) {
            (Error::NotFound { .. }, _) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            (_, ErrorKind::Usage) => (StatusCode::BAD_REQUEST, "USAGE"),
            (_, ErrorKind::Limit) => (StatusCode::CONFLICT, "LIMIT"),
            (_, ErrorKind::Instance) => (StatusCode::INTERNAL_SERVER_ERROR, "INSTANCE"),
            (_, ErrorKind::Fatal) => (StatusCode::SERVICE_UNAVAILABLE, "FATAL"),
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_vip(vip: &str) -> ApiResult<IpAddr> {
    vip.parse()
        .map_err(|e| ApiError::bad_request(format!("invalid VIP '{vip}': {e}")))
}

fn parse_lb_id(lb_id: &str) -> ApiResult<LoadBalancerId> {
    lb_id
        .parse()
        .map_err(|e| ApiError::bad_request(format!("{e}")))
}

fn check_algorithm(alg_type: &str) -> ApiResult<()> {
    if alg_type == ACTIVE_ACTIVE_ALGORITHM {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!(
            "unsupported cluster algorithm '{alg_type}'"
        )))
    }
}

/// Builds the agent router over an engine.
pub fn router(engine: Arc<DistributorEngine>) -> Router {
    Router::new()
        .route("/plug/vip/:vip", post(plug_vip))
        .route("/unplug/vip/:vip", post(unplug_vip))
        .route("/register/vip/:vip", post(register_amphora))
        .route("/unregister/vip/:vip", post(unregister_amphora))
        .route("/status", get(status_all))
        .route("/status/:lb_id", get(status_one))
        .route("/state/:lb_id", get(dump_state).put(load_state))
        .route("/info", get(info))
        .route("/diagnostics", get(diagnostics))
        .with_state(engine)
}

/// Serves the agent until the process is interrupted.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(engine: Arc<DistributorEngine>, addr: SocketAddr) -> fleetlb_core::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| fleetlb_core::Error::Internal {
            message: format!("failed to bind to {addr}: {e}"),
        })?;
    tracing::info!(%addr, "distributor agent listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await
        .map_err(|e| fleetlb_core::Error::Internal {
            message: format!("server error: {e}"),
        })
}

async fn plug_vip(
    State(engine): State<Arc<DistributorEngine>>,
    Path(vip): Path<String>,
    Json(body): Json<PlugVipBody>,
) -> ApiResult<(StatusCode, Json<DistributorInfo>)> {
    let vip = parse_vip(&vip)?;
    let info = engine
        .post_plug_vip(PlugVipRequest {
            lb_id: body.lb_id,
            vip,
            mac: body.mac_address,
            subnet_cidr: body.subnet_cidr,
            gateway: body.gateway,
            alg_type: body.cluster_alg_type,
            min_size: body.cluster_min_size,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(info)))
}

async fn unplug_vip(
    State(engine): State<Arc<DistributorEngine>>,
    Path(vip): Path<String>,
    Json(body): Json<UnplugVipBody>,
) -> ApiResult<StatusCode> {
    let vip = parse_vip(&vip)?;
    engine.pre_unplug_vip(body.lb_id, Some(vip)).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn register_amphora(
    State(engine): State<Arc<DistributorEngine>>,
    Path(vip): Path<String>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<Json<SlotResponse>> {
    let vip = parse_vip(&vip)?;
    check_algorithm(&body.cluster_alg_type)?;
    let slot = engine
        .register_amphora(RegisterRequest {
            lb_id: body.lb_id,
            vip: Some(vip),
            amphora_id: body.amphora_id,
            amphora_mac: body.amphora_mac,
            slot: body.cluster_slot,
        })
        .await?;
    Ok(Json(SlotResponse { slot }))
}

async fn unregister_amphora(
    State(engine): State<Arc<DistributorEngine>>,
    Path(vip): Path<String>,
    Json(body): Json<UnregisterBody>,
) -> ApiResult<Json<SlotResponse>> {
    let vip = parse_vip(&vip)?;
    check_algorithm(&body.cluster_alg_type)?;
    let slot = engine
        .unregister_amphora(UnregisterRequest {
            lb_id: body.lb_id,
            vip: Some(vip),
            amphora_id: body.amphora_id,
        })
        .await?;
    Ok(Json(SlotResponse { slot }))
}

async fn status_all(
    State(engine): State<Arc<DistributorEngine>>,
) -> ApiResult<Json<Vec<StatusReport>>> {
    Ok(Json(engine.get_status(None).await?))
}

async fn status_one(
    State(engine): State<Arc<DistributorEngine>>,
    Path(lb_id): Path<String>,
) -> ApiResult<Json<StatusReport>> {
    let lb_id = parse_lb_id(&lb_id)?;
    let mut reports = engine.get_status(Some(lb_id)).await?;
    reports
        .pop()
        .map(Json)
        .ok_or_else(|| ApiError::from(Error::NotFound { lb_id }))
}

async fn dump_state(
    State(engine): State<Arc<DistributorEngine>>,
    Path(lb_id): Path<String>,
) -> ApiResult<Json<SlotTable>> {
    let lb_id = parse_lb_id(&lb_id)?;
    Ok(Json(engine.dump_state(lb_id).await?))
}

async fn load_state(
    State(engine): State<Arc<DistributorEngine>>,
    Path(lb_id): Path<String>,
    Json(table): Json<SlotTable>,
) -> ApiResult<StatusCode> {
    let lb_id = parse_lb_id(&lb_id)?;
    engine.load_state(lb_id, table).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn info(State(engine): State<Arc<DistributorEngine>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION"),
        boot: engine.boot_status().await,
        distributors: engine.distributor_count().await,
    })
}

async fn diagnostics(
    State(engine): State<Arc<DistributorEngine>>,
) -> ApiResult<Json<DiagnosticsResponse>> {
    let config = engine.config();
    Ok(Json(DiagnosticsResponse {
        boot: engine.boot_status().await,
        max_distributors: config.max_distributors,
        max_cluster_size: config.max_cluster_size,
        soft_capacity: config.soft_capacity,
        openflow_protocol: config.openflow_protocol.clone(),
        distributors: engine.get_status(None).await?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistributorConfig;
    use crate::memory::MemorySwitch;
    use anyhow::{Context, Result};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const VIP: &str = "203.0.113.10";
    const EXT_MAC: &str = "02:00:00:00:00:aa";

    async fn test_router() -> Router {
        let switch = Arc::new(MemorySwitch::new());
        switch.add_interface("eth1", EXT_MAC);
        let engine = Arc::new(DistributorEngine::new(switch, DistributorConfig::default()));
        engine.start().await.expect("boot");
        router(engine)
    }

    fn json_request(method: &str, uri: &str, body: &impl Serialize) -> Result<Request<Body>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body)?))
            .context("build request")
    }

    fn plug_body(lb_id: LoadBalancerId, size: u32) -> PlugVipBody {
        PlugVipBody {
            subnet_cidr: "203.0.113.0/24".to_string(),
            gateway: None,
            mac_address: EXT_MAC.to_string(),
            lb_id,
            cluster_alg_type: ACTIVE_ACTIVE_ALGORITHM.to_string(),
            cluster_min_size: size,
        }
    }

    #[tokio::test]
    async fn plug_then_register_returns_slot() -> Result<()> {
        let router = test_router().await;
        let lb_id = LoadBalancerId::generate();

        let request = json_request("POST", &format!("/plug/vip/{VIP}"), &plug_body(lb_id, 2))?;
        let response = router.clone().oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let register = RegisterBody {
            subnet_cidr: "203.0.113.0/24".to_string(),
            gateway: None,
            lb_id,
            amphora_id: AmphoraId::generate(),
            amphora_mac: "02:00:00:00:01:01".to_string(),
            cluster_alg_type: ACTIVE_ACTIVE_ALGORITHM.to_string(),
            cluster_slot: Some(1),
        };
        let request = json_request("POST", &format!("/register/vip/{VIP}"), &register)?;
        let response = router.clone().oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .context("read response body")?;
        let slot: SlotResponse = serde_json::from_slice(&body).context("parse JSON body")?;
        assert_eq!(slot, SlotResponse { slot: 1 });

        let request = Request::builder()
            .uri(format!("/status/{lb_id}"))
            .body(Body::empty())
            .context("build request")?;
        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .context("read response body")?;
        let report: serde_json::Value = serde_json::from_slice(&body).context("parse JSON body")?;
        assert_eq!(report["status"], "DEGRADED");
        assert_eq!(report["registered"], 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_load_balancer_is_404() -> Result<()> {
        let router = test_router().await;
        let request = Request::builder()
            .uri(format!("/status/{}", LoadBalancerId::generate()))
            .body(Body::empty())
            .context("build request")?;
        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn oversize_cluster_is_409() -> Result<()> {
        let router = test_router().await;
        let body = plug_body(LoadBalancerId::generate(), 1000);
        let request = json_request("POST", &format!("/plug/vip/{VIP}"), &body)?;
        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        Ok(())
    }

    #[tokio::test]
    async fn bad_vip_is_400() -> Result<()> {
        let router = test_router().await;
        let body = plug_body(LoadBalancerId::generate(), 2);
        let request = json_request("POST", "/plug/vip/not-an-ip", &body)?;
        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn info_reports_boot_state() -> Result<()> {
        let router = test_router().await;
        let request = Request::builder()
            .uri("/info")
            .body(Body::empty())
            .context("build request")?;
        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .context("read response body")?;
        let info: serde_json::Value = serde_json::from_slice(&body).context("parse JSON body")?;
        assert_eq!(info["boot"]["state"], "ACTIVE");
        Ok(())
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        let cases = [
            (Error::usage("x"), StatusCode::BAD_REQUEST),
            (Error::limit("x"), StatusCode::CONFLICT),
            (
                Error::instance(LoadBalancerId::generate(), "x", None),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (Error::fatal("x", None), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
