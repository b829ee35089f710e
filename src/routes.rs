use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json,
    Router,
};
use base64::prelude::*;
use data_model::{classify_task, CookieKind, EdgeCookie, LevelCookie, NodeKind, ReseedMethod};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    acl::Authorizer,
    fleet::{
        error::FleetError,
        job_plan::JobAction,
        log_relay::parse_category,
        reconcile::{NeedQuery, Reconciliation, RollingQuery},
        Fleet,
    },
    http_objects::{
        ApiResponse,
        ClusterList,
        ClusterView,
        EncryptedLog,
        FleetAPIError,
        HealthReport,
        JobList,
        JobView,
        LogLineView,
        LogTail,
        MaintenanceState,
        NodeList,
        NodeView,
        PitrRequest,
        SwitchoverRequest,
        SwitchoverResult,
        TailParams,
    },
    middleware::{authorize, InstanceRequestSpan},
};

const DEFAULT_LOG_TAIL: usize = 100;

#[derive(Clone)]
pub struct RouteState {
    pub fleet: Arc<Fleet>,
    pub authorizer: Arc<dyn Authorizer>,
}

#[derive(OpenApi)]
#[openapi(
        paths(
            need_server,
            need_proxy,
            need_rolling_reprov,
            need_rolling_restart,
            write_log,
            list_clusters,
            get_cluster,
            cluster_action,
            cluster_switchover,
            list_servers,
            list_proxies,
            get_node,
            remove_node,
            report_health,
            server_action,
            start_reseed,
            start_pitr,
            cancel_reseed,
            cancel_job,
            clear_cookie,
            server_switchover,
            set_preferred_master,
            list_jobs,
            get_job,
            drain_job,
            read_logs,
        ),
        components(
            schemas(
                ApiResponse,
                ClusterList,
                ClusterView,
                EncryptedLog,
                FleetAPIError,
                HealthReport,
                JobList,
                JobView,
                LogLineView,
                LogTail,
                MaintenanceState,
                NodeList,
                NodeView,
                PitrRequest,
                SwitchoverRequest,
                SwitchoverResult,
            )
        ),
        tags(
            (name = "agents", description = "Node agent reconciliation API"),
            (name = "operations", description = "Operator API")
        )
    )]
pub struct ApiDoc;

pub fn create_routes(route_state: RouteState, request_span: InstanceRequestSpan) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .merge(SwaggerUi::new("/docs/swagger").url("/docs/openapi.json", ApiDoc::openapi()))
        .merge(agent_routes(route_state.clone()))
        .merge(operator_routes(route_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
}

/// Routes polled by node agents. They are reachable without a token.
fn agent_routes(route_state: RouteState) -> Router {
    Router::new()
        .route(
            "/api/clusters/{cluster}/servers/{node}/{port}/{need}",
            get(need_server).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/proxies/{node}/{port}/{need}",
            get(need_proxy).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/need-rolling-reprov",
            get(need_rolling_reprov).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/need-rolling-restart",
            get(need_rolling_restart).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/{port}/write-log/{task}",
            post(write_log).with_state(route_state),
        )
}

/// Operator routes, guarded by the configured [`Authorizer`].
fn operator_routes(route_state: RouteState) -> Router {
    Router::new()
        .route(
            "/api/clusters",
            get(list_clusters).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}",
            get(get_cluster).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/actions/switchover",
            post(cluster_switchover).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/actions/{action}",
            post(cluster_action).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers",
            get(list_servers).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/proxies",
            get(list_proxies).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}",
            get(get_node).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}",
            delete(remove_node).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/health",
            post(report_health).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/actions/reseed/{method}",
            post(start_reseed).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/actions/pitr",
            post(start_pitr).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/actions/reseed-cancel",
            post(cancel_reseed).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/actions/job-cancel/{task}",
            post(cancel_job).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/actions/clear/{cookie}",
            post(clear_cookie).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/actions/switchover",
            post(server_switchover).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/actions/set-prefered",
            post(set_preferred_master).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/actions/{action}",
            post(server_action).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/jobs",
            get(list_jobs).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/jobs/{task}",
            get(get_job).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/jobs/{task}",
            delete(drain_job).with_state(route_state.clone()),
        )
        .route(
            "/api/clusters/{cluster}/servers/{node}/logs/{category}",
            get(read_logs).with_state(route_state.clone()),
        )
        .route_layer(middleware::from_fn_with_state(route_state, authorize))
}

fn need_response(reply: Reconciliation) -> Response {
    let status = if reply.needs_action {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, reply.message()).into_response()
}

fn poll_node(
    state: &RouteState,
    kind: NodeKind,
    cluster: &str,
    host: &str,
    port: &str,
    need: &str,
) -> Result<Response, FleetAPIError> {
    let query = NeedQuery::from_path(need)?;
    let cluster = state.fleet.cluster(cluster)?;
    let reply = cluster.poll(kind, &format!("{}:{}", host, port), query)?;
    Ok(need_response(reply))
}

/// Reconciliation poll of a database server agent
#[utoipa::path(
    get,
    path = "/api/clusters/{cluster}/servers/{node}/{port}/{need}",
    tag = "agents",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server host"),
        ("port" = String, Path, description = "Server port"),
        ("need" = String, Path, description = "Poll, e.g. need-restart or need-start"),
    ),
    responses(
        (status = 200, description = "Action needed"),
        (status = 503, description = "No action needed"),
        (status = NOT_FOUND, description = "Unknown cluster or server"),
        (status = INTERNAL_SERVER_ERROR, description = "Server is down")
    ),
)]
pub async fn need_server(
    Path((cluster, node, port, need)): Path<(String, String, String, String)>,
    State(state): State<RouteState>,
) -> Result<Response, FleetAPIError> {
    poll_node(&state, NodeKind::Server, &cluster, &node, &port, &need)
}

/// Reconciliation poll of a proxy agent
#[utoipa::path(
    get,
    path = "/api/clusters/{cluster}/proxies/{node}/{port}/{need}",
    tag = "agents",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Proxy host"),
        ("port" = String, Path, description = "Proxy port"),
        ("need" = String, Path, description = "Poll, e.g. need-reprov"),
    ),
    responses(
        (status = 200, description = "Action needed"),
        (status = 503, description = "No action needed"),
        (status = NOT_FOUND, description = "Unknown cluster or proxy")
    ),
)]
pub async fn need_proxy(
    Path((cluster, node, port, need)): Path<(String, String, String, String)>,
    State(state): State<RouteState>,
) -> Result<Response, FleetAPIError> {
    poll_node(&state, NodeKind::Proxy, &cluster, &node, &port, &need)
}

fn poll_rolling(
    state: &RouteState,
    cluster: &str,
    query: RollingQuery,
) -> Result<Response, FleetAPIError> {
    let cluster = state.fleet.cluster(cluster)?;
    Ok(need_response(cluster.poll_rolling(query)))
}

#[utoipa::path(
    get,
    path = "/api/clusters/{cluster}/need-rolling-reprov",
    tag = "agents",
    params(("cluster" = String, Path, description = "Cluster name")),
    responses(
        (status = 200, description = "A server still waits for reprovisioning"),
        (status = 503, description = "No rolling reprov needed")
    ),
)]
pub async fn need_rolling_reprov(
    Path(cluster): Path<String>,
    State(state): State<RouteState>,
) -> Result<Response, FleetAPIError> {
    poll_rolling(&state, &cluster, RollingQuery::Reprov)
}

#[utoipa::path(
    get,
    path = "/api/clusters/{cluster}/need-rolling-restart",
    tag = "agents",
    params(("cluster" = String, Path, description = "Cluster name")),
    responses(
        (status = 200, description = "A server still waits for a restart"),
        (status = 503, description = "No rolling restart needed")
    ),
)]
pub async fn need_rolling_restart(
    Path(cluster): Path<String>,
    State(state): State<RouteState>,
) -> Result<Response, FleetAPIError> {
    poll_rolling(&state, &cluster, RollingQuery::Restart)
}

/// Relay an encrypted job log fragment from a server agent
#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/servers/{node}/{port}/write-log/{task}",
    tag = "agents",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server host"),
        ("port" = String, Path, description = "Server port"),
        ("task" = String, Path, description = "Registered task name"),
    ),
    request_body = EncryptedLog,
    responses(
        (status = 200, description = "Fragment logged", body = ApiResponse),
        (status = BAD_REQUEST, description = "Unregistered task or malformed payload"),
        (status = INTERNAL_SERVER_ERROR, description = "Fragment could not be decrypted")
    ),
)]
pub async fn write_log(
    Path((cluster, node, port, task)): Path<(String, String, String, String)>,
    State(state): State<RouteState>,
    Json(body): Json<EncryptedLog>,
) -> Result<Json<ApiResponse>, FleetAPIError> {
    // unknown tasks are refused before the payload is looked at
    if classify_task(&task).is_none() {
        return Err(FleetError::UnregisteredTask(task).into());
    }
    let fragment = BASE64_STANDARD
        .decode(body.data.as_bytes())
        .map_err(|e| FleetError::InvalidRequest(format!("log payload is not base64: {}", e)))?;
    state
        .fleet
        .submit_log(&cluster, &format!("{}:{}", node, port), &task, &fragment)?;
    Ok(Json(ApiResponse {
        data: "Message logged".to_string(),
        success: true,
    }))
}

#[utoipa::path(
    get,
    path = "/api/clusters",
    tag = "operations",
    responses(
        (status = 200, description = "Configured clusters", body = ClusterList),
    ),
)]
pub async fn list_clusters(State(state): State<RouteState>) -> Json<ClusterList> {
    Json(ClusterList {
        clusters: state
            .fleet
            .clusters()
            .iter()
            .map(|c| c.name.clone())
            .collect(),
    })
}

#[utoipa::path(
    get,
    path = "/api/clusters/{cluster}",
    tag = "operations",
    params(("cluster" = String, Path, description = "Cluster name")),
    responses(
        (status = 200, description = "Cluster state", body = ClusterView),
        (status = NOT_FOUND, description = "Unknown cluster")
    ),
)]
pub async fn get_cluster(
    Path(cluster): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<ClusterView>, FleetAPIError> {
    let cluster = state.fleet.cluster(&cluster)?;
    Ok(Json(ClusterView::from(cluster.as_ref())))
}

/// Rolling operations and automatic failover of a whole cluster
#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/actions/{action}",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("action" = String, Path, description = "rolling-restart, rolling-reprov, cancel-rolling-restart, cancel-rolling-reprov or failover"),
    ),
    responses(
        (status = 200, description = "Action applied", body = ApiResponse),
        (status = BAD_REQUEST, description = "Unknown action or failed master"),
        (status = INTERNAL_SERVER_ERROR, description = "Promotion failed")
    ),
)]
pub async fn cluster_action(
    Path((cluster, action)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Response, FleetAPIError> {
    let cluster = state.fleet.cluster(&cluster)?;
    let data = match action.as_str() {
        "rolling-restart" => {
            let count = cluster.set_cookie_on_all(LevelCookie::Restart);
            format!("Rolling restart requested on {} nodes", count)
        }
        "rolling-reprov" => {
            let count = cluster.set_cookie_on_all(LevelCookie::Reprovision);
            format!("Rolling reprov requested on {} nodes", count)
        }
        "cancel-rolling-restart" => {
            let count = cluster.clear_cookie_on_all(LevelCookie::Restart);
            format!("Rolling restart cancelled on {} nodes", count)
        }
        "cancel-rolling-reprov" => {
            let count = cluster.clear_cookie_on_all(LevelCookie::Reprovision);
            format!("Rolling reprov cancelled on {} nodes", count)
        }
        "failover" => {
            let master = cluster.failover().await?;
            return Ok(Json(SwitchoverResult {
                master: master.to_string(),
            })
            .into_response());
        }
        _ => {
            return Err(
                FleetError::InvalidRequest(format!("unknown cluster action: {}", action)).into(),
            )
        }
    };
    info!(cluster = %cluster.name, action = action, "cluster action applied");
    Ok(Json(ApiResponse {
        data,
        success: true,
    })
    .into_response())
}

#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/actions/switchover",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("prefmaster" = Option<String>, Query, description = "Server to promote"),
    ),
    responses(
        (status = 200, description = "New master", body = SwitchoverResult),
        (status = BAD_REQUEST, description = "Master has failed, use failover"),
        (status = INTERNAL_SERVER_ERROR, description = "Promotion failed")
    ),
)]
pub async fn cluster_switchover(
    Path(cluster): Path<String>,
    State(state): State<RouteState>,
    Query(request): Query<SwitchoverRequest>,
) -> Result<Json<SwitchoverResult>, FleetAPIError> {
    let cluster = state.fleet.cluster(&cluster)?;
    let master = cluster.switchover(request.prefmaster.as_deref()).await?;
    Ok(Json(SwitchoverResult {
        master: master.to_string(),
    }))
}

fn node_list(state: &RouteState, cluster: &str, kind: NodeKind) -> Result<NodeList, FleetAPIError> {
    let cluster = state.fleet.cluster(cluster)?;
    Ok(NodeList {
        nodes: cluster
            .nodes
            .all()
            .iter()
            .filter(|n| n.kind == kind)
            .map(|n| NodeView::from(n.as_ref()))
            .collect(),
    })
}

#[utoipa::path(
    get,
    path = "/api/clusters/{cluster}/servers",
    tag = "operations",
    params(("cluster" = String, Path, description = "Cluster name")),
    responses(
        (status = 200, description = "Database servers", body = NodeList),
        (status = NOT_FOUND, description = "Unknown cluster")
    ),
)]
pub async fn list_servers(
    Path(cluster): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<NodeList>, FleetAPIError> {
    Ok(Json(node_list(&state, &cluster, NodeKind::Server)?))
}

#[utoipa::path(
    get,
    path = "/api/clusters/{cluster}/proxies",
    tag = "operations",
    params(("cluster" = String, Path, description = "Cluster name")),
    responses(
        (status = 200, description = "Proxies", body = NodeList),
        (status = NOT_FOUND, description = "Unknown cluster")
    ),
)]
pub async fn list_proxies(
    Path(cluster): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<NodeList>, FleetAPIError> {
    Ok(Json(node_list(&state, &cluster, NodeKind::Proxy)?))
}

#[utoipa::path(
    get,
    path = "/api/clusters/{cluster}/servers/{node}",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Node url or name"),
    ),
    responses(
        (status = 200, description = "Node state", body = NodeView),
        (status = NOT_FOUND, description = "Unknown cluster or node")
    ),
)]
pub async fn get_node(
    Path((cluster, node)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<NodeView>, FleetAPIError> {
    let node = state.fleet.cluster(&cluster)?.node(&node)?;
    Ok(Json(NodeView::from(node.as_ref())))
}

/// Removes a node from its cluster; its running jobs are asked to stop
#[utoipa::path(
    delete,
    path = "/api/clusters/{cluster}/servers/{node}",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Node url or name"),
    ),
    responses(
        (status = 200, description = "Removed node", body = NodeView),
        (status = NOT_FOUND, description = "Unknown cluster or node")
    ),
)]
pub async fn remove_node(
    Path((cluster, node)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<NodeView>, FleetAPIError> {
    let node = state.fleet.cluster(&cluster)?.remove_node(&node)?;
    Ok(Json(NodeView::from(node.as_ref())))
}

/// Health and role observed by the monitoring loop
#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/servers/{node}/health",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Node url or name"),
    ),
    request_body = HealthReport,
    responses(
        (status = 200, description = "Updated node state", body = NodeView),
        (status = NOT_FOUND, description = "Unknown cluster or node")
    ),
)]
pub async fn report_health(
    Path((cluster, node)): Path<(String, String)>,
    State(state): State<RouteState>,
    Json(report): Json<HealthReport>,
) -> Result<Json<NodeView>, FleetAPIError> {
    let node = state.fleet.cluster(&cluster)?.node(&node)?;
    node.set_down(report.down);
    if let Some(role) = report.role {
        node.set_role(role);
    }
    Ok(Json(NodeView::from(node.as_ref())))
}

enum ServerAction {
    Cookie(CookieKind),
    Maintenance(Option<bool>),
    Job(JobAction),
}

impl ServerAction {
    fn from_path(action: &str) -> Result<Self, FleetError> {
        let action = match action {
            "start" => ServerAction::Cookie(EdgeCookie::WaitStart.into()),
            "stop" => ServerAction::Cookie(EdgeCookie::WaitStop.into()),
            "config-change" => ServerAction::Cookie(EdgeCookie::ConfigChange.into()),
            "restart" => ServerAction::Cookie(LevelCookie::Restart.into()),
            "reprov" => ServerAction::Cookie(LevelCookie::Reprovision.into()),
            "provision" => ServerAction::Cookie(LevelCookie::Provision.into()),
            "unprovision" => ServerAction::Cookie(LevelCookie::Unprovision.into()),
            "set-maintenance" => ServerAction::Maintenance(Some(true)),
            "del-maintenance" => ServerAction::Maintenance(Some(false)),
            "maintenance" => ServerAction::Maintenance(None),
            other => ServerAction::Job(JobAction::from_path(other)?),
        };
        Ok(action)
    }
}

/// Cookie, maintenance and job actions on a single server
#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/servers/{node}/actions/{action}",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Node url or name"),
        ("action" = String, Path, description = "start, stop, restart, reprov, provision, unprovision, config-change, set-maintenance, del-maintenance, maintenance, backup-physical, backup-logical, backup-error-log, backup-slowquery-log or optimize"),
    ),
    responses(
        (status = 200, description = "Action applied"),
        (status = BAD_REQUEST, description = "Unknown action"),
        (status = NOT_FOUND, description = "Unknown cluster or node"),
        (status = CONFLICT, description = "Job already running")
    ),
)]
pub async fn server_action(
    Path((cluster, node, action)): Path<(String, String, String)>,
    State(state): State<RouteState>,
) -> Result<Response, FleetAPIError> {
    let cluster = state.fleet.cluster(&cluster)?;
    let response = match ServerAction::from_path(&action)? {
        ServerAction::Cookie(kind) => {
            cluster.set_cookie(&node, kind)?;
            Json(ApiResponse {
                data: format!("Cookie {} set", kind.name()),
                success: true,
            })
            .into_response()
        }
        ServerAction::Maintenance(target) => {
            let server = cluster.server(&node)?;
            let maintenance = match target {
                Some(maintenance) => {
                    server.set_maintenance(maintenance);
                    maintenance
                }
                None => server.toggle_maintenance(),
            };
            info!(cluster = %cluster.name, node = %server.id, maintenance, "maintenance updated");
            Json(MaintenanceState { maintenance }).into_response()
        }
        ServerAction::Job(job) => Json(JobView::from(cluster.start_job(&node, job)?)).into_response(),
    };
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/servers/{node}/actions/reseed/{method}",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server url or name"),
        ("method" = String, Path, description = "logicalbackup, logicalmaster or physicalbackup"),
    ),
    responses(
        (status = 200, description = "Reseed job started", body = JobView),
        (status = BAD_REQUEST, description = "Unknown reseed method"),
        (status = CONFLICT, description = "Job already running")
    ),
)]
pub async fn start_reseed(
    Path((cluster, node, method)): Path<(String, String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<JobView>, FleetAPIError> {
    let method: ReseedMethod = method
        .parse()
        .map_err(|_| FleetError::InvalidRequest(format!("unknown reseed method: {}", method)))?;
    let cluster = state.fleet.cluster(&cluster)?;
    let job = cluster.start_job(&node, JobAction::Reseed(method))?;
    Ok(Json(JobView::from(job)))
}

/// Point-in-time recovery of a server
#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/servers/{node}/actions/pitr",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server url or name"),
    ),
    request_body = PitrRequest,
    responses(
        (status = 200, description = "Restore job started", body = JobView),
        (status = BAD_REQUEST, description = "Invalid restore request"),
        (status = CONFLICT, description = "Job already running")
    ),
)]
pub async fn start_pitr(
    Path((cluster, node)): Path<(String, String)>,
    State(state): State<RouteState>,
    Json(request): Json<PitrRequest>,
) -> Result<Json<JobView>, FleetAPIError> {
    let cluster = state.fleet.cluster(&cluster)?;
    let job = cluster.start_job(&node, JobAction::PointInTime(request.into()))?;
    Ok(Json(JobView::from(job)))
}

#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/servers/{node}/actions/reseed-cancel",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server url or name"),
    ),
    responses(
        (status = 200, description = "Reseed jobs asked to stop", body = ApiResponse),
        (status = NOT_FOUND, description = "Unknown cluster or server")
    ),
)]
pub async fn cancel_reseed(
    Path((cluster, node)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<ApiResponse>, FleetAPIError> {
    state.fleet.cluster(&cluster)?.cancel_reseed(&node)?;
    Ok(Json(ApiResponse {
        data: "Reseed cancelled".to_string(),
        success: true,
    }))
}

#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/servers/{node}/actions/job-cancel/{task}",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server url or name"),
        ("task" = String, Path, description = "Task name"),
    ),
    responses(
        (status = 200, description = "Job killed", body = ApiResponse),
        (status = NOT_FOUND, description = "Unknown cluster or server")
    ),
)]
pub async fn cancel_job(
    Path((cluster, node, task)): Path<(String, String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<ApiResponse>, FleetAPIError> {
    state.fleet.cluster(&cluster)?.kill_job(&node, &task)?;
    Ok(Json(ApiResponse {
        data: format!("Job {} cancelled", task),
        success: true,
    }))
}

/// Clears a level cookie, e.g. once an operator gave up on a restart
#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/servers/{node}/actions/clear/{cookie}",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Node url or name"),
        ("cookie" = String, Path, description = "restart, reprov, prov or unprov"),
    ),
    responses(
        (status = 200, description = "Cookie cleared", body = ApiResponse),
        (status = BAD_REQUEST, description = "Not a level cookie")
    ),
)]
pub async fn clear_cookie(
    Path((cluster, node, cookie)): Path<(String, String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<ApiResponse>, FleetAPIError> {
    let kind: LevelCookie = cookie
        .parse()
        .map_err(|_| FleetError::InvalidRequest(format!("not a level cookie: {}", cookie)))?;
    let cleared = state
        .fleet
        .cluster(&cluster)?
        .clear_level_cookie(&node, kind)?;
    let data = if cleared {
        format!("Cookie {} cleared", cookie)
    } else {
        format!("Cookie {} was not set", cookie)
    };
    Ok(Json(ApiResponse {
        data,
        success: true,
    }))
}

#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/servers/{node}/actions/switchover",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server to promote"),
    ),
    responses(
        (status = 200, description = "New master", body = SwitchoverResult),
        (status = BAD_REQUEST, description = "Master has failed, use failover"),
        (status = INTERNAL_SERVER_ERROR, description = "Promotion failed")
    ),
)]
pub async fn server_switchover(
    Path((cluster, node)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<SwitchoverResult>, FleetAPIError> {
    let cluster = state.fleet.cluster(&cluster)?;
    let master = cluster.switchover(Some(&node)).await?;
    Ok(Json(SwitchoverResult {
        master: master.to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/clusters/{cluster}/servers/{node}/actions/set-prefered",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server url or name"),
    ),
    responses(
        (status = 200, description = "Preferred master set", body = ApiResponse),
        (status = NOT_FOUND, description = "Unknown cluster or server")
    ),
)]
pub async fn set_preferred_master(
    Path((cluster, node)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<ApiResponse>, FleetAPIError> {
    state.fleet.cluster(&cluster)?.set_preferred(&node).await?;
    Ok(Json(ApiResponse {
        data: format!("Preferred master set to {}", node),
        success: true,
    }))
}

#[utoipa::path(
    get,
    path = "/api/clusters/{cluster}/servers/{node}/jobs",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server url or name"),
    ),
    responses(
        (status = 200, description = "Jobs of the server", body = JobList),
        (status = NOT_FOUND, description = "Unknown cluster or server")
    ),
)]
pub async fn list_jobs(
    Path((cluster, node)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<JobList>, FleetAPIError> {
    let server = state.fleet.cluster(&cluster)?.server(&node)?;
    Ok(Json(JobList {
        jobs: server.jobs.list().into_iter().map(JobView::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/clusters/{cluster}/servers/{node}/jobs/{task}",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server url or name"),
        ("task" = String, Path, description = "Task name"),
    ),
    responses(
        (status = 200, description = "Job status", body = JobView),
        (status = NOT_FOUND, description = "No such job")
    ),
)]
pub async fn get_job(
    Path((cluster, node, task)): Path<(String, String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<JobView>, FleetAPIError> {
    let server = state.fleet.cluster(&cluster)?.server(&node)?;
    let job = server
        .jobs
        .status(&task)
        .ok_or_else(|| FleetAPIError::new(StatusCode::NOT_FOUND, "job not found"))?;
    Ok(Json(JobView::from(job)))
}

/// Removes a finished job from the registry
#[utoipa::path(
    delete,
    path = "/api/clusters/{cluster}/servers/{node}/jobs/{task}",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server url or name"),
        ("task" = String, Path, description = "Task name"),
    ),
    responses(
        (status = 200, description = "Drained job", body = JobView),
        (status = NOT_FOUND, description = "No finished job under that name")
    ),
)]
pub async fn drain_job(
    Path((cluster, node, task)): Path<(String, String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<JobView>, FleetAPIError> {
    let server = state.fleet.cluster(&cluster)?.server(&node)?;
    let job = server
        .jobs
        .drain(&task)
        .ok_or_else(|| FleetAPIError::new(StatusCode::NOT_FOUND, "no finished job"))?;
    Ok(Json(JobView::from(job)))
}

#[utoipa::path(
    get,
    path = "/api/clusters/{cluster}/servers/{node}/logs/{category}",
    tag = "operations",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("node" = String, Path, description = "Server url or name"),
        ("category" = String, Path, description = "backup_stream or task"),
        TailParams,
    ),
    responses(
        (status = 200, description = "Most recent log lines", body = LogTail),
        (status = BAD_REQUEST, description = "Unknown category")
    ),
)]
pub async fn read_logs(
    Path((cluster, node, category)): Path<(String, String, String)>,
    Query(params): Query<TailParams>,
    State(state): State<RouteState>,
) -> Result<Json<LogTail>, FleetAPIError> {
    let category = parse_category(&category)?;
    let lines = state.fleet.cluster(&cluster)?.read_log(
        &node,
        category,
        params.limit.unwrap_or(DEFAULT_LOG_TAIL),
    )?;
    Ok(Json(LogTail {
        lines: lines.into_iter().map(LogLineView::from).collect(),
    }))
}
