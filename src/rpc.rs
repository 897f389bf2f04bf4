//! HTTP control surface. Every call is answered with a status flag and a
//! human readable message.
use crate::{
    config::ControllerKind,
    controllers::{
        pid::PidAdjustment,
        relay::{RelayError, SetupAction},
    },
    daemon::{Daemon, DaemonError, DaemonResult},
    metrics,
};
use actix_web::{get, post, web, HttpResponse};
use log::error;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: bool,
    pub message: String,
}

impl Response {
    pub fn success(message: String) -> Self {
        Response {
            status: true,
            message,
        }
    }

    pub fn failure(message: String) -> Self {
        Response {
            status: false,
            message,
        }
    }
}

fn reply(result: DaemonResult<String>) -> HttpResponse {
    match result {
        Ok(message) => HttpResponse::Ok().json(Response::success(message)),
        Err(e) => {
            let body = Response::failure(e.to_string());
            match e {
                DaemonError::AlreadyActive { .. } | DaemonError::NotActive { .. } => {
                    HttpResponse::Conflict().json(body)
                }
                DaemonError::NotConfigured { .. } | DaemonError::Relay(RelayError::UnknownRelay(_)) => {
                    HttpResponse::NotFound().json(body)
                }
                DaemonError::Relay(RelayError::InvalidDuration { .. })
                | DaemonError::Relay(RelayError::InvalidDutyCycle { .. })
                | DaemonError::Relay(RelayError::NotPwm(_)) => HttpResponse::BadRequest().json(body),
                DaemonError::Relay(RelayError::Hardware { .. }) | DaemonError::Other(_) => {
                    HttpResponse::InternalServerError().json(body)
                }
                DaemonError::Relay(_) => HttpResponse::Conflict().json(body),
            }
        }
    }
}

/// Run a daemon call on the blocking pool; relay switching and worker
/// joins may sleep.
async fn call<F>(daemon: web::Data<Daemon>, f: F) -> HttpResponse
where
    F: FnOnce(&Daemon) -> DaemonResult<String> + Send + 'static,
{
    let daemon = daemon.into_inner();
    match web::block(move || f(&daemon)).await {
        Ok(result) => reply(result),
        Err(e) => {
            error!("RPC call failed to run: {}", e);
            HttpResponse::InternalServerError().json(Response::failure(e.to_string()))
        }
    }
}

fn bad_request(e: anyhow::Error) -> HttpResponse {
    HttpResponse::BadRequest().json(Response::failure(e.to_string()))
}

#[get("/api/daemon")]
async fn daemon_status(daemon: web::Data<Daemon>) -> HttpResponse {
    HttpResponse::Ok().json(Response::success(daemon.daemon_status().to_string()))
}

#[get("/api/daemon/check")]
async fn check_daemon(daemon: web::Data<Daemon>) -> HttpResponse {
    call(daemon, |d| d.check_daemon()).await
}

#[get("/api/status")]
async fn status(daemon: web::Data<Daemon>) -> HttpResponse {
    HttpResponse::Ok().json(daemon.status())
}

#[post("/api/controllers/{kind}/{id}/{action}")]
async fn controller(daemon: web::Data<Daemon>, path: web::Path<(String, u32, String)>) -> HttpResponse {
    let (kind, id, action) = path.into_inner();
    let kind: ControllerKind = match kind.parse() {
        Ok(kind) => kind,
        Err(e) => return bad_request(e),
    };
    match action.as_str() {
        "activate" => call(daemon, move |d| d.activate(kind, id)).await,
        "deactivate" => call(daemon, move |d| d.deactivate(kind, id)).await,
        other => bad_request(anyhow::anyhow!("unknown controller action '{}'", other)),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RelayOnRequest {
    pub duration: f64,
    pub min_off_duration: f64,
}

#[post("/api/relays/{id}/on")]
async fn relay_on(
    daemon: web::Data<Daemon>,
    path: web::Path<u32>,
    body: Option<web::Json<RelayOnRequest>>,
) -> HttpResponse {
    let id = path.into_inner();
    let request = body.map(|b| b.into_inner()).unwrap_or_default();
    call(daemon, move |d| {
        d.relay_on(id, request.duration, request.min_off_duration)
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct RelayOffRequest {
    #[serde(default = "default_trigger")]
    pub trigger_conditionals: bool,
}

fn default_trigger() -> bool {
    true
}

#[post("/api/relays/{id}/off")]
async fn relay_off(
    daemon: web::Data<Daemon>,
    path: web::Path<u32>,
    body: Option<web::Json<RelayOffRequest>>,
) -> HttpResponse {
    let id = path.into_inner();
    let trigger = body.map_or(true, |b| b.trigger_conditionals);
    call(daemon, move |d| d.relay_off(id, trigger)).await
}

#[derive(Debug, Deserialize)]
pub struct DutyCycleRequest {
    pub duty_cycle: f64,
}

#[post("/api/relays/{id}/duty_cycle")]
async fn relay_duty_cycle(
    daemon: web::Data<Daemon>,
    path: web::Path<u32>,
    body: web::Json<DutyCycleRequest>,
) -> HttpResponse {
    let id = path.into_inner();
    let duty = body.duty_cycle;
    call(daemon, move |d| d.relay_duty_cycle(id, duty)).await
}

#[get("/api/relays/{id}/state")]
async fn relay_state(daemon: web::Data<Daemon>, path: web::Path<u32>) -> HttpResponse {
    let id = path.into_inner();
    call(daemon, move |d| d.relay_state(id)).await
}

#[get("/api/relays/{id}/seconds_on")]
async fn relay_sec_currently_on(daemon: web::Data<Daemon>, path: web::Path<u32>) -> HttpResponse {
    let id = path.into_inner();
    call(daemon, move |d| {
        d.relay_sec_currently_on(id).map(|secs| format!("{:.1}", secs))
    })
    .await
}

#[post("/api/relays/{id}/setup/{action}")]
async fn relay_setup(daemon: web::Data<Daemon>, path: web::Path<(u32, String)>) -> HttpResponse {
    let (id, action) = path.into_inner();
    let action: SetupAction = match action.parse() {
        Ok(action) => action,
        Err(e) => return bad_request(e),
    };
    call(daemon, move |d| d.relay_setup(action, id)).await
}

#[post("/api/relays/conditionals/refresh")]
async fn refresh_relay_conditionals(daemon: web::Data<Daemon>) -> HttpResponse {
    call(daemon, |d| d.refresh_relay_conditionals()).await
}

#[post("/api/sensors/{id}/conditionals/{conditional_id}/{mod_kind}")]
async fn refresh_sensor_conditionals(
    daemon: web::Data<Daemon>,
    path: web::Path<(u32, u32, String)>,
) -> HttpResponse {
    let (sensor_id, conditional_id, mod_kind) = path.into_inner();
    call(daemon, move |d| {
        d.refresh_sensor_conditionals(sensor_id, &mod_kind, conditional_id)
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct FlashRequest {
    pub on: bool,
}

#[post("/api/lcds/{id}/flash")]
async fn flash_lcd(
    daemon: web::Data<Daemon>,
    path: web::Path<u32>,
    body: web::Json<FlashRequest>,
) -> HttpResponse {
    let id = path.into_inner();
    let on = body.on;
    call(daemon, move |d| d.flash_lcd(id, on)).await
}

#[get("/api/pids/{id}")]
async fn pid_status(daemon: web::Data<Daemon>, path: web::Path<u32>) -> HttpResponse {
    match daemon.pid_status(path.into_inner()) {
        Ok(pid) => HttpResponse::Ok().json(pid),
        Err(e) => reply(Err(e)),
    }
}

#[post("/api/pids/{id}/{action}")]
async fn pid_mode(daemon: web::Data<Daemon>, path: web::Path<(u32, String)>) -> HttpResponse {
    let (id, action) = path.into_inner();
    match action.as_str() {
        "hold" => call(daemon, move |d| d.pid_hold(id)).await,
        "pause" => call(daemon, move |d| d.pid_pause(id)).await,
        "resume" => call(daemon, move |d| d.pid_resume(id)).await,
        other => bad_request(anyhow::anyhow!("unknown PID action '{}'", other)),
    }
}

#[derive(Debug, Deserialize)]
pub struct PidValueRequest {
    pub value: f64,
}

#[post("/api/pids/{id}/set/{parameter}")]
async fn pid_set(
    daemon: web::Data<Daemon>,
    path: web::Path<(u32, String)>,
    body: web::Json<PidValueRequest>,
) -> HttpResponse {
    let (id, parameter) = path.into_inner();
    let adjustment = match PidAdjustment::parse(&parameter, body.value) {
        Ok(adjustment) => adjustment,
        Err(e) => return bad_request(e),
    };
    call(daemon, move |d| d.pid_adjust(id, adjustment)).await
}

#[get("/metrics")]
async fn metrics_text() -> HttpResponse {
    match metrics::gather() {
        Ok(text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(text),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

/// Register every route. The daemon is expected as `web::Data<Daemon>`.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(daemon_status)
        .service(check_daemon)
        .service(status)
        .service(controller)
        .service(refresh_relay_conditionals)
        .service(relay_on)
        .service(relay_off)
        .service(relay_duty_cycle)
        .service(relay_state)
        .service(relay_sec_currently_on)
        .service(relay_setup)
        .service(refresh_sensor_conditionals)
        .service(flash_lcd)
        .service(pid_status)
        .service(pid_mode)
        .service(pid_set)
        .service(metrics_text);
}
