//! Dispatches JSON-RPC method calls onto the orchestrator.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::error::Error;
use crate::core::models::{JobRequest, NewSchedule, ScheduleUpdate};
use crate::core::Orchestrator;

use super::protocol::{Request, Response, RpcError};

/// Application error codes, outside the range reserved by JSON-RPC.
pub const NOT_FOUND: i32 = -32004;
pub const INVALID_DEFINITION: i32 = -32010;
pub const BACKEND_ERROR: i32 = -32020;

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
struct UpdateParams {
    id: String,
    #[serde(flatten)]
    update: ScheduleUpdate,
}

#[derive(Deserialize, Default)]
struct PageParams {
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    offset: Option<u32>,
}

pub struct MethodHandler {
    orchestrator: Orchestrator,
}

impl MethodHandler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);
        let orch = &self.orchestrator;

        match request.method.as_str() {
            "daemon.status" => respond(id, orch.status().await),

            "schedules.list" => respond(id, orch.list_schedules().await),
            "schedules.due" => respond(id, orch.due_now().await),
            "schedules.get" => match parse::<IdParams>(params) {
                Ok(p) => respond(id, orch.get_schedule(&p.id).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "schedules.add" => match parse::<NewSchedule>(params) {
                Ok(new) => respond(id, orch.add_schedule(new).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "schedules.update" => match parse::<UpdateParams>(params) {
                Ok(p) => respond(id, orch.update_schedule(&p.id, p.update).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "schedules.remove" => match parse::<IdParams>(params) {
                Ok(p) => respond(id, orch.remove_schedule(&p.id).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "schedules.enable" => match parse::<IdParams>(params) {
                Ok(p) => respond(id, orch.enable(&p.id).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "schedules.disable" => match parse::<IdParams>(params) {
                Ok(p) => respond(id, orch.disable(&p.id).await),
                Err(e) => Response::invalid_params(id, e),
            },

            "jobs.run" => match parse::<JobRequest>(params) {
                Ok(req) => respond(
                    id,
                    orch.run_now(req)
                        .await
                        .map(|job_id| serde_json::json!({ "job_id": job_id })),
                ),
                Err(e) => Response::invalid_params(id, e),
            },
            "jobs.get" => match parse::<IdParams>(params) {
                Ok(p) => respond(id, orch.get_job(&p.id).await),
                Err(e) => Response::invalid_params(id, e),
            },
            "jobs.list" => Response::success(id, orch.list_jobs().await),
            "jobs.history" => match parse_or_default::<PageParams>(params) {
                Ok(p) => match orch
                    .history(p.limit.unwrap_or(50), p.offset.unwrap_or(0))
                    .await
                {
                    Ok(jobs) => Response::success(id, jobs),
                    Err(e) => Response::internal_error(id, format!("{:#}", e)),
                },
                Err(e) => Response::invalid_params(id, e),
            },
            "jobs.stats" => match orch.statistics().await {
                Ok(stats) => Response::success(id, stats),
                Err(e) => Response::internal_error(id, format!("{:#}", e)),
            },

            "vms.list" => respond(id, orch.list_vms().await),

            _ => Response::method_not_found(id, &request.method),
        }
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| e.to_string())
}

fn parse_or_default<T: DeserializeOwned + Default>(params: Value) -> Result<T, String> {
    if params.is_null() {
        return Ok(T::default());
    }
    parse(params)
}

fn respond<T: serde::Serialize>(id: Value, result: Result<T, Error>) -> Response {
    match result {
        Ok(value) => Response::success(id, value),
        Err(e) => error_response(id, &e),
    }
}

fn error_response(id: Value, error: &Error) -> Response {
    let (code, kind) = match error {
        Error::ScheduleNotFound(_) => (NOT_FOUND, "schedule_not_found"),
        Error::JobNotFound(_) => (NOT_FOUND, "job_not_found"),
        Error::Config(_) | Error::Cadence(_) => (INVALID_DEFINITION, "invalid_definition"),
        Error::Store(_) => (BACKEND_ERROR, "store_unavailable"),
        Error::VmList(_) => (BACKEND_ERROR, "hypervisor_unavailable"),
        Error::InvariantViolation(_) => (BACKEND_ERROR, "invariant_violation"),
    };
    Response::failure(id, RpcError::new(code, error.to_string()).with_kind(kind))
}
