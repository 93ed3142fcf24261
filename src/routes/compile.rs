use actix_web::{HttpResponse, Responder, post, web};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::error_response;
use crate::config::{ByteSize, MilliSecond};
use crate::coordinator::{Coordinator, ExecutionRequest};
use crate::sandbox::{ExecutionOutcome, LimitExceeded, Stage};

#[derive(Deserialize, Debug)]
pub struct CompileRequest {
    pub code: String,
    pub language: Option<String>,
    pub stdin: Option<String>,
    /// Milliseconds
    pub time_limit: Option<u64>,
    /// Bytes
    pub memory_limit: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CompileResponse {
    /// stdout followed by stderr
    pub result: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_kb: u64,
    pub truncated: bool,
    pub limit_exceeded: LimitExceeded,
    pub stage: Stage,
}

impl From<ExecutionOutcome> for CompileResponse {
    fn from(outcome: ExecutionOutcome) -> Self {
        let stdout = String::from_utf8_lossy(&outcome.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();
        Self {
            result: format!("{stdout}{stderr}"),
            exit_code: outcome.exit_code(),
            signal: outcome.signal(),
            duration_ms: outcome.duration.as_millis() as u64,
            cpu_time_ms: outcome.cpu_time.as_millis() as u64,
            peak_memory_kb: outcome.peak_memory / 1024,
            truncated: outcome.truncated,
            limit_exceeded: outcome.limit_exceeded,
            stage: outcome.stage,
            stdout,
            stderr,
        }
    }
}

#[post("/compile")]
pub async fn compile_handler(
    coordinator: web::Data<Coordinator>,
    body: web::Json<CompileRequest>,
) -> impl Responder {
    let CompileRequest {
        code,
        language,
        stdin,
        time_limit,
        memory_limit,
    } = body.into_inner();

    let config = coordinator.config();
    let request = ExecutionRequest {
        code,
        language: language.unwrap_or_else(|| config.default_language.clone()),
        stdin,
        time_limit: time_limit.map(MilliSecond),
        memory_limit: memory_limit.map(ByteSize),
    };
    let deadline = Instant::now() + std::time::Duration::from(config.admission_timeout);

    // actix drops this future when the client goes away, which cancels the run
    match coordinator.execute(request, deadline).await {
        Ok(outcome) => HttpResponse::Ok().json(CompileResponse::from(outcome)),
        Err(e) => error_response(&e),
    }
}
