use actix_web::{HttpResponse, Responder, get, web};
use serde::Serialize;

use crate::coordinator::Coordinator;
use crate::gate::GateStats;
use crate::workspace::WorkspaceStats;

#[derive(Serialize)]
pub struct StatusResponse {
    pub gate: GateStats,
    pub workspaces: WorkspaceStats,
}

#[get("/status")]
pub async fn status_handler(coordinator: web::Data<Coordinator>) -> impl Responder {
    HttpResponse::Ok().json(StatusResponse {
        gate: coordinator.gate_stats(),
        workspaces: coordinator.workspace_stats(),
    })
}
