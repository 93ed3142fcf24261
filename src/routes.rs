mod compile;
mod status;

pub use compile::*;
pub use status::*;

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse, Responder, get};
use serde::Serialize;

use crate::error::ExecError;

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
}

#[derive(Serialize)]
struct ErrorResponseWithMessage {
    reason: &'static str,
    code: u32,
    message: String,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

/// Maps an engine error to its HTTP response. Infrastructure details stay in the log.
fn error_response(err: &ExecError) -> HttpResponse {
    match err {
        ExecError::InvalidInput(message) => {
            HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_ARGUMENT",
                code: 1,
                message: message.clone(),
            })
        }
        ExecError::Overloaded => HttpResponse::TooManyRequests().json(ErrorResponse {
            reason: "ERR_OVERLOADED",
            code: 4,
        }),
        ExecError::Infrastructure(_) => HttpResponse::InternalServerError().json(ErrorResponse {
            reason: "ERR_INTERNAL",
            code: 6,
        }),
        ExecError::Cancelled => HttpResponse::ServiceUnavailable().json(ErrorResponse {
            reason: "ERR_CANCELLED",
            code: 7,
        }),
    }
}

#[get("/")]
pub async fn index() -> impl Responder {
    "Hello World!"
}
