use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use cmx_presence_core::validator::IngestError;

#[derive(Debug, Serialize)]
struct ProblemBody {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    message: String,
}

/// JSON rejection returned by the webhook endpoint.
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemBody,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, message: S) -> Self {
        Self {
            status,
            body: ProblemBody {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                message: message.into(),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<&IngestError> for ProblemResponse {
    fn from(err: &IngestError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::UNPROCESSABLE_ENTITY);
        Self::new(status, err.code(), err.message())
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}
