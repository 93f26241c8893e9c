use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use log::error;
use serde::{Deserialize, Serialize};
use taskron_models::errors::TaskronError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    Domain(TaskronError),
    Unauthorized(&'static str),
}

impl From<TaskronError> for ApiError {
    fn from(err: TaskronError) -> Self {
        ApiError::Domain(err)
    }
}

pub(crate) fn status_for(err: &TaskronError) -> StatusCode {
    match err {
        TaskronError::InvalidSchedule { .. } | TaskronError::InvalidTask(_) => StatusCode::BAD_REQUEST,
        TaskronError::TaskNotFound(_) | TaskronError::LogNotFound(_) => StatusCode::NOT_FOUND,
        TaskronError::ConcurrentRunRejected(_) => StatusCode::CONFLICT,
        TaskronError::ExecutionTimeout { .. }
        | TaskronError::ExecutionFailed(_)
        | TaskronError::StoreIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Domain(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    error!("Request failed: {}", err);
                }
                json_response(
                    status,
                    ErrorBody {
                        code: err.code().to_string(),
                        error: err.to_string(),
                    },
                )
            }
            ApiError::Unauthorized(reason) => json_response(
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: "unauthorized".to_string(),
                    error: reason.to_string(),
                },
            ),
        }
    }
}

pub(crate) fn json_response<T>(status: StatusCode, payload: T) -> Response
where
    T: Serialize,
{
    (status, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_domain_errors_to_status() {
        assert_eq!(
            status_for(&TaskronError::invalid_schedule("x", "bad")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&TaskronError::TaskNotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&TaskronError::LogNotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&TaskronError::ConcurrentRunRejected(1)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&TaskronError::StoreIo("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
