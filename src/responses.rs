use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct JsonResponse {
    pub status: String,
    pub success: bool,
    pub message: String,
}

impl JsonResponse {
    fn body(success: bool, msg: &str) -> JsonResponse {
        JsonResponse {
            status: if success { "success" } else { "error" }.to_string(),
            success,
            message: msg.to_string(),
        }
    }

    pub fn success(msg: &str) -> impl IntoResponse {
        (StatusCode::OK, Json(Self::body(true, msg)))
    }

    pub fn not_found(msg: &str) -> impl IntoResponse {
        (StatusCode::NOT_FOUND, Json(Self::body(false, msg)))
    }

    pub fn bad_request(msg: &str) -> impl IntoResponse {
        (StatusCode::BAD_REQUEST, Json(Self::body(false, msg)))
    }

    pub fn unprocessable(msg: &str) -> impl IntoResponse {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(Self::body(false, msg)),
        )
    }

    pub fn server_error(msg: &str) -> impl IntoResponse {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Self::body(false, msg)),
        )
    }
}
