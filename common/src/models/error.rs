use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::exit_code;

/// The error taxonomy spoken on the wire. Everything a caller can observe
/// going wrong maps onto one of these kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Unauthenticated,
    TokenExpired,
    Forbidden,
    NotFound,
    Conflict,
    DeploymentInProgress,
    InvalidSignature,
    UpstreamUnavailable,
    BuildFailed,
    DeployFailed,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Unauthenticated => "unauthenticated",
            Self::TokenExpired => "token_expired",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::DeploymentInProgress => "deployment_in_progress",
            Self::InvalidSignature => "invalid_signature",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::BuildFailed => "build_failed",
            Self::DeployFailed => "deploy_failed",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Unauthenticated | Self::TokenExpired | Self::InvalidSignature => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict | Self::DeploymentInProgress => StatusCode::CONFLICT,
            Self::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::BuildFailed | Self::DeployFailed | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// What a CLI talking to us should exit with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation => exit_code::VALIDATION,
            Self::Unauthenticated | Self::TokenExpired | Self::InvalidSignature => {
                exit_code::UNAUTHENTICATED
            }
            Self::Forbidden => exit_code::FORBIDDEN,
            Self::NotFound => exit_code::NOT_FOUND,
            Self::Conflict | Self::DeploymentInProgress => exit_code::CONFLICT,
            _ => exit_code::GENERIC,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            Self::Validation => "request failed validation",
            Self::Unauthenticated => "missing or malformed credentials",
            Self::TokenExpired => "token has expired, refresh and retry",
            Self::Forbidden => "credentials do not permit this operation",
            Self::NotFound => "resource not found",
            Self::Conflict => "request conflicts with current state",
            Self::DeploymentInProgress => {
                "another deployment for this service and environment is in flight"
            }
            Self::InvalidSignature => "webhook signature did not verify",
            Self::UpstreamUnavailable => "an upstream dependency is unavailable",
            Self::BuildFailed => "build failed",
            Self::DeployFailed => "deployment failed",
            Self::Timeout => "operation timed out",
            Self::Internal => "internal server error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Body of every error response: `{"error": {"code": ..., "message": ...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code().to_string(),
            message: message.into(),
            details: None,
        }
    }
}

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, kind.default_message())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ApiError,
}

impl From<ApiError> for ErrorEnvelope {
    fn from(error: ApiError) -> Self {
        Self { error }
    }
}
