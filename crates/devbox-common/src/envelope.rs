use serde::{Deserialize, Serialize};

use crate::{DevboxError, ErrorKind};

/// Result envelope shared by the HTTP gateway and the CLI.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                kind,
                message: message.into(),
            }),
        }
    }
}

impl<T> From<&DevboxError> for ApiResponse<T> {
    fn from(err: &DevboxError) -> Self {
        Self::failure(err.kind(), err.to_string())
    }
}

impl<T> From<crate::Result<T>> for ApiResponse<T> {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::from(&err),
        }
    }
}
