//! Classification of upload outcomes

use crate::errors::CoreError;
use crate::upload::transport::HttpResponse;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// The intake accepted the batch.
    Delivered { status: u16 },
    /// Temporary failure, the batch is kept and sent again later.
    Retry(RetryReason),
    /// The batch can never be accepted and is dropped.
    Rejected { status: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Status(u16),
    Network,
    Timeout,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Status(code) => write!(f, "status {}", code),
            RetryReason::Network => write!(f, "network error"),
            RetryReason::Timeout => write!(f, "timeout"),
        }
    }
}

impl UploadStatus {
    pub fn from_response(response: &HttpResponse) -> Self {
        match response.status {
            200..=299 => UploadStatus::Delivered {
                status: response.status,
            },
            408 | 429 | 500..=599 => UploadStatus::Retry(RetryReason::Status(response.status)),
            status => UploadStatus::Rejected { status },
        }
    }

    pub fn from_error(error: &CoreError) -> Self {
        match error {
            CoreError::Timeout => UploadStatus::Retry(RetryReason::Timeout),
            _ => UploadStatus::Retry(RetryReason::Network),
        }
    }

    pub fn is_invalid_token(&self) -> bool {
        matches!(self, UploadStatus::Rejected { status: 401 | 403 })
    }
}
