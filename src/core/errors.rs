// src/core/errors.rs

//! Defines the primary error type for the entire application, the numeric
//! status codes that travel on the wire, and the fold onto the small set of
//! posix-style codes that clients are allowed to depend on.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server
/// and the client runtime. Using `thiserror` allows for clean error
/// definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum StratusError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {0}")]
    Parameter(String),

    #[error("Resource not enough: {0}")]
    ResourceNotEnough(String),

    #[error("Affinity schedule failed: {0}")]
    AffinityScheduleFailed(String),

    #[error("No preemptable instance found")]
    NoPreemptableInstance,

    #[error("Schedule canceled: {0}")]
    Canceled(String),

    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Group {group} failed: {message}")]
    GroupFailed { group: String, message: String },

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Object {0} has no owner (reference count is zero)")]
    ZeroReference(String),

    #[error("Nested id set of object {0} contains itself")]
    CircularNestedRef(String),

    #[error("Meta storage error: {0}")]
    MetaStorage(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Runtime finalized")]
    Finalized,

    #[error("User function exception: {0}")]
    UserFunction(String),

    #[error("Failed to load user code: {0}")]
    UserCodeLoad(String),

    #[error("Communication failure between runtime and bus: {0}")]
    RuntimeBus(String),

    #[error("Inner communication error: {0}")]
    InnerCommunication(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl PartialEq for StratusError {
    fn eq(&self, other: &Self) -> bool {
        // Io errors compare by their rendered message; everything else by
        // the rendered form as well, which includes the payload.
        format!("{self}") == format!("{other}")
    }
}

impl From<std::io::Error> for StratusError {
    fn from(e: std::io::Error) -> Self {
        StratusError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for StratusError {
    fn from(e: serde_json::Error) -> Self {
        StratusError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<uuid::Error> for StratusError {
    fn from(e: uuid::Error) -> Self {
        StratusError::Internal(format!("Failed to generate UUID: {e}"))
    }
}

impl StratusError {
    /// The numeric status code of this error as carried on the wire.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StratusError::Parameter(_) | StratusError::Config(_) => StatusCode::ParameterError,
            StratusError::ResourceNotEnough(_) => StatusCode::ResourceNotEnough,
            StratusError::AffinityScheduleFailed(_) => StatusCode::AffinityScheduleFailed,
            StratusError::NoPreemptableInstance => StatusCode::NoPreemptableInstance,
            StratusError::Canceled(_) => StatusCode::ScheduleCanceled,
            StratusError::RequestTimeout(_) => StatusCode::RequestTimeOut,
            StratusError::InstanceNotFound(_) => StatusCode::InstanceNotFound,
            StratusError::GroupNotFound(_) => StatusCode::GroupScheduleFailed,
            StratusError::GroupFailed { .. } => StatusCode::GroupExitTogether,
            StratusError::ZeroReference(_) | StratusError::CircularNestedRef(_) => {
                StatusCode::ParameterError
            }
            StratusError::MetaStorage(_) => StatusCode::MetaStoragePutError,
            StratusError::Finalized => StatusCode::Finalized,
            StratusError::UserFunction(_) => StatusCode::UserFunctionException,
            StratusError::UserCodeLoad(_) => StatusCode::UserCodeLoad,
            StratusError::RuntimeBus(_) => StatusCode::RequestBetweenRuntimeBus,
            StratusError::InnerCommunication(_) | StratusError::ChannelClosed(_) => {
                StatusCode::InnerCommunication
            }
            _ => StatusCode::InnerSystemError,
        }
    }
}

/// Numeric status codes carried on the wire. Codes are partitioned into
/// ranges of 10000 per component; 0 is success and -1 the untyped failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    CommonFail = -1,
    RequestTimeOut = 1001,

    // 10000 range: validation.
    ParameterError = 10001,
    JsonParseError = 10002,

    // 20000 range: scheduler domain.
    ResourceNotEnough = 20001,
    AffinityScheduleFailed = 20002,
    NoPreemptableInstance = 20003,
    ScheduleCanceled = 20004,

    // 30000 range: instance groups.
    GroupScheduleFailed = 30001,
    GroupParentFailed = 30002,
    GroupExitTogether = 30003,

    // 40000 range: instance health.
    InstanceNotFound = 40001,
    HeartbeatLost = 40002,
    SubHealth = 40003,

    // 50000 range: user code.
    UserCodeLoad = 50001,
    UserFunctionException = 50002,

    // 60000 range: transport.
    RequestBetweenRuntimeBus = 60001,
    InnerCommunication = 60002,
    InnerSystemError = 60003,

    // 70000 range: metadata storage.
    MetaStoragePutError = 70001,
    MetaStorageDeleteError = 70002,
    MetaStorageWatchError = 70003,

    // 80000 range: client runtime lifecycle.
    Finalized = 80001,
}

impl StatusCode {
    /// Whether a schedule failure with this code may park the request in the
    /// pending queue instead of failing it, given the caller's timeout.
    pub fn need_suspend(self, timeout_ms: u64) -> bool {
        matches!(
            self,
            StatusCode::ResourceNotEnough | StatusCode::AffinityScheduleFailed
        ) && timeout_ms != 0
    }

    /// Whether the client runtime may transparently retry a request that
    /// failed with this code.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            StatusCode::RequestBetweenRuntimeBus | StatusCode::InnerCommunication
        )
    }
}

/// The stable, client-visible error codes. Internal codes are folded onto
/// this set at the public edge so clients never depend on internal ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum PosixCode {
    ErrNone,
    ErrParamInvalid,
    ErrResourceNotEnough,
    ErrInstanceNotFound,
    ErrInstanceSubHealth,
    ErrInnerCommunication,
    ErrEtcdOperationError,
    ErrInnerSystemError,
    ErrUserFunctionException,
}

/// Folds an internal status code onto the posix-style set.
pub fn code_to_posix(code: StatusCode) -> PosixCode {
    match code {
        StatusCode::Success => PosixCode::ErrNone,
        StatusCode::ParameterError | StatusCode::JsonParseError => PosixCode::ErrParamInvalid,
        StatusCode::ResourceNotEnough
        | StatusCode::AffinityScheduleFailed
        | StatusCode::NoPreemptableInstance => PosixCode::ErrResourceNotEnough,
        StatusCode::InstanceNotFound => PosixCode::ErrInstanceNotFound,
        StatusCode::SubHealth => PosixCode::ErrInstanceSubHealth,
        StatusCode::RequestBetweenRuntimeBus | StatusCode::InnerCommunication => {
            PosixCode::ErrInnerCommunication
        }
        StatusCode::MetaStoragePutError
        | StatusCode::MetaStorageDeleteError
        | StatusCode::MetaStorageWatchError => PosixCode::ErrEtcdOperationError,
        StatusCode::UserFunctionException | StatusCode::UserCodeLoad => {
            PosixCode::ErrUserFunctionException
        }
        _ => PosixCode::ErrInnerSystemError,
    }
}

/// A status as carried across a hop: a numeric code plus a joined message.
/// Detail lines are appended at each boundary the status crosses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Status {
            code: StatusCode::Success,
            message: String::new(),
        }
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Success
    }

    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }

    /// Appends a detail line, preserving the original code.
    pub fn with_detail(mut self, detail: impl AsRef<str>) -> Self {
        if self.message.is_empty() {
            self.message = detail.as_ref().to_string();
        } else {
            self.message = format!("{}; {}", self.message, detail.as_ref());
        }
        self
    }

    pub fn to_posix(&self) -> PosixCode {
        code_to_posix(self.code)
    }
}

impl From<&StratusError> for Status {
    fn from(e: &StratusError) -> Self {
        Status::new(e.status_code(), e.to_string())
    }
}

impl From<StratusError> for Status {
    fn from(e: StratusError) -> Self {
        Status::from(&e)
    }
}
