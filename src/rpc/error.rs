//! Error kinds surfaced to RPC callers.

use std::time::Duration;

use thiserror::Error;

use crate::rpc::codec::CodecError;
use crate::rpc::message::RpcStatus;

/// Boxed error returned by plugins (balancers, services).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why an RPC call failed.
///
/// Cloneable so a finished call's outcome can be handed to every later reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// No address could be chosen or no connection could be established.
    #[error("connect error: {0}")]
    Connect(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Another reader is already waiting on this call's response.
    #[error("response is already being consumed by another caller")]
    ConcurrentConsumption,

    /// The server executed the call and reported a failure.
    #[error("remote error {status}: {message}")]
    Remote { status: RpcStatus, message: String },

    /// The connection was lost while the call was in flight.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request context is still in use by another call")]
    ContextInUse,

    #[error("no such method '{0}'")]
    NoSuchMethod(String),

    #[error("method '{method}' takes {expected} arguments, got {found}")]
    Arguments {
        method: String,
        expected: usize,
        found: usize,
    },

    #[error("instance error: {0}")]
    Instance(#[from] InstanceError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("blocking call made from inside an async runtime")]
    BlockingInAsyncContext,

    /// A filter ended the chain without sending or completing the call.
    #[error("call to '{0}' was stopped by a filter")]
    Stopped(String),
}

impl RpcError {
    /// Metric label for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Connect(_) => "connect",
            RpcError::Timeout(_) => "timeout",
            RpcError::ConcurrentConsumption => "concurrent_consumption",
            RpcError::Remote { .. } => "remote",
            RpcError::Transport(_) => "transport",
            RpcError::ContextInUse => "context_in_use",
            RpcError::NoSuchMethod(_) => "no_such_method",
            RpcError::Arguments { .. } => "arguments",
            RpcError::Instance(_) => "instance",
            RpcError::Codec(_) => "codec",
            RpcError::BlockingInAsyncContext => "blocking",
            RpcError::Stopped(_) => "stopped",
        }
    }
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        RpcError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

/// Failure to build a method dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstanceError {
    #[error("{interface}: two methods resolve to the rpc name '{method}'")]
    DuplicateMethod { interface: String, method: String },

    #[error("{interface}.{method}: no parameter names available")]
    MissingParameterNames { interface: String, method: String },

    #[error("{interface}.{method}: {found} parameter names for {expected} parameters")]
    ParameterCount {
        interface: String,
        method: String,
        expected: usize,
        found: usize,
    },

    #[error("service '{request_mapping_name}' version '{version}' is already registered")]
    DuplicateService {
        request_mapping_name: String,
        version: String,
    },

    #[error("parameter descriptor file: {0}")]
    DescriptorFile(String),
}
