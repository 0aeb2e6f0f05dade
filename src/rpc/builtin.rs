//! `_ping` liveness service, registered on every NRPC server.

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::rpc::error::BoxError;
use crate::rpc::instance::{InterfaceDescriptor, MethodSignature};
use crate::rpc::server::RpcService;

pub const PING_MAPPING_NAME: &str = "_ping";

/// Shared by the server registration and by clients probing a server.
pub fn ping_interface() -> InterfaceDescriptor {
    InterfaceDescriptor::new("PingService")
        .request_mapping_name(PING_MAPPING_NAME)
        .method(MethodSignature::new("ping"))
        .method(MethodSignature::new("echo").param("message"))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PingService;

impl RpcService for PingService {
    fn interface(&self) -> InterfaceDescriptor {
        ping_interface()
    }

    fn call<'a>(&'a self, method: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Value, BoxError>> {
        Box::pin(async move {
            match method {
                "ping" => Ok(Value::from("pong")),
                "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
                other => Err(format!("unknown method {}", other).into()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ping_and_echo() {
        assert_eq!(PingService.call("ping", vec![]).await.unwrap(), json!("pong"));
        assert_eq!(PingService.call("echo", vec![json!("hi")]).await.unwrap(), json!("hi"));
        assert!(PingService.call("nope", vec![]).await.is_err());
    }
}
