//! NRPC calls through the shared port.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde_json::json;

use polyport::config::ServerConfig;
use polyport::load_balancer::{FixedAddress, RoundRobin};
use polyport::rpc::{
    ping_interface, ClientRegistry, ClientSettings, FilterChain, RequestContext, RpcClientProxy, RpcError, RpcFilter,
    RpcStatus, TraceIdFilter,
};

mod common;

fn settings() -> ClientSettings {
    ClientSettings {
        connect_timeout: Duration::from_secs(2),
        ..ClientSettings::default()
    }
}

#[tokio::test]
async fn echo_round_trip() {
    let server = common::start_server(ServerConfig::default()).await;
    let registry = Arc::new(ClientRegistry::new(settings()));
    let proxy = RpcClientProxy::new(
        common::echo_interface(),
        registry,
        Arc::new(FixedAddress(server.addr)),
    )
    .with_filter(Arc::new(TraceIdFilter));

    let reply = proxy.invoke("echo", vec![json!("hi")]).await.unwrap();
    assert_eq!(reply, json!("hi"));

    let typed: String = proxy.call("echo", vec![json!("again")]).await.unwrap();
    assert_eq!(typed, "again");
}

/// Refuses calls that carry no `token` attachment.
struct RequireToken;

impl RpcFilter for RequireToken {
    fn order(&self) -> Option<i32> {
        Some(1)
    }

    fn do_filter<'a>(&'a self, ctx: &'a RequestContext, chain: FilterChain<'a>) -> BoxFuture<'a, Result<(), RpcError>> {
        if ctx.attachment("token").is_some() {
            chain.do_filter(ctx)
        } else {
            Box::pin(async { Ok(()) })
        }
    }
}

#[tokio::test]
async fn filter_that_stops_the_chain_sends_nothing() {
    let peer = common::start_mock_nrpc_server(false).await;
    let registry = Arc::new(ClientRegistry::new(settings()));
    let proxy = RpcClientProxy::new(common::echo_interface(), registry, Arc::new(FixedAddress(peer.addr)))
        .with_filter(Arc::new(RequireToken));

    let err = proxy.invoke("echo", vec![json!("should not leave")]).await.unwrap_err();
    assert_eq!(err, RpcError::Stopped("echo".into()));

    // Give a stray frame time to arrive before counting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(peer.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn builtin_ping_answers() {
    let server = common::start_server(ServerConfig::default()).await;
    let registry = Arc::new(ClientRegistry::new(settings()));
    let proxy = RpcClientProxy::new(ping_interface(), registry, Arc::new(FixedAddress(server.addr)));
    assert_eq!(proxy.invoke("ping", vec![]).await.unwrap(), json!("pong"));
}

#[tokio::test]
async fn call_times_out_at_its_deadline() {
    let server = common::start_server(ServerConfig::default()).await;
    let registry = Arc::new(ClientRegistry::new(settings()));
    let proxy = RpcClientProxy::new(
        common::echo_interface(),
        registry,
        Arc::new(FixedAddress(server.addr)),
    );
    // Warm up so connection setup is not part of the measurement.
    proxy.invoke("echo", vec![json!("warm")]).await.unwrap();

    let start = Instant::now();
    let err = proxy
        .invoke_with_timeout("slow", vec![json!(400)], 50)
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err, RpcError::Timeout(Duration::from_millis(50)));
    assert!(elapsed >= Duration::from_millis(50), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(300), "{:?}", elapsed);

    // The connection survives the timeout.
    assert_eq!(proxy.invoke("echo", vec![json!("still up")]).await.unwrap(), json!("still up"));
}

#[tokio::test]
async fn remote_failures_carry_their_status() {
    let server = common::start_server(ServerConfig::default()).await;
    let registry = Arc::new(ClientRegistry::new(settings()));
    let proxy = RpcClientProxy::new(
        common::echo_interface(),
        registry,
        Arc::new(FixedAddress(server.addr)),
    );

    match proxy.invoke("fail", vec![]).await {
        Err(RpcError::Remote { status, message }) => {
            assert_eq!(status, RpcStatus::ServerError);
            assert!(message.contains("service failure"));
        }
        other => panic!("unexpected {:?}", other),
    }

    let err = proxy.invoke("missing", vec![]).await.unwrap_err();
    assert_eq!(err, RpcError::NoSuchMethod("missing".into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_calls_share_one_client() {
    let server = common::start_server(ServerConfig::default()).await;
    let registry = Arc::new(ClientRegistry::new(settings()));
    let proxy = Arc::new(RpcClientProxy::new(
        common::echo_interface(),
        Arc::clone(&registry),
        Arc::new(RoundRobin::new(vec![server.addr])),
    ));

    let calls: Vec<_> = (0..16)
        .map(|i| {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.invoke("echo", vec![json!(i)]).await })
        })
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), json!(i));
    }

    assert_eq!(registry.constructed(), 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.in_flight(server.addr), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_order_responses_reach_their_callers() {
    let server = common::start_server(ServerConfig::default()).await;
    let registry = Arc::new(ClientRegistry::new(settings()));
    let proxy = Arc::new(RpcClientProxy::new(
        common::echo_interface(),
        registry,
        Arc::new(FixedAddress(server.addr)),
    ));
    proxy.invoke("echo", vec![json!("warm")]).await.unwrap();

    let slow = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.invoke("slow", vec![json!(200)]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = proxy.invoke("echo", vec![json!("fast")]).await.unwrap();
    assert_eq!(fast, json!("fast"));
    assert!(!slow.is_finished());
    assert_eq!(slow.await.unwrap().unwrap(), json!(200));
}

#[test]
fn blocking_facade_from_plain_threads() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = runtime.block_on(common::start_server(ServerConfig::default()));
    let addr = server.addr;

    let registry = Arc::new(ClientRegistry::new(settings()));
    let proxy = Arc::new(RpcClientProxy::new(
        common::echo_interface(),
        registry,
        Arc::new(FixedAddress(addr)),
    ));

    let threads: Vec<_> = (0..4)
        .map(|i| {
            let proxy = Arc::clone(&proxy);
            std::thread::spawn(move || proxy.invoke_blocking("echo", vec![json!(i)]))
        })
        .collect();
    for (i, thread) in threads.into_iter().enumerate() {
        assert_eq!(thread.join().unwrap().unwrap(), json!(i));
    }

    drop(server);
    drop(runtime);
}
