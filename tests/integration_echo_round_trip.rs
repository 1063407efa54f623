//! Two-way echo over real sockets, oneway semantics, ping-backs and
//! transport-filter negotiation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vector_rpc::filter::FilterId;
use vector_rpc::{
    ClientOptions, ClientStub, Endpoint, RemoteException, RpcServer, ServerConfig, ServiceFn,
};

const ECHO_METHOD: u32 = 1;
const PING_METHOD: u32 = 2;
const SLOW_METHOD: u32 = 3;

fn echo_server(config: ServerConfig) -> (RpcServer, Arc<AtomicU64>) {
    let server = RpcServer::new(config);
    let pings = Arc::new(AtomicU64::new(0));
    let ping_counter = Arc::clone(&pings);
    server.bind(
        "Echo",
        ServiceFn(move |_session, method_id, params: Vec<u8>| {
            let ping_counter = Arc::clone(&ping_counter);
            async move {
                match method_id {
                    ECHO_METHOD => Ok(params),
                    PING_METHOD => {
                        ping_counter.fetch_add(1, Ordering::SeqCst);
                        Ok(Vec::new())
                    }
                    SLOW_METHOD => {
                        tokio::time::sleep(Duration::from_millis(1500)).await;
                        Ok(params)
                    }
                    other => Err(RemoteException::new(1, format!("unknown method {other}"))),
                }
            }
        }),
    );
    (server, pings)
}

async fn started_tcp_server(config: ServerConfig) -> (RpcServer, Arc<AtomicU64>, u16) {
    let mut config = config;
    config.endpoints = vec![Endpoint::tcp("127.0.0.1", 0)];
    let (server, pings) = echo_server(config);
    server.start().await.unwrap();
    let addr = server.bound_addr(0).unwrap();
    let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();
    (server, pings, port)
}

#[tokio::test]
async fn test_two_way_echo_over_tcp() {
    let (server, _, port) = started_tcp_server(ServerConfig::default()).await;

    let mut client = ClientStub::new(Endpoint::tcp("127.0.0.1", port)).unwrap();
    let reply: String = client
        .call("Echo", ECHO_METHOD, &"hello".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "hello");
    assert!(client.last_request_size() >= 5);
    assert!(client.last_response_size() >= 5);

    client.disconnect().await;
    server.stop();
}

#[tokio::test]
async fn test_two_way_echo_over_local_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.sock");
    let mut config = ServerConfig::default();
    config.endpoints = vec![Endpoint::local(&path)];
    let (server, _) = echo_server(config);
    server.start().await.unwrap();

    let mut client = ClientStub::new(Endpoint::local(&path)).unwrap();
    let reply: Vec<u8> = client
        .call("Echo", ECHO_METHOD, &vec![1u8, 2, 3])
        .await
        .unwrap();
    assert_eq!(reply, vec![1, 2, 3]);
    server.stop();
}

#[tokio::test]
async fn test_two_way_echo_over_udp() {
    let mut config = ServerConfig::default();
    config.endpoints = vec![Endpoint::udp("127.0.0.1", 0)];
    let (server, _) = echo_server(config);
    server.start().await.unwrap();
    let addr = server.bound_addr(0).unwrap();
    let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

    let mut client = ClientStub::new(Endpoint::udp("127.0.0.1", port)).unwrap();
    let reply: String = client
        .call("Echo", ECHO_METHOD, &"datagram".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "datagram");
    server.stop();
}

#[tokio::test]
async fn test_two_way_echo_over_http() {
    let mut config = ServerConfig::default();
    config.endpoints = vec![Endpoint::parse("http://127.0.0.1:0/rpc").unwrap()];
    let (server, _) = echo_server(config);
    server.start().await.unwrap();
    let addr = server.bound_addr(0).unwrap();
    let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

    let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{port}/rpc")).unwrap();
    let mut client = ClientStub::new(endpoint).unwrap();
    let reply: String = client
        .call("Echo", ECHO_METHOD, &"over http".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "over http");
    server.stop();
}

#[tokio::test]
async fn test_oneway_ping_increments_counter_exactly_n_times() {
    let (server, pings, port) = started_tcp_server(ServerConfig::default()).await;

    let mut client = ClientStub::new(Endpoint::tcp("127.0.0.1", port)).unwrap();
    for _ in 0..7 {
        client.call_oneway("Echo", PING_METHOD, &()).await.unwrap();
    }
    // Oneway calls return before dispatch; issue a two-way call to
    // order against the server's queue.
    let _: Vec<u8> = client.call("Echo", ECHO_METHOD, &Vec::<u8>::new()).await.unwrap();
    assert_eq!(pings.load(Ordering::SeqCst), 7);
    server.stop();
}

#[tokio::test]
async fn test_unknown_service_is_recoverable() {
    let (server, _, port) = started_tcp_server(ServerConfig::default()).await;

    let mut client = ClientStub::new(Endpoint::tcp("127.0.0.1", port)).unwrap();
    let err = client
        .call::<(), ()>("NoSuchService", 1, &())
        .await
        .unwrap_err();
    match err {
        vector_rpc::CallError::Rpc(e) => {
            assert_eq!(e.code, vector_rpc::ErrorCode::NoServerBinding)
        }
        other => panic!("unexpected error {other:?}"),
    }
    // The connection survives a dispatch error.
    let reply: String = client
        .call("Echo", ECHO_METHOD, &"still here".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "still here");
    server.stop();
}

#[tokio::test]
async fn test_remote_exception_is_delivered_verbatim() {
    let (server, _, port) = started_tcp_server(ServerConfig::default()).await;

    let mut client = ClientStub::new(Endpoint::tcp("127.0.0.1", port)).unwrap();
    let err = client.call::<(), ()>("Echo", 99, &()).await.unwrap_err();
    match err {
        vector_rpc::CallError::Remote(e) => {
            assert_eq!(e.sub_code, 1);
            assert!(e.message.contains("99"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    server.stop();
}

#[tokio::test]
async fn test_pingback_keeps_slow_call_alive() {
    let (server, _, port) = started_tcp_server(ServerConfig::default()).await;

    // Receive timeout shorter than the handler; ping-backs must re-arm it.
    let opts = ClientOptions {
        call_timeout: Duration::from_millis(800),
        pingback_interval_ms: 200,
        ..ClientOptions::default()
    };
    let mut client = ClientStub::with_options(Endpoint::tcp("127.0.0.1", port), opts).unwrap();
    let reply: String = client
        .call("Echo", SLOW_METHOD, &"slow".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "slow");
    server.stop();
}

#[tokio::test]
async fn test_negotiated_compression_and_auth_filters() {
    let mut config = ServerConfig::default();
    config.auth_secret = Some(b"test secret".to_vec());
    let (server, _, port) = started_tcp_server(config).await;

    let opts = ClientOptions {
        auth_secret: Some(b"test secret".to_vec()),
        ..ClientOptions::default()
    };
    let mut client = ClientStub::with_options(Endpoint::tcp("127.0.0.1", port), opts).unwrap();
    client
        .request_transport_filters(&[FilterId::Zlib, FilterId::Negotiate])
        .await
        .unwrap();

    // Application traffic now flows through the fresh chain.
    let payload = vec![7u8; 20_000];
    let reply: Vec<u8> = client.call("Echo", ECHO_METHOD, &payload).await.unwrap();
    assert_eq!(reply, payload);
    server.stop();
}

#[tokio::test]
async fn test_cancel_wakes_blocked_call() {
    let (server, _, port) = started_tcp_server(ServerConfig::default()).await;

    let opts = ClientOptions {
        call_timeout: Duration::from_secs(30),
        ..ClientOptions::default()
    };
    let mut client = ClientStub::with_options(Endpoint::tcp("127.0.0.1", port), opts).unwrap();
    let cancel = client.cancel_handle();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let err = client
        .call::<String, String>("Echo", SLOW_METHOD, &"blocked".to_string())
        .await
        .unwrap_err();
    match err {
        vector_rpc::CallError::Rpc(e) => {
            assert_eq!(e.code, vector_rpc::ErrorCode::ClientCancel)
        }
        other => panic!("unexpected error {other:?}"),
    }
    canceller.await.unwrap();
    server.stop();
}
