//! Version negotiation: one auto-retry at the server's maxima.

use vector_rpc::{
    ClientOptions, ClientStub, Endpoint, RpcServer, ServerConfig, ServiceFn,
};

async fn server_with_max_runtime(max_runtime_version: u32) -> (RpcServer, u16) {
    let config = ServerConfig {
        endpoints: vec![Endpoint::tcp("127.0.0.1", 0)],
        max_runtime_version,
        ..ServerConfig::default()
    };
    let server = RpcServer::new(config);
    server.bind(
        "Echo",
        ServiceFn(|_session, _method, params: Vec<u8>| async move { Ok(params) }),
    );
    server.start().await.unwrap();
    let addr = server.bound_addr(0).unwrap();
    let port = addr.rsplit(':').next().unwrap().parse().unwrap();
    (server, port)
}

#[tokio::test]
async fn test_auto_versioning_retries_exactly_once() {
    let (server, port) = server_with_max_runtime(12).await;

    // Client prefers a newer runtime than the server supports.
    let opts = ClientOptions {
        runtime_version: 13,
        ..ClientOptions::default()
    };
    let mut client = ClientStub::with_options(Endpoint::tcp("127.0.0.1", port), opts).unwrap();
    assert_eq!(client.get_tries(), 0);

    let reply: String = client
        .call("Echo", 1, &"negotiated".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "negotiated");
    // Exactly one mismatch round-trip, then success at the lowered
    // version.
    assert_eq!(client.get_tries(), 1);
    assert_eq!(client.runtime_version(), 12);

    // Subsequent calls stick to the negotiated version with no retries.
    let reply: String = client.call("Echo", 1, &"again".to_string()).await.unwrap();
    assert_eq!(reply, "again");
    assert_eq!(client.get_tries(), 1);
    server.stop();
}

#[tokio::test]
async fn test_mismatch_surfaces_when_auto_versioning_disabled() {
    let (server, port) = server_with_max_runtime(12).await;

    let opts = ClientOptions {
        runtime_version: 13,
        auto_versioning: false,
        ..ClientOptions::default()
    };
    let mut client = ClientStub::with_options(Endpoint::tcp("127.0.0.1", port), opts).unwrap();
    let err = client
        .call::<String, String>("Echo", 1, &"x".to_string())
        .await
        .unwrap_err();
    match err {
        vector_rpc::CallError::Rpc(e) => {
            assert_eq!(e.code, vector_rpc::ErrorCode::VersionMismatch);
            // arg0 carries the server's maximum supported runtime.
            assert_eq!(e.arg0, 12);
        }
        other => panic!("unexpected error {other:?}"),
    }
    server.stop();
}

#[tokio::test]
async fn test_version_floor_has_no_legacy_fallback() {
    let (server, port) = server_with_max_runtime(13).await;

    // Below the supported floor: the retry lowers nothing (the server
    // advertises a max the client already satisfies), so the error
    // surfaces after one retry.
    let opts = ClientOptions {
        runtime_version: 11,
        ..ClientOptions::default()
    };
    let mut client = ClientStub::with_options(Endpoint::tcp("127.0.0.1", port), opts).unwrap();
    let err = client
        .call::<String, String>("Echo", 1, &"x".to_string())
        .await
        .unwrap_err();
    match err {
        vector_rpc::CallError::Rpc(e) => {
            assert_eq!(e.code, vector_rpc::ErrorCode::VersionMismatch)
        }
        other => panic!("unexpected error {other:?}"),
    }
    server.stop();
}
