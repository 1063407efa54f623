//! Index quality: IVF-PQ recall against linear brute force, and the
//! search service over a real connection.

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use vector_rpc::ivf::distance::l2_sqr;
use vector_rpc::ivf::index_ivfpq::PqParams;
use vector_rpc::ivf::service::{RemoteIndex, VectorSearchService, VECTOR_SEARCH_SERVICE};
use vector_rpc::ivf::{IndexIvfPq, IndexStatus, IvfParams};
use vector_rpc::{ClientStub, Endpoint, RpcServer, ServerConfig};

fn random_corpus(n: usize, d: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * d).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn brute_force_top_k(data: &[f32], d: usize, query: &[f32], k: usize) -> Vec<u64> {
    let n = data.len() / d;
    let mut all: Vec<(u64, f32)> = (0..n)
        .map(|i| (i as u64, l2_sqr(query, &data[i * d..(i + 1) * d])))
        .collect();
    all.sort_by(|a, b| a.1.total_cmp(&b.1));
    all.truncate(k);
    all.into_iter().map(|(id, _)| id).collect()
}

#[test]
fn test_ivfpq_recall_at_10_against_brute_force() {
    let n = 10_000;
    let d = 128;
    let data = random_corpus(n, d, 404);

    let dir = tempfile::tempdir().unwrap();
    let mut index = IndexIvfPq::new(
        IvfParams {
            n,
            d,
            l: 1000,
            kc: 64,
        },
        PqParams { mp: 16, kp: 256 },
        dir.path().join("index"),
        dir.path().join("db"),
        "recall",
        IndexStatus::Local,
    )
    .unwrap();
    index.set_training_config(n, 1234);
    index.train(&data).unwrap();
    index.populate(&data).unwrap();

    let mut rng = StdRng::seed_from_u64(99);
    let queries: Vec<Vec<f32>> = (0..100)
        .map(|_| (0..d).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect();

    let probes = index.top_w_batch(16, &queries).unwrap();
    let results = index.top_k_batch(10, &queries, &probes).unwrap();

    let mut hits = 0usize;
    let mut total = 0usize;
    for (query, (ids, dists)) in queries.iter().zip(results.iter()) {
        assert!(ids.len() <= 10);
        assert_eq!(ids.len(), dists.len());
        for pair in dists.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        let truth: HashSet<u64> = brute_force_top_k(&data, d, query, 10).into_iter().collect();
        total += truth.len();
        hits += ids.iter().filter(|id| truth.contains(id)).count();
    }
    let recall = hits as f64 / total as f64;
    assert!(recall >= 0.8, "recall@10 too low: {recall:.3}");
}

#[tokio::test]
async fn test_search_service_over_tcp_matches_local_index() {
    let n = 2_000;
    let d = 32;
    let data = random_corpus(n, d, 7);

    let dir = tempfile::tempdir().unwrap();
    let mut index = IndexIvfPq::new(
        IvfParams { n, d, l: 500, kc: 16 },
        PqParams { mp: 8, kp: 64 },
        dir.path().join("index"),
        dir.path().join("db"),
        "served",
        IndexStatus::Local,
    )
    .unwrap();
    index.set_training_config(n, 2);
    index.train(&data).unwrap();
    index.populate(&data).unwrap();

    // Local ground truth before the index moves behind the server.
    let query: Vec<f32> = data[0..d].to_vec();
    let probe = index.top_w(4, &query).unwrap();
    let (want_ids, _) = index.top_k(5, &query, &probe).unwrap();

    let config = ServerConfig {
        endpoints: vec![Endpoint::tcp("127.0.0.1", 0)],
        ..ServerConfig::default()
    };
    let server = RpcServer::new(config);
    server.bind(
        VECTOR_SEARCH_SERVICE,
        VectorSearchService::new(Arc::new(RwLock::new(index))),
    );
    server.start().await.unwrap();
    let addr = server.bound_addr(0).unwrap();
    let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

    let mut stub = ClientStub::new(Endpoint::tcp("127.0.0.1", port)).unwrap();
    let mut remote = RemoteIndex::new(&mut stub);

    let info = remote.info().await.unwrap();
    assert_eq!(info.ntotal, n);
    assert_eq!(info.d, d);

    let probes = remote.top_w(4, vec![query.clone()]).await.unwrap();
    assert_eq!(probes.len(), 1);
    let result = remote.top_k(5, vec![query], probes).await.unwrap();
    assert_eq!(result.ids[0], want_ids);

    server.stop();
}
