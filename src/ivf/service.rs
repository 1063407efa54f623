//! RPC surface of the vector index.
//!
//! Binds the index as an ordinary service so remote peers can probe and
//! search it; an index constructed with `IndexStatus::Remote` on the
//! client side pairs with this binding on the server side.

use super::{ClusterId, IndexIvfPq, VectorId};
use crate::client::ClientStub;
use crate::error::{CallError, ErrorCode, RemoteException, RpcError, RpcResult};
use crate::server::ServerMethod;
use crate::session::SharedCallSession;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Binding name of the search service.
pub const VECTOR_SEARCH_SERVICE: &str = "VectorSearchService";

pub const TOP_W_METHOD_ID: u32 = 1;
pub const TOP_K_METHOD_ID: u32 = 2;
pub const LOAD_SEGMENTS_METHOD_ID: u32 = 3;
pub const INFO_METHOD_ID: u32 = 4;

const EX_BAD_REQUEST: u32 = 1;
const EX_INDEX: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
pub struct TopWParams {
    pub queries: Vec<Vec<f32>>,
    pub w: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopWResult {
    pub probe_lists: Vec<Vec<u64>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopKParams {
    pub queries: Vec<Vec<f32>>,
    pub probe_lists: Vec<Vec<u64>>,
    pub k: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopKResult {
    pub ids: Vec<Vec<VectorId>>,
    pub distances: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadSegmentsParams {
    /// `None` loads every cluster.
    pub clusters: Option<Vec<u64>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub n: usize,
    pub d: usize,
    pub l: usize,
    pub kc: usize,
    pub mp: usize,
    pub kp: usize,
    pub ntotal: usize,
}

/// Server-side search service over a shared IVF-PQ index.
pub struct VectorSearchService {
    index: Arc<RwLock<IndexIvfPq>>,
}

impl VectorSearchService {
    pub fn new(index: Arc<RwLock<IndexIvfPq>>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl ServerMethod for VectorSearchService {
    async fn invoke(
        &self,
        _session: SharedCallSession,
        method_id: u32,
        params: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteException> {
        let bad = |e: bincode::Error| RemoteException::new(EX_BAD_REQUEST, e.to_string());
        let index_err = |e: anyhow::Error| RemoteException::new(EX_INDEX, e.to_string());
        match method_id {
            TOP_W_METHOD_ID => {
                let p: TopWParams = bincode::deserialize(&params).map_err(bad)?;
                let index = self.index.read();
                let probe_lists = index.top_w_batch(p.w, &p.queries).map_err(index_err)?;
                let result = TopWResult {
                    probe_lists: probe_lists
                        .into_iter()
                        .map(|l| l.into_iter().map(|c| c as u64).collect())
                        .collect(),
                };
                bincode::serialize(&result).map_err(bad)
            }
            TOP_K_METHOD_ID => {
                let p: TopKParams = bincode::deserialize(&params).map_err(bad)?;
                let probes: Vec<Vec<ClusterId>> = p
                    .probe_lists
                    .iter()
                    .map(|l| l.iter().map(|&c| c as ClusterId).collect())
                    .collect();
                let index = self.index.read();
                let results = index
                    .top_k_batch(p.k, &p.queries, &probes)
                    .map_err(index_err)?;
                let mut ids = Vec::with_capacity(results.len());
                let mut distances = Vec::with_capacity(results.len());
                for (i, d) in results {
                    ids.push(i);
                    distances.push(d);
                }
                bincode::serialize(&TopKResult { ids, distances }).map_err(bad)
            }
            LOAD_SEGMENTS_METHOD_ID => {
                let p: LoadSegmentsParams = bincode::deserialize(&params).map_err(bad)?;
                let mut index = self.index.write();
                match p.clusters {
                    Some(clusters) => {
                        let clusters: Vec<ClusterId> =
                            clusters.iter().map(|&c| c as ClusterId).collect();
                        index.load_segments(&clusters).map_err(index_err)?;
                    }
                    None => index.load_segments_all().map_err(index_err)?,
                }
                bincode::serialize(&()).map_err(bad)
            }
            INFO_METHOD_ID => {
                let index = self.index.read();
                let info = IndexInfo {
                    name: index.name().to_owned(),
                    n: index.params().n,
                    d: index.params().d,
                    l: index.params().l,
                    kc: index.params().kc,
                    mp: index.pq_params().mp,
                    kp: index.pq_params().kp,
                    ntotal: index.ntotal(),
                };
                bincode::serialize(&info).map_err(bad)
            }
            other => Err(RemoteException::new(
                EX_BAD_REQUEST,
                format!("unknown method {other}"),
            )),
        }
    }
}

fn map_call_error(e: CallError) -> RpcError {
    match e {
        CallError::Rpc(e) => e,
        CallError::Remote(e) => RpcError::with_what(ErrorCode::Deserialization, e.message),
    }
}

/// Client for an index whose segments are served remotely.
pub struct RemoteIndex<'a> {
    stub: &'a mut ClientStub,
}

impl<'a> RemoteIndex<'a> {
    pub fn new(stub: &'a mut ClientStub) -> Self {
        Self { stub }
    }

    pub async fn info(&mut self) -> RpcResult<IndexInfo> {
        self.stub
            .call(VECTOR_SEARCH_SERVICE, INFO_METHOD_ID, &())
            .await
            .map_err(map_call_error)
    }

    pub async fn top_w(&mut self, w: usize, queries: Vec<Vec<f32>>) -> RpcResult<Vec<Vec<u64>>> {
        let result: TopWResult = self
            .stub
            .call(
                VECTOR_SEARCH_SERVICE,
                TOP_W_METHOD_ID,
                &TopWParams { queries, w },
            )
            .await
            .map_err(map_call_error)?;
        Ok(result.probe_lists)
    }

    pub async fn top_k(
        &mut self,
        k: usize,
        queries: Vec<Vec<f32>>,
        probe_lists: Vec<Vec<u64>>,
    ) -> RpcResult<TopKResult> {
        self.stub
            .call(
                VECTOR_SEARCH_SERVICE,
                TOP_K_METHOD_ID,
                &TopKParams {
                    queries,
                    probe_lists,
                    k,
                },
            )
            .await
            .map_err(map_call_error)
    }

    pub async fn load_segments(&mut self, clusters: Option<Vec<u64>>) -> RpcResult<()> {
        self.stub
            .call(
                VECTOR_SEARCH_SERVICE,
                LOAD_SEGMENTS_METHOD_ID,
                &LoadSegmentsParams { clusters },
            )
            .await
            .map_err(map_call_error)
    }
}
