//! IVF and IVF-PQ vector indexes.
//!
//! An inverted-file index partitions the corpus into `kc` coarse clusters
//! via a trained coarse quantizer. Each cluster keeps a posting list of
//! vector ids and a parallel segment holding either the raw vectors (IVF)
//! or their product-quantized codes (IVF-PQ). Queries probe the `w`
//! nearest clusters and scan at most `L` candidate vectors.

pub mod distance;
pub mod index_ivf;
pub mod index_ivfpq;
pub mod kmeans;
pub mod segment_io;
pub mod service;

pub use index_ivf::IndexIvf;
pub use index_ivfpq::{DistanceTable, IndexIvfPq};

pub type VectorId = u64;
pub type ClusterId = usize;

/// Whether index segments live on local disk or are served remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Local,
    Remote,
}

/// Coarse-quantizer training sweeps.
pub const CQ_TRAIN_ITERATIONS: usize = 12;

/// Product-quantizer training sweeps per subspace.
pub const PQ_TRAIN_ITERATIONS: usize = 6;

pub const CQ_CENTERS_FILE: &str = "cq_centers";
pub const PQ_CENTERS_FILE: &str = "pq_centers";
pub const ID_FILE_PREFIX: &str = "id_";
pub const VECTOR_FILE_PREFIX: &str = "vector_";
pub const POSTING_LISTS_SIZE_FILE: &str = "posting_lists_size";

/// Index-side parameters shared by both index kinds.
#[derive(Debug, Clone)]
pub struct IvfParams {
    /// Corpus size.
    pub n: usize,
    /// Vector dimension.
    pub d: usize,
    /// Per-query scan budget: at most this many vectors are visited.
    pub l: usize,
    /// Number of coarse clusters.
    pub kc: usize,
}
