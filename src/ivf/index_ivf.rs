//! Raw IVF index: coarse clusters over full vectors.

use super::distance::{l2_sqr, simd_architecture};
use super::kmeans::Codebook;
use super::segment_io;
use super::{
    ClusterId, IndexStatus, IvfParams, VectorId, CQ_CENTERS_FILE, CQ_TRAIN_ITERATIONS,
    ID_FILE_PREFIX, POSTING_LISTS_SIZE_FILE, VECTOR_FILE_PREFIX,
};
use anyhow::{ensure, Context, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub struct IndexIvf {
    params: IvfParams,
    index_path: PathBuf,
    db_path: PathBuf,
    name: String,
    status: IndexStatus,
    nsamples: usize,
    seed: Option<u64>,
    cq: Option<Codebook>,
    posting_lists: Vec<Vec<VectorId>>,
    segments: Vec<Vec<f32>>,
}

impl IndexIvf {
    pub fn new(
        params: IvfParams,
        index_path: impl Into<PathBuf>,
        db_path: impl Into<PathBuf>,
        name: impl Into<String>,
        status: IndexStatus,
    ) -> Result<Self> {
        ensure!(params.d > 0 && params.kc > 0, "degenerate index shape");
        info!(simd = simd_architecture(), "ivf index created");
        Ok(Self {
            params,
            index_path: index_path.into(),
            db_path: db_path.into(),
            name: name.into(),
            status,
            nsamples: 0,
            seed: None,
            cq: None,
            posting_lists: Vec::new(),
            segments: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &IvfParams {
        &self.params
    }

    pub fn status(&self) -> IndexStatus {
        self.status
    }

    /// Ready to serve queries: codebook present and segments resident.
    pub fn ready(&self) -> bool {
        self.cq.is_some() && !self.posting_lists.is_empty()
    }

    pub fn set_training_config(&mut self, nsamples: usize, seed: u64) {
        self.nsamples = nsamples;
        self.seed = Some(seed);
    }

    /// Total ids across posting lists.
    pub fn ntotal(&self) -> usize {
        self.posting_lists.iter().map(Vec::len).sum()
    }

    pub fn cluster_len(&self, c: ClusterId) -> usize {
        self.posting_lists.get(c).map_or(0, Vec::len)
    }

    /// Sample `nsamples` vectors (seeded shuffle of ids) and fit the
    /// coarse quantizer.
    pub fn train(&mut self, raw_data: &[f32]) -> Result<()> {
        ensure!(self.status == IndexStatus::Local, "index must be local");
        let seed = self.seed.context("training config not set")?;
        ensure!(self.nsamples > 0, "training config not set");
        let d = self.params.d;
        ensure!(raw_data.len() % d == 0, "data is not a multiple of dim");
        let nt = raw_data.len() / d;
        let mut nsamples = self.nsamples;
        if nsamples > nt {
            warn!(nsamples, available = nt, "clamping training sample count");
            nsamples = nt;
        }

        let mut ids: Vec<usize> = (0..nt).collect();
        ids.shuffle(&mut StdRng::seed_from_u64(seed));
        let mut traindata = Vec::with_capacity(nsamples * d);
        for &id in ids.iter().take(nsamples) {
            traindata.extend_from_slice(&raw_data[id * d..(id + 1) * d]);
        }

        let book = Codebook::fit(&traindata, d, self.params.kc, CQ_TRAIN_ITERATIONS, seed)?;
        info!(kc = self.params.kc, nsamples, "coarse quantizer trained");
        self.cq = Some(book);
        Ok(())
    }

    /// Assign every vector to its nearest coarse centroid and build the
    /// per-cluster segments. Insertion parallelizes across vectors with
    /// one lock per cluster.
    pub fn populate(&mut self, raw_data: &[f32]) -> Result<()> {
        ensure!(self.status == IndexStatus::Local, "index must be local");
        let cq = self.cq.as_ref().context("coarse quantizer not ready")?;
        let d = self.params.d;
        let n = raw_data.len() / d;
        ensure!(n == self.params.n, "corpus size mismatch");

        let kc = self.params.kc;
        let reserve = (n / kc).max(1);
        let lists: Vec<Mutex<Vec<VectorId>>> = (0..kc)
            .map(|_| Mutex::new(Vec::with_capacity(reserve)))
            .collect();

        (0..n).into_par_iter().for_each(|i| {
            let v = &raw_data[i * d..(i + 1) * d];
            let c = cq.predict_one(v);
            lists[c].lock().push(i as VectorId);
        });
        self.posting_lists = lists.into_iter().map(Mutex::into_inner).collect();

        self.segments = self
            .posting_lists
            .par_iter()
            .map(|list| {
                let mut segment = Vec::with_capacity(list.len() * d);
                for &id in list {
                    let id = id as usize;
                    segment.extend_from_slice(&raw_data[id * d..(id + 1) * d]);
                }
                segment
            })
            .collect();
        info!(n, kc, "ivf index populated");
        Ok(())
    }

    pub fn write_index(&self) -> Result<()> {
        ensure!(self.status == IndexStatus::Local, "index must be local");
        let cq = self.cq.as_ref().context("coarse quantizer not ready")?;
        std::fs::create_dir_all(&self.index_path)?;
        segment_io::write_f32s(&self.index_path.join(CQ_CENTERS_FILE), &cq.centers)
    }

    pub fn load_index(&mut self) -> Result<()> {
        let centers = segment_io::read_f32s(&self.index_path.join(CQ_CENTERS_FILE))?;
        self.cq = Some(Codebook::from_centers(
            self.params.kc,
            self.params.d,
            centers,
        )?);
        debug!("coarse quantizer codebook loaded");
        Ok(())
    }

    pub fn write_segments(&self) -> Result<()> {
        ensure!(self.status == IndexStatus::Local, "index must be local");
        std::fs::create_dir_all(&self.db_path)?;
        let mut sizes = Vec::with_capacity(self.params.kc);
        for (c, segment) in self.segments.iter().enumerate() {
            sizes.push(self.posting_lists[c].len() as u64);
            segment_io::write_f32s(
                &self.db_path.join(format!("{VECTOR_FILE_PREFIX}{c}")),
                segment,
            )?;
        }
        segment_io::write_u64s(&self.db_path.join(POSTING_LISTS_SIZE_FILE), &sizes)
    }

    pub fn write_posting_lists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.db_path)?;
        for (c, list) in self.posting_lists.iter().enumerate() {
            segment_io::write_u64s(&self.db_path.join(format!("{ID_FILE_PREFIX}{c}")), list)?;
        }
        Ok(())
    }

    /// Load every cluster's segment from disk.
    pub fn load_segments_all(&mut self) -> Result<()> {
        let all: Vec<ClusterId> = (0..self.params.kc).collect();
        self.load_segments(&all)
    }

    /// Make exactly `subset` resident: resident clusters not in the new
    /// subset are evicted, missing ones are loaded from disk.
    pub fn load_segments(&mut self, subset: &[ClusterId]) -> Result<()> {
        if self.posting_lists.is_empty() {
            self.posting_lists = vec![Vec::new(); self.params.kc];
            self.segments = vec![Vec::new(); self.params.kc];
        }
        let mut wanted: HashSet<ClusterId> = subset.iter().copied().collect();
        for c in 0..self.params.kc {
            if !self.posting_lists[c].is_empty() {
                if !wanted.remove(&c) {
                    self.posting_lists[c] = Vec::new();
                    self.segments[c] = Vec::new();
                }
            }
        }
        debug!(loading = wanted.len(), "loading segments");
        for c in wanted {
            ensure!(c < self.params.kc, "cluster id {c} out of range");
            self.posting_lists[c] =
                segment_io::read_u64s(&self.db_path.join(format!("{ID_FILE_PREFIX}{c}")))?;
            self.segments[c] =
                segment_io::read_f32s(&self.db_path.join(format!("{VECTOR_FILE_PREFIX}{c}")))?;
            ensure!(
                self.segments[c].len() == self.posting_lists[c].len() * self.params.d,
                "cluster {c}: segment/posting list size mismatch"
            );
        }
        Ok(())
    }

    /// Clusters currently resident in memory.
    pub fn resident_clusters(&self) -> Vec<ClusterId> {
        self.posting_lists
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.is_empty())
            .map(|(c, _)| c)
            .collect()
    }

    /// The `w` coarse clusters nearest to the query (the probe list).
    pub fn top_w(&self, w: usize, query: &[f32]) -> Result<Vec<ClusterId>> {
        let cq = self.cq.as_ref().context("coarse quantizer not ready")?;
        let mut score: Vec<(ClusterId, f32)> = (0..self.params.kc)
            .map(|c| (c, l2_sqr(query, cq.center(c))))
            .collect();
        let actual_w = w.min(self.params.kc);
        score.select_nth_unstable_by(actual_w.saturating_sub(1), |a, b| {
            a.1.total_cmp(&b.1)
        });
        score.truncate(actual_w);
        score.sort_unstable_by(|a, b| a.1.total_cmp(&b.1));
        Ok(score.into_iter().map(|(c, _)| c).collect())
    }

    /// Probe lists for a batch of queries, parallelized across queries.
    pub fn top_w_batch(&self, w: usize, queries: &[Vec<f32>]) -> Result<Vec<Vec<ClusterId>>> {
        queries.par_iter().map(|q| self.top_w(w, q)).collect()
    }

    /// Scan the probe list and return the `k` nearest ids with their
    /// distances. Stops once the per-query budget `L` is exhausted.
    pub fn top_k(
        &self,
        k: usize,
        query: &[f32],
        probe: &[ClusterId],
    ) -> Result<(Vec<VectorId>, Vec<f32>)> {
        ensure!(self.ready(), "index must be populated before querying");
        let d = self.params.d;
        let l = self.params.l;
        let mut score: Vec<(VectorId, f32)> = Vec::with_capacity(l);
        let mut searched = 0usize;

        'probe: for &c in probe {
            ensure!(c < self.params.kc, "cluster id {c} out of range");
            let list = &self.posting_lists[c];
            let segment = &self.segments[c];
            for (j, &id) in list.iter().enumerate() {
                if searched >= l {
                    break 'probe;
                }
                let dist = l2_sqr(query, &segment[j * d..(j + 1) * d]);
                score.push((id, dist));
                searched += 1;
            }
        }

        let actual_k = k.min(score.len());
        if actual_k > 0 {
            score.select_nth_unstable_by(actual_k - 1, |a, b| a.1.total_cmp(&b.1));
            score.truncate(actual_k);
            score.sort_unstable_by(|a, b| a.1.total_cmp(&b.1));
        } else {
            score.clear();
        }
        debug!(searched, returned = score.len(), "ivf scan complete");
        let ids = score.iter().map(|s| s.0).collect();
        let dists = score.iter().map(|s| s.1).collect();
        Ok((ids, dists))
    }

    /// Batched search, parallelized across queries.
    pub fn top_k_batch(
        &self,
        k: usize,
        queries: &[Vec<f32>],
        probes: &[Vec<ClusterId>],
    ) -> Result<Vec<(Vec<VectorId>, Vec<f32>)>> {
        ensure!(queries.len() == probes.len(), "query/probe count mismatch");
        queries
            .par_iter()
            .zip(probes.par_iter())
            .map(|(q, p)| self.top_k(k, q, p))
            .collect()
    }
}
