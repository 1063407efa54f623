//! IVF-PQ index: coarse clusters over product-quantized codes.
//!
//! Each stored vector becomes `mp` one-byte subcodes, one per subspace of
//! dimension `dp = D / mp`. Queries precompute a distance table against
//! every sub-centroid and approximate candidate distances as the sum of
//! table lookups (asymmetric distance computation).

use super::distance::{l2_sqr, simd_architecture};
use super::kmeans::Codebook;
use super::segment_io;
use super::{
    ClusterId, IndexStatus, IvfParams, VectorId, CQ_CENTERS_FILE, CQ_TRAIN_ITERATIONS,
    ID_FILE_PREFIX, POSTING_LISTS_SIZE_FILE, PQ_CENTERS_FILE, PQ_TRAIN_ITERATIONS,
    VECTOR_FILE_PREFIX,
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

/// Product-quantizer shape.
#[derive(Debug, Clone)]
pub struct PqParams {
    /// Number of subspaces; must divide the vector dimension.
    pub mp: usize,
    /// Sub-centroids per subspace; 8-bit codes cap this at 256.
    pub kp: usize,
}

/// Query-time table of squared distances from the query's subvectors to
/// every sub-centroid, row-major `mp × kp`.
pub struct DistanceTable {
    kp: usize,
    data: Vec<f32>,
}

impl DistanceTable {
    pub fn new(mp: usize, kp: usize) -> Self {
        Self {
            kp,
            data: vec![0.0; mp * kp],
        }
    }

    #[inline]
    pub fn set(&mut self, m: usize, ks: usize, value: f32) {
        self.data[m * self.kp + ks] = value;
    }

    #[inline]
    pub fn get(&self, m: usize, ks: usize) -> f32 {
        self.data[m * self.kp + ks]
    }

    /// Approximate distance to a PQ code: sum of per-subspace lookups.
    #[inline]
    pub fn adist(&self, code: &[u8]) -> f32 {
        code.iter()
            .enumerate()
            .map(|(m, &c)| self.data[m * self.kp + c as usize])
            .sum()
    }
}

pub struct IndexIvfPq {
    params: IvfParams,
    pq_params: PqParams,
    /// Subspace dimension, `d / mp`.
    dp: usize,
    index_path: PathBuf,
    db_path: PathBuf,
    name: String,
    status: IndexStatus,
    nsamples: usize,
    seed: Option<u64>,
    cq: Option<Codebook>,
    /// One codebook per subspace.
    pq: Vec<Codebook>,
    posting_lists: Vec<Vec<VectorId>>,
    /// Packed PQ codes, `posting_lists[c].len() × mp` bytes per cluster.
    segments: Vec<Vec<u8>>,
}

impl IndexIvfPq {
    pub fn new(
        params: IvfParams,
        pq_params: PqParams,
        index_path: impl Into<PathBuf>,
        db_path: impl Into<PathBuf>,
        name: impl Into<String>,
        status: IndexStatus,
    ) -> Result<Self> {
        ensure!(params.d > 0 && params.kc > 0, "degenerate index shape");
        ensure!(
            pq_params.mp > 0 && params.d % pq_params.mp == 0,
            "subspace count must divide the dimension"
        );
        ensure!(
            pq_params.kp > 0 && pq_params.kp <= 256,
            "8-bit subcodes allow at most 256 sub-centroids"
        );
        let dp = params.d / pq_params.mp;
        info!(simd = simd_architecture(), "ivf-pq index created");
        Ok(Self {
            params,
            pq_params,
            dp,
            index_path: index_path.into(),
            db_path: db_path.into(),
            name: name.into(),
            status,
            nsamples: 0,
            seed: None,
            cq: None,
            pq: Vec::new(),
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

    pub fn pq_params(&self) -> &PqParams {
        &self.pq_params
    }

    pub fn status(&self) -> IndexStatus {
        self.status
    }

    pub fn ready(&self) -> bool {
        self.cq.is_some() && !self.pq.is_empty() && !self.posting_lists.is_empty()
    }

    pub fn set_training_config(&mut self, nsamples: usize, seed: u64) {
        self.nsamples = nsamples;
        self.seed = Some(seed);
    }

    pub fn ntotal(&self) -> usize {
        self.posting_lists.iter().map(Vec::len).sum()
    }

    /// Train the coarse quantizer, then each subspace's product
    /// quantizer, on the same seeded sample.
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

        self.cq = Some(Codebook::fit(
            &traindata,
            d,
            self.params.kc,
            CQ_TRAIN_ITERATIONS,
            seed,
        )?);
        info!(kc = self.params.kc, nsamples, "coarse quantizer trained");

        let mp = self.pq_params.mp;
        let dp = self.dp;
        self.pq = (0..mp)
            .map(|m| {
                // Slice out this subspace from every training vector.
                let mut sub = Vec::with_capacity(nsamples * dp);
                for i in 0..nsamples {
                    let v = &traindata[i * d..(i + 1) * d];
                    sub.extend_from_slice(&v[m * dp..(m + 1) * dp]);
                }
                Codebook::fit(
                    &sub,
                    dp,
                    self.pq_params.kp,
                    PQ_TRAIN_ITERATIONS,
                    seed.wrapping_add(m as u64),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        info!(mp, kp = self.pq_params.kp, dp, "product quantizer trained");
        Ok(())
    }

    /// PQ-encode one vector into `mp` subcodes.
    pub fn encode_one(&self, v: &[f32]) -> Result<Vec<u8>> {
        ensure!(!self.pq.is_empty(), "product quantizer not ready");
        let dp = self.dp;
        Ok(self
            .pq
            .iter()
            .enumerate()
            .map(|(m, book)| book.predict_one(&v[m * dp..(m + 1) * dp]) as u8)
            .collect())
    }

    /// Assign, encode and insert the whole corpus; one lock per cluster.
    pub fn populate(&mut self, raw_data: &[f32]) -> Result<()> {
        ensure!(self.status == IndexStatus::Local, "index must be local");
        let cq = self.cq.as_ref().context("coarse quantizer not ready")?;
        ensure!(!self.pq.is_empty(), "product quantizer not ready");
        let d = self.params.d;
        let n = raw_data.len() / d;
        ensure!(n == self.params.n, "corpus size mismatch");

        let mp = self.pq_params.mp;
        let dp = self.dp;
        let pq = &self.pq;
        let codes: Vec<u8> = (0..n)
            .into_par_iter()
            .flat_map_iter(|i| {
                let v = &raw_data[i * d..(i + 1) * d];
                (0..mp).map(move |m| pq[m].predict_one(&v[m * dp..(m + 1) * dp]) as u8)
            })
            .collect();

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
                let mut segment = Vec::with_capacity(list.len() * mp);
                for &id in list {
                    let id = id as usize;
                    segment.extend_from_slice(&codes[id * mp..(id + 1) * mp]);
                }
                segment
            })
            .collect();
        info!(n, kc, mp, "ivf-pq index populated");
        Ok(())
    }

    pub fn write_index(&self) -> Result<()> {
        ensure!(self.status == IndexStatus::Local, "index must be local");
        let cq = self.cq.as_ref().context("coarse quantizer not ready")?;
        ensure!(!self.pq.is_empty(), "product quantizer not ready");
        std::fs::create_dir_all(&self.index_path)?;
        segment_io::write_f32s(&self.index_path.join(CQ_CENTERS_FILE), &cq.centers)?;
        let mut flat = Vec::with_capacity(self.pq_params.mp * self.pq_params.kp * self.dp);
        for book in &self.pq {
            flat.extend_from_slice(&book.centers);
        }
        segment_io::write_f32s(&self.index_path.join(PQ_CENTERS_FILE), &flat)
    }

    pub fn load_index(&mut self) -> Result<()> {
        let centers = segment_io::read_f32s(&self.index_path.join(CQ_CENTERS_FILE))?;
        self.cq = Some(Codebook::from_centers(
            self.params.kc,
            self.params.d,
            centers,
        )?);
        debug!("coarse quantizer codebook loaded");

        let flat = segment_io::read_f32s(&self.index_path.join(PQ_CENTERS_FILE))?;
        let per_book = self.pq_params.kp * self.dp;
        ensure!(
            flat.len() == self.pq_params.mp * per_book,
            "pq centers file has wrong shape"
        );
        self.pq = flat
            .chunks_exact(per_book)
            .map(|chunk| Codebook::from_centers(self.pq_params.kp, self.dp, chunk.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        debug!("product quantizer codebook loaded");
        Ok(())
    }

    pub fn write_segments(&self) -> Result<()> {
        ensure!(self.status == IndexStatus::Local, "index must be local");
        std::fs::create_dir_all(&self.db_path)?;
        let mut sizes = Vec::with_capacity(self.params.kc);
        for (c, segment) in self.segments.iter().enumerate() {
            sizes.push(self.posting_lists[c].len() as u64);
            segment_io::write_u8s(
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

    pub fn load_segments_all(&mut self) -> Result<()> {
        let all: Vec<ClusterId> = (0..self.params.kc).collect();
        self.load_segments(&all)
    }

    /// Diff the requested subset against resident segments: evict what is
    /// no longer wanted, load what is missing.
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
                segment_io::read_u8s(&self.db_path.join(format!("{VECTOR_FILE_PREFIX}{c}")))?;
            ensure!(
                self.segments[c].len() == self.posting_lists[c].len() * self.pq_params.mp,
                "cluster {c}: segment/posting list size mismatch"
            );
        }
        Ok(())
    }

    pub fn resident_clusters(&self) -> Vec<ClusterId> {
        self.posting_lists
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.is_empty())
            .map(|(c, _)| c)
            .collect()
    }

    /// Distance table from a query to every sub-centroid.
    pub fn dtable(&self, query: &[f32]) -> Result<DistanceTable> {
        ensure!(!self.pq.is_empty(), "product quantizer not ready");
        let mp = self.pq_params.mp;
        let kp = self.pq_params.kp;
        let dp = self.dp;
        let mut table = DistanceTable::new(mp, kp);
        for (m, book) in self.pq.iter().enumerate() {
            let sub = &query[m * dp..(m + 1) * dp];
            for ks in 0..kp {
                table.set(m, ks, l2_sqr(sub, book.center(ks)));
            }
        }
        Ok(table)
    }

    /// The `w` coarse clusters nearest to the query.
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

    pub fn top_w_batch(&self, w: usize, queries: &[Vec<f32>]) -> Result<Vec<Vec<ClusterId>>> {
        queries.par_iter().map(|q| self.top_w(w, q)).collect()
    }

    /// ADC scan over the probe list, budgeted at `L` candidates.
    pub fn top_k(
        &self,
        k: usize,
        query: &[f32],
        probe: &[ClusterId],
    ) -> Result<(Vec<VectorId>, Vec<f32>)> {
        ensure!(self.ready(), "index must be populated before querying");
        let mp = self.pq_params.mp;
        let l = self.params.l;
        let table = self.dtable(query)?;
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
                let dist = table.adist(&segment[j * mp..(j + 1) * mp]);
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
        debug!(searched, returned = score.len(), "ivf-pq scan complete");
        let ids = score.iter().map(|s| s.0).collect();
        let dists = score.iter().map(|s| s.1).collect();
        Ok((ids, dists))
    }

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

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_corpus(n: usize, d: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * d).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn built_index(
        n: usize,
        d: usize,
        kc: usize,
        mp: usize,
        kp: usize,
    ) -> (IndexIvfPq, Vec<f32>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let data = random_corpus(n, d, 21);
        let mut index = IndexIvfPq::new(
            IvfParams { n, d, l: n, kc },
            PqParams { mp, kp },
            dir.path().join("index"),
            dir.path().join("db"),
            "test",
            IndexStatus::Local,
        )
        .unwrap();
        index.set_training_config(n, 9);
        index.train(&data).unwrap();
        index.populate(&data).unwrap();
        (index, data, dir)
    }

    #[test]
    fn test_shape_validation() {
        let params = IvfParams { n: 10, d: 10, l: 10, kc: 2 };
        assert!(IndexIvfPq::new(
            params.clone(),
            PqParams { mp: 3, kp: 16 },
            "/tmp/i",
            "/tmp/d",
            "bad",
            IndexStatus::Local,
        )
        .is_err());
        assert!(IndexIvfPq::new(
            params,
            PqParams { mp: 2, kp: 300 },
            "/tmp/i",
            "/tmp/d",
            "bad",
            IndexStatus::Local,
        )
        .is_err());
    }

    #[test]
    fn test_populate_invariants() {
        let (index, _, _dir) = built_index(400, 16, 8, 4, 16);
        assert_eq!(index.ntotal(), 400);
        for c in 0..8 {
            assert_eq!(
                index.segments[c].len(),
                index.posting_lists[c].len() * 4,
                "cluster {c}"
            );
        }
    }

    #[test]
    fn test_adc_matches_table_lookup() {
        let (index, data, _dir) = built_index(100, 8, 4, 4, 8);
        let query = &data[0..8];
        let table = index.dtable(query).unwrap();
        let code = index.encode_one(&data[8..16]).unwrap();
        let manual: f32 = (0..4).map(|m| table.get(m, code[m] as usize)).sum();
        assert!((table.adist(&code) - manual).abs() < 1e-6);
    }

    #[test]
    fn test_self_query_recall() {
        let (index, data, _dir) = built_index(500, 16, 8, 4, 32);
        // Querying with stored vectors: the vector itself should be in
        // the top results most of the time even under quantization.
        let mut hits = 0;
        for i in 0..50 {
            let query = &data[i * 16..(i + 1) * 16];
            let probe = index.top_w(4, query).unwrap();
            let (ids, _) = index.top_k(10, query, &probe).unwrap();
            if ids.contains(&(i as u64)) {
                hits += 1;
            }
        }
        assert!(hits >= 40, "self-recall too low: {hits}/50");
    }

    #[test]
    fn test_persistence_round_trip() {
        let (mut index, data, dir) = built_index(300, 16, 8, 4, 16);
        index.write_index().unwrap();
        index.write_posting_lists().unwrap();
        index.write_segments().unwrap();

        let query = data[0..16].to_vec();
        let probe = index.top_w(8, &query).unwrap();
        let want = index.top_k(5, &query, &probe).unwrap();

        let mut reloaded = IndexIvfPq::new(
            IvfParams { n: 300, d: 16, l: 300, kc: 8 },
            PqParams { mp: 4, kp: 16 },
            dir.path().join("index"),
            dir.path().join("db"),
            "reloaded",
            IndexStatus::Local,
        )
        .unwrap();
        reloaded.load_index().unwrap();
        reloaded.load_segments_all().unwrap();
        let got = reloaded.top_k(5, &query, &probe).unwrap();
        assert_eq!(got.0, want.0);
        assert_eq!(got.1, want.1);
    }
}
