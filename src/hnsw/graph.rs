//! HNSW graph structure.
//!
//! Per-node, per-layer neighbor lists. Layer assignment follows the usual
//! geometric distribution with `level_mult = 1 / ln(M)`. The maximum degree
//! is `2M` at layer 0 and `M` on the upper layers.

use std::io::{Read, Write};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use crate::error::Result;
use crate::io;

pub(crate) type NeighborList = SmallVec<[u32; 16]>;

const LEVEL_RNG_SEED: u64 = 0x6E66_6772;

pub struct HnswGraph {
    pub m: usize,
    pub ef_construction: usize,
    level_mult: f64,
    pub entry_point: i64,
    pub max_level: usize,
    levels: Vec<u8>,
    // [node][layer], layer 0 first
    neighbors: Vec<Vec<NeighborList>>,
    level_rng: StdRng,
}

impl HnswGraph {
    pub fn new(m: usize, ef_construction: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            ef_construction: ef_construction.max(1),
            level_mult: 1.0 / (m as f64).ln(),
            entry_point: -1,
            max_level: 0,
            levels: Vec::new(),
            neighbors: Vec::new(),
            level_rng: StdRng::seed_from_u64(LEVEL_RNG_SEED),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Draw a level from the geometric distribution.
    pub(crate) fn random_level(&mut self) -> usize {
        let r: f64 = self.level_rng.random::<f64>();
        // -ln(U) * level_mult, clamped away from pathological draws
        let level = (-r.max(1e-12).ln() * self.level_mult) as usize;
        level.min(31)
    }

    /// Append a node at `level` with empty neighbor lists, returning its id.
    pub(crate) fn push_node(&mut self, level: usize) -> u32 {
        let id = self.levels.len() as u32;
        self.levels.push(level as u8);
        self.neighbors
            .push((0..=level).map(|_| NeighborList::new()).collect());
        id
    }

    #[inline]
    #[must_use]
    pub fn level_of(&self, id: u32) -> usize {
        self.levels[id as usize] as usize
    }

    /// Maximum degree at `level`.
    #[inline]
    #[must_use]
    pub fn max_degree(&self, level: usize) -> usize {
        if level == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    #[inline]
    #[must_use]
    pub fn neighbors(&self, id: u32, level: usize) -> &[u32] {
        let lists = &self.neighbors[id as usize];
        if level < lists.len() {
            &lists[level]
        } else {
            &[]
        }
    }

    #[inline]
    pub(crate) fn neighbors_mut(&mut self, id: u32, level: usize) -> &mut NeighborList {
        &mut self.neighbors[id as usize][level]
    }

    pub(crate) fn write_body(&self, w: &mut dyn Write) -> std::io::Result<()> {
        io::write_u32(w, self.m as u32)?;
        io::write_u32(w, self.ef_construction as u32)?;
        io::write_u64(w, self.entry_point as u64)?;
        io::write_u32(w, self.max_level as u32)?;
        io::write_u64(w, self.levels.len() as u64)?;
        w.write_all(&self.levels)?;
        for lists in &self.neighbors {
            io::write_u32(w, lists.len() as u32)?;
            for list in lists {
                io::write_u32(w, list.len() as u32)?;
                for &n in list {
                    io::write_u32(w, n)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn read_body(r: &mut dyn Read) -> Result<Self> {
        let m = io::read_u32(r)? as usize;
        let ef_construction = io::read_u32(r)? as usize;
        let entry_point = io::read_u64(r)? as i64;
        let max_level = io::read_u32(r)? as usize;
        let n = io::read_u64(r)? as usize;
        let mut levels = vec![0u8; n];
        r.read_exact(&mut levels)?;
        let mut neighbors = Vec::with_capacity(n);
        for _ in 0..n {
            let n_lists = io::read_u32(r)? as usize;
            let mut lists = Vec::with_capacity(n_lists);
            for _ in 0..n_lists {
                let len = io::read_u32(r)? as usize;
                let mut list = NeighborList::with_capacity(len);
                for _ in 0..len {
                    list.push(io::read_u32(r)?);
                }
                lists.push(list);
            }
            neighbors.push(lists);
        }
        let mut graph = Self::new(m, ef_construction);
        graph.entry_point = entry_point;
        graph.max_level = max_level;
        graph.levels = levels;
        graph.neighbors = neighbors;
        Ok(graph)
    }
}
