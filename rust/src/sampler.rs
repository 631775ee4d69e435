//! Address sampling behind a narrow interface.
//!
//! The scheduling core only ever sees `AddressSampler`: pure selection of
//! targets for a family, plus `apply_*` mutations that the scheduler calls on
//! OP_END. `BlockStateSampler` is the in-crate implementation built on
//! per-die block arrays and bitsets.

use rand::rngs::SmallRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::ConfigError;
use crate::config::Topology;
use crate::resource::{AddressOverlay, EprFailure, EprPolicy, EprQuery, EprVerdict};
use crate::types::{Address, Family};

/// The single random source of a simulation.
pub type SimRng = SmallRng;

/// A block marked bad at setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadBlock {
    pub die: u32,
    pub block: u32,
}

/// Geometry and initial block state of the sampler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub blocks_per_plane: u32,
    pub pages_per_block: u32,
    pub bad_blocks: Vec<BadBlock>,
    /// Pages behind the program cursor that are not yet readable.
    pub read_guard_offset: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            blocks_per_plane: 16,
            pages_per_block: 64,
            bad_blocks: Vec::new(),
            read_guard_offset: 0,
        }
    }
}

/// What the proposer asks the sampler for: one target per plane of `planes`.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleRequest {
    pub die: u32,
    pub planes: Vec<u32>,
    pub celltype: Option<String>,
}

/// Target selection and post-completion state sync.
pub trait AddressSampler: EprPolicy {
    fn sample_erase(&self, req: &SampleRequest, rng: &mut SimRng) -> Option<Vec<Address>>;
    fn sample_pgm(&self, req: &SampleRequest, rng: &mut SimRng) -> Option<Vec<Address>>;
    fn sample_read(&self, req: &SampleRequest, rng: &mut SimRng) -> Option<Vec<Address>>;
    fn apply_erase(&mut self, targets: &[Address], celltype: Option<&str>);
    fn apply_pgm(&mut self, targets: &[Address], celltype: Option<&str>);

    fn sample(
        &self,
        family: Family,
        req: &SampleRequest,
        rng: &mut SimRng,
    ) -> Option<Vec<Address>> {
        match family {
            Family::Erase => self.sample_erase(req, rng),
            Family::Program => self.sample_pgm(req, rng),
            Family::Read => self.sample_read(req, rng),
        }
    }
}

/// Fixed-size bitset over block indices.
#[derive(Clone, Debug, PartialEq)]
struct BlockBits {
    words: Vec<u64>,
}

impl BlockBits {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
        }
    }

    fn filled(len: usize) -> Self {
        let mut bits = Self::new(len);
        for i in 0..len {
            bits.set(i, true);
        }
        bits
    }

    #[inline]
    fn get(&self, i: usize) -> bool {
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    #[inline]
    fn set(&mut self, i: usize, on: bool) {
        if on {
            self.words[i / 64] |= 1 << (i % 64);
        } else {
            self.words[i / 64] &= !(1 << (i % 64));
        }
    }

    fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[derive(Clone, Debug)]
struct DieBlocks {
    /// Next page to program.
    cursor: Vec<u32>,
    erase_count: Vec<u32>,
    celltype: Vec<Option<String>>,
    bad: BlockBits,
    erased: BlockBits,
}

/// Block-state sampler over every die of the device.
///
/// Block `b` of a die lives on plane `b % planes`. Every block starts erased
/// with its program cursor at page 0.
#[derive(Clone, Debug)]
pub struct BlockStateSampler {
    config: SamplerConfig,
    planes: u32,
    dies: Vec<DieBlocks>,
}

impl BlockStateSampler {
    pub fn new(config: &SamplerConfig, topology: &Topology) -> Result<Self, ConfigError> {
        if config.blocks_per_plane == 0 || config.pages_per_block == 0 {
            return Err(ConfigError::InvalidSampler(format!(
                "blocks_per_plane={} pages_per_block={} (both must be positive)",
                config.blocks_per_plane, config.pages_per_block
            )));
        }
        let blocks = (config.blocks_per_plane * topology.planes) as usize;
        let mut dies: Vec<DieBlocks> = (0..topology.dies)
            .map(|_| DieBlocks {
                cursor: vec![0; blocks],
                erase_count: vec![0; blocks],
                celltype: vec![None; blocks],
                bad: BlockBits::new(blocks),
                erased: BlockBits::filled(blocks),
            })
            .collect();
        for bad in &config.bad_blocks {
            if bad.die >= topology.dies || bad.block as usize >= blocks {
                return Err(ConfigError::BadBlockOutOfRange {
                    die: bad.die,
                    block: bad.block,
                });
            }
            dies[bad.die as usize].bad.set(bad.block as usize, true);
        }
        Ok(Self {
            config: config.clone(),
            planes: topology.planes,
            dies,
        })
    }

    fn blocks_on_plane(&self, plane: u32) -> impl Iterator<Item = u32> + '_ {
        (0..self.config.blocks_per_plane).map(move |row| row * self.planes + plane)
    }

    fn die(&self, die: u32) -> Option<&DieBlocks> {
        self.dies.get(die as usize)
    }

    /// One uniformly chosen block per requested plane among those accepted
    /// by `eligible`; `None` if any plane has no eligible block.
    fn pick_per_plane(
        &self,
        req: &SampleRequest,
        rng: &mut SimRng,
        mut eligible: impl FnMut(&DieBlocks, usize) -> bool,
    ) -> Option<Vec<u32>> {
        let blocks = self.die(req.die)?;
        let mut picked = Vec::with_capacity(req.planes.len());
        for &plane in &req.planes {
            if plane >= self.planes {
                return None;
            }
            let candidates: Vec<u32> = self
                .blocks_on_plane(plane)
                .filter(|&b| !blocks.bad.get(b as usize) && eligible(blocks, b as usize))
                .collect();
            if candidates.is_empty() {
                return None;
            }
            picked.push(candidates[rng.gen_range(0..candidates.len())]);
        }
        Some(picked)
    }

    /// Next page to program on a block.
    pub fn cursor(&self, die: u32, block: u32) -> Option<u32> {
        self.die(die)?.cursor.get(block as usize).copied()
    }

    pub fn erase_count(&self, die: u32, block: u32) -> Option<u32> {
        self.die(die)?.erase_count.get(block as usize).copied()
    }

    pub fn is_erased(&self, die: u32, block: u32) -> bool {
        self.die(die)
            .is_some_and(|d| (block as usize) < d.cursor.len() && d.erased.get(block as usize))
    }

    pub fn bad_block_count(&self, die: u32) -> usize {
        self.die(die).map_or(0, |d| d.bad.count())
    }

    fn readable_limit(&self, cursor: u32) -> u32 {
        cursor.saturating_sub(self.config.read_guard_offset)
    }

    fn check_target(
        &self,
        query: &EprQuery<'_>,
        addr: &Address,
        overlay: &AddressOverlay,
        failures: &mut Vec<EprFailure>,
    ) {
        let Some(blocks) = self.die(addr.die) else {
            failures.push(EprFailure::BadBlock(*addr));
            return;
        };
        let b = addr.block as usize;
        if b >= blocks.cursor.len() || blocks.bad.get(b) {
            failures.push(EprFailure::BadBlock(*addr));
            return;
        }
        let pending = overlay.block(addr.die, addr.block);
        let erased_pending = pending.is_some_and(|p| p.erased);
        let base_cursor = if erased_pending { 0 } else { blocks.cursor[b] };
        let cursor = pending
            .and_then(|p| p.programmed_through)
            .map_or(base_cursor, |p| base_cursor.max(p + 1));
        let celltype = pending
            .and_then(|p| p.celltype.as_deref())
            .or(if erased_pending { None } else { blocks.celltype[b].as_deref() });

        match query.family {
            Some(Family::Program) => {
                if !(erased_pending || blocks.erased.get(b)) {
                    failures.push(EprFailure::ProgramBeforeErase(*addr));
                } else if addr.page.is_some_and(|p| p < cursor) {
                    failures.push(EprFailure::DuplicatePageProgram(*addr));
                } else if cursor > 0
                    && celltype.is_some()
                    && query.celltype.is_some()
                    && celltype != query.celltype
                {
                    failures.push(EprFailure::MixedCelltype(*addr));
                }
            }
            Some(Family::Read) => {
                if addr.page.is_some_and(|p| p >= self.readable_limit(cursor)) {
                    failures.push(EprFailure::ReadBeforeProgram(*addr));
                }
            }
            Some(Family::Erase) | None => {}
        }
    }
}

impl EprPolicy for BlockStateSampler {
    fn check_epr(&self, query: &EprQuery<'_>, overlay: &AddressOverlay) -> EprVerdict {
        let mut failures = Vec::new();
        if query.family.is_some() {
            for addr in query.targets {
                self.check_target(query, addr, overlay, &mut failures);
            }
        }
        EprVerdict { failures }
    }
}

impl AddressSampler for BlockStateSampler {
    fn sample_erase(&self, req: &SampleRequest, rng: &mut SimRng) -> Option<Vec<Address>> {
        let picked = self.pick_per_plane(req, rng, |_, _| true)?;
        Some(
            req.planes
                .iter()
                .zip(picked)
                .map(|(&plane, block)| Address::block(req.die, plane, block))
                .collect(),
        )
    }

    fn sample_pgm(&self, req: &SampleRequest, rng: &mut SimRng) -> Option<Vec<Address>> {
        let pages = self.config.pages_per_block;
        let celltype = req.celltype.as_deref();
        let picked = self.pick_per_plane(req, rng, |d, b| {
            d.erased.get(b)
                && d.cursor[b] < pages
                && (d.cursor[b] == 0 || celltype.is_none() || d.celltype[b].as_deref() == celltype)
        })?;
        let blocks = self.die(req.die)?;
        Some(
            req.planes
                .iter()
                .zip(picked)
                .map(|(&plane, block)| {
                    Address::new(req.die, plane, block, Some(blocks.cursor[block as usize]))
                })
                .collect(),
        )
    }

    fn sample_read(&self, req: &SampleRequest, rng: &mut SimRng) -> Option<Vec<Address>> {
        let guard = self.config.read_guard_offset;
        let celltype = req.celltype.as_deref();
        let picked = self.pick_per_plane(req, rng, |d, b| {
            d.cursor[b] > guard && (celltype.is_none() || d.celltype[b].as_deref() == celltype)
        })?;
        let blocks = self.die(req.die)?;
        let mut out = Vec::with_capacity(picked.len());
        for (&plane, block) in req.planes.iter().zip(picked) {
            let limit = self.readable_limit(blocks.cursor[block as usize]);
            out.push(Address::new(
                req.die,
                plane,
                block,
                Some(rng.gen_range(0..limit)),
            ));
        }
        Some(out)
    }

    fn apply_erase(&mut self, targets: &[Address], celltype: Option<&str>) {
        for addr in targets {
            let Some(blocks) = self.dies.get_mut(addr.die as usize) else {
                continue;
            };
            let b = addr.block as usize;
            if b >= blocks.cursor.len() {
                continue;
            }
            blocks.cursor[b] = 0;
            blocks.erase_count[b] += 1;
            blocks.celltype[b] = celltype.map(str::to_string);
            blocks.erased.set(b, true);
        }
    }

    fn apply_pgm(&mut self, targets: &[Address], celltype: Option<&str>) {
        let pages = self.config.pages_per_block;
        for addr in targets {
            let Some(blocks) = self.dies.get_mut(addr.die as usize) else {
                continue;
            };
            let b = addr.block as usize;
            if b >= blocks.cursor.len() {
                continue;
            }
            let next = addr.page.map_or(blocks.cursor[b] + 1, |p| p + 1);
            blocks.cursor[b] = blocks.cursor[b].max(next).min(pages);
            if blocks.celltype[b].is_none() {
                blocks.celltype[b] = celltype.map(str::to_string);
            }
            if blocks.cursor[b] == pages {
                // Full blocks must be erased before the next program
                blocks.erased.set(b, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sampler() -> BlockStateSampler {
        let config = SamplerConfig {
            blocks_per_plane: 4,
            pages_per_block: 4,
            bad_blocks: vec![BadBlock { die: 0, block: 0 }],
            read_guard_offset: 0,
        };
        BlockStateSampler::new(&config, &Topology { dies: 1, planes: 2 }).unwrap()
    }

    fn req(planes: &[u32]) -> SampleRequest {
        SampleRequest {
            die: 0,
            planes: planes.to_vec(),
            celltype: Some("SLC".to_string()),
        }
    }

    fn query<'a>(family: Family, targets: &'a [Address]) -> EprQuery<'a> {
        EprQuery {
            base: "X",
            family: Some(family),
            targets,
            celltype: Some("SLC"),
        }
    }

    #[test]
    fn test_bad_block_out_of_range_rejected() {
        let config = SamplerConfig {
            bad_blocks: vec![BadBlock { die: 3, block: 0 }],
            ..SamplerConfig::default()
        };
        assert!(matches!(
            BlockStateSampler::new(&config, &Topology::default()),
            Err(ConfigError::BadBlockOutOfRange { die: 3, block: 0 })
        ));
    }

    #[test]
    fn test_samples_respect_plane_and_bad_blocks() {
        let s = sampler();
        let mut rng = SimRng::seed_from_u64(1);
        for _ in 0..32 {
            let targets = s.sample_erase(&req(&[0, 1]), &mut rng).unwrap();
            assert_eq!(targets.len(), 2);
            assert_eq!(targets[0].block % 2, 0);
            assert_eq!(targets[1].block % 2, 1);
            assert_ne!(targets[0].block, 0);
        }
        // Nothing is programmed yet, so nothing is readable
        assert!(s.sample_read(&req(&[0]), &mut rng).is_none());
    }

    #[test]
    fn test_program_then_read() {
        let mut s = sampler();
        let mut rng = SimRng::seed_from_u64(2);
        let targets = s.sample_pgm(&req(&[1]), &mut rng).unwrap();
        assert_eq!(targets[0].page, Some(0));
        s.apply_pgm(&targets, Some("SLC"));
        assert_eq!(s.cursor(0, targets[0].block), Some(1));

        let read = s.sample_read(&req(&[1]), &mut rng).unwrap();
        assert_eq!(read[0].block, targets[0].block);
        assert_eq!(read[0].page, Some(0));
    }

    #[test]
    fn test_full_block_needs_erase() {
        let mut s = sampler();
        let block = Address::new(0, 1, 1, None);
        for page in 0..4 {
            s.apply_pgm(&[Address::new(0, 1, 1, Some(page))], Some("SLC"));
        }
        assert!(!s.is_erased(0, 1));
        let pgm = [Address::new(0, 1, 1, Some(0))];
        let verdict = s.check_epr(&query(Family::Program, &pgm), &AddressOverlay::default());
        assert_eq!(verdict.failures, vec![EprFailure::ProgramBeforeErase(pgm[0])]);

        s.apply_erase(&[block], Some("SLC"));
        assert!(s.is_erased(0, 1));
        assert_eq!(s.erase_count(0, 1), Some(1));
        assert!(s
            .check_epr(&query(Family::Program, &pgm), &AddressOverlay::default())
            .ok());
    }

    #[test]
    fn test_epr_sees_transaction_overlay() {
        let s = sampler();
        let pgm = [Address::new(0, 1, 3, Some(0))];
        let read = [Address::new(0, 1, 3, Some(0))];
        let empty = AddressOverlay::default();
        assert_eq!(
            s.check_epr(&query(Family::Read, &read), &empty).failures,
            vec![EprFailure::ReadBeforeProgram(read[0])]
        );

        // A program staged earlier in the same transaction makes the page readable
        let mut overlay = AddressOverlay::default();
        overlay.record(Some(Family::Program), &pgm, Some("SLC"));
        assert!(s.check_epr(&query(Family::Read, &read), &overlay).ok());
        assert_eq!(
            s.check_epr(&query(Family::Program, &pgm), &overlay).failures,
            vec![EprFailure::DuplicatePageProgram(pgm[0])]
        );
    }

    #[test]
    fn test_bad_block_fails_epr() {
        let s = sampler();
        let target = [Address::block(0, 0, 0)];
        let verdict = s.check_epr(&query(Family::Erase, &target), &AddressOverlay::default());
        assert_eq!(verdict.failures, vec![EprFailure::BadBlock(target[0])]);
    }
}
