//! Launch configuration search for grid-persistent outer normalizations.
//!
//! [`PreferredLaunchConfig`] iterates candidate shapes in preferred order:
//!
//! ```text
//! for bdimx in valid blockDim.x values, decreasing
//!     for (gdimx, gdimy) in valid gridDims, gdimx decreasing
//! ```
//!
//! blockDim.x determines blockDim.y so that every block has the same number
//! of threads, and gridDim.y determines gridDim.x so that the grid has
//! exactly one block per SM. Wider blocks come first since they replicate
//! the persistent buffer across fewer threads.

use crate::options::SchedulerOptions;
use serde::Serialize;
use smallvec::SmallVec;
use std::fmt;
use tessel_gpu::{DeviceInfo, LaunchParams};
use tracing::debug;

type GridDims = SmallVec<[(i64, i64); 16]>;

/// Iterator-like cursor over (blockDim, gridDim) candidates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreferredLaunchConfig {
    valid: bool,
    /// Ordered by decreasing gridDim.x.
    valid_grid_dims: GridDims,
    grid_dims_pos: usize,
    bdimx: i64,
    bdimy: i64,
    min_bdimx: i64,
    max_bdimx: i64,
    threads_per_block: i64,
}

impl PreferredLaunchConfig {
    /// Starts the search for a device with `sm_count` multiprocessors using
    /// the default block shape limits.
    #[must_use]
    pub fn new(sm_count: i64) -> Self {
        Self::with_options(sm_count, &SchedulerOptions::default())
    }

    /// Starts the search with explicit block shape limits.
    #[must_use]
    pub fn with_options(sm_count: i64, options: &SchedulerOptions) -> Self {
        let mut cfg = Self {
            valid: true,
            valid_grid_dims: valid_grid_dims(sm_count),
            grid_dims_pos: 0,
            bdimx: 0,
            bdimy: 0,
            min_bdimx: options.min_bdimx,
            max_bdimx: options.max_bdimx,
            threads_per_block: options.outer_grid_threads_per_block,
        };
        if cfg.valid_grid_dims.is_empty() || !cfg.set_bdimx(cfg.max_bdimx, false) {
            cfg.invalidate();
        }
        cfg
    }

    /// Current blockDim.x, or `None` once exhausted.
    #[must_use]
    pub fn bdimx(&self) -> Option<i64> {
        self.valid.then_some(self.bdimx)
    }

    /// Current blockDim.y, or `None` once exhausted.
    #[must_use]
    pub fn bdimy(&self) -> Option<i64> {
        self.valid.then_some(self.bdimy)
    }

    /// Current gridDim.x, or `None` once exhausted.
    #[must_use]
    pub fn gdimx(&self) -> Option<i64> {
        self.grid_at(self.grid_dims_pos).map(|(x, _)| x)
    }

    /// Current gridDim.y, or `None` once exhausted.
    #[must_use]
    pub fn gdimy(&self) -> Option<i64> {
        self.grid_at(self.grid_dims_pos).map(|(_, y)| y)
    }

    /// gridDim.x of the next grid position, without moving.
    #[must_use]
    pub fn peek_next_gdimx(&self) -> Option<i64> {
        self.next_grid_pos()
            .and_then(|pos| self.grid_at(pos))
            .map(|(x, _)| x)
    }

    /// gridDim.y of the next grid position, without moving.
    #[must_use]
    pub fn peek_next_gdimy(&self) -> Option<i64> {
        self.next_grid_pos()
            .and_then(|pos| self.grid_at(pos))
            .map(|(_, y)| y)
    }

    /// Returns true once no candidate is left.
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        !self.valid
    }

    /// Returns true if the next move lowers blockDim.x.
    #[must_use]
    pub fn is_next_smaller_bdimx(&self) -> bool {
        self.valid && self.grid_dims_pos + 1 == self.valid_grid_dims.len()
    }

    /// Returns true if blockDim.x can still be lowered.
    #[must_use]
    pub fn can_lower_bdimx(&self) -> bool {
        self.valid && self.bdimx > self.min_bdimx
    }

    /// Advances to the next grid shape, or to the next blockDim.x when the
    /// grid shapes are exhausted. Returns false and invalidates when
    /// nothing is left.
    pub fn move_to_next_config(&mut self) -> bool {
        if self.move_to_next_gdim() || self.move_to_next_bdim() {
            return true;
        }
        self.invalidate();
        false
    }

    /// Lowers blockDim.x to the next valid value and resets the grid
    /// position. Returns false and invalidates when it cannot be lowered.
    pub fn move_to_next_bdim(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        let mut bdimx = self.bdimx / 2;
        while bdimx >= self.min_bdimx {
            if self.set_bdimx(bdimx, false) {
                self.grid_dims_pos = 0;
                return true;
            }
            bdimx /= 2;
        }
        self.invalidate();
        false
    }

    fn move_to_next_gdim(&mut self) -> bool {
        match self.next_grid_pos() {
            Some(pos) => {
                self.grid_dims_pos = pos;
                true
            }
            None => false,
        }
    }

    fn next_grid_pos(&self) -> Option<usize> {
        let next = self.grid_dims_pos + 1;
        (self.valid && next < self.valid_grid_dims.len()).then_some(next)
    }

    fn grid_at(&self, pos: usize) -> Option<(i64, i64)> {
        if !self.valid {
            return None;
        }
        self.valid_grid_dims.get(pos).copied()
    }

    /// Sets blockDim.x and the matching blockDim.y. With `dry_run` only
    /// validates.
    fn set_bdimx(&mut self, bdimx: i64, dry_run: bool) -> bool {
        let in_range = (self.min_bdimx..=self.max_bdimx).contains(&bdimx);
        if !in_range
            || bdimx <= 0
            || bdimx > self.threads_per_block
            || self.threads_per_block % bdimx != 0
        {
            return false;
        }
        if !dry_run {
            self.bdimx = bdimx;
            self.bdimy = self.threads_per_block / bdimx;
        }
        true
    }

    fn invalidate(&mut self) {
        self.valid = false;
    }
}

/// Factor pairs `(sm_count / y, y)` for `y` in `2..=sqrt(sm_count)`,
/// followed by their transposes, ordered by decreasing gridDim.x.
fn valid_grid_dims(sm_count: i64) -> GridDims {
    let mut dims = GridDims::new();
    let mut gdimy = 2;
    while gdimy * gdimy <= sm_count {
        if sm_count % gdimy == 0 {
            dims.push((sm_count / gdimy, gdimy));
        }
        gdimy += 1;
    }
    let transposed: Vec<(i64, i64)> = dims
        .iter()
        .rev()
        .filter(|(x, y)| x != y)
        .map(|&(x, y)| (y, x))
        .collect();
    dims.extend(transposed);
    dims
}

impl fmt::Display for PreferredLaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dim = |d: Option<i64>| d.map_or(-1, |v| v);
        write!(
            f,
            "{{gdimx: {}, gdimy: {}, bdimx: {}, bdimy: {}}}",
            dim(self.gdimx()),
            dim(self.gdimy()),
            dim(self.bdimx()),
            dim(self.bdimy())
        )
    }
}

/// Launch shape and per-thread work of a grid-persistent outer
/// normalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GridOuterNormalizationParams {
    /// Grid and block dimensions.
    pub launch_params: LaunchParams,
    /// Reduction elements each thread keeps resident.
    pub persistent_buffer_factor: i64,
    /// Iteration elements each thread covers serially.
    pub unswitch_factor: i64,
}

/// Searches for a grid-persistent launch shape.
///
/// Iteration elements are spread over `bdimx * gdimx` threads with
/// `vectorize_factor` elements each; reduction elements over
/// `bdimy * gdimy`. `persistent_buffer_size` is the resident byte size for
/// the whole reduction of one iteration element. Returns `None` when no
/// shape keeps the per-thread buffer within the register budget.
#[must_use]
pub fn grid_outer_normalization_params(
    total_reduction_numel: i64,
    total_iteration_numel: i64,
    vectorize_factor: i64,
    persistent_buffer_size: i64,
    device: &DeviceInfo,
    options: &SchedulerOptions,
) -> Option<GridOuterNormalizationParams> {
    let sm_count = i64::from(device.multiprocessor_count);
    let mut cfg = PreferredLaunchConfig::with_options(sm_count, options);

    let iter_after_vect = ceil_div(total_iteration_numel, vectorize_factor);
    while cfg.bdimx()? > iter_after_vect {
        if !cfg.move_to_next_bdim() {
            return None;
        }
    }

    let bytes_per_element = ceil_div(persistent_buffer_size, total_reduction_numel.max(1));
    let registers_per_thread = options.max_registers_per_thread.min(
        i64::from(device.registers_per_multiprocessor)
            .checked_div(options.outer_grid_threads_per_block)?,
    );
    let register_budget = (registers_per_thread - options.register_overhead) * options.bytes_per_register;

    while !cfg.is_invalid() {
        let (bdimx, bdimy, gdimx, gdimy) = (cfg.bdimx()?, cfg.bdimy()?, cfg.gdimx()?, cfg.gdimy()?);

        // Uneven splits of the iteration domain over gridDim.x leave blocks
        // idle; tolerated only for the last grid shape of this blockDim.x.
        let iter_blocks = ceil_div(iter_after_vect, bdimx);
        if iter_blocks % gdimx != 0 && !cfg.is_next_smaller_bdimx() {
            cfg.move_to_next_config();
            continue;
        }

        let persistent_buffer_factor = ceil_div(total_reduction_numel, bdimy * gdimy);
        let per_thread_bytes = persistent_buffer_factor * vectorize_factor * bytes_per_element;
        if per_thread_bytes > register_budget {
            cfg.move_to_next_config();
            continue;
        }

        let unswitch_factor = ceil_div(iter_after_vect, bdimx * gdimx);
        let launch_params = LaunchParams::default()
            .with_grid(to_u32(gdimx), to_u32(gdimy))
            .with_block(to_u32(bdimx), to_u32(bdimy));
        debug!(config = %cfg, persistent_buffer_factor, unswitch_factor, "grid outer normalization");
        return Some(GridOuterNormalizationParams {
            launch_params,
            persistent_buffer_factor,
            unswitch_factor,
        });
    }
    None
}

pub(crate) fn ceil_div(a: i64, b: i64) -> i64 {
    if b <= 0 {
        return a;
    }
    (a + b - 1) / b
}

pub(crate) fn to_u32(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_dims_for_108_sms() {
        assert_eq!(
            valid_grid_dims(108).as_slice(),
            [
                (54, 2),
                (36, 3),
                (27, 4),
                (18, 6),
                (12, 9),
                (9, 12),
                (6, 18),
                (4, 27),
                (3, 36),
                (2, 54)
            ]
        );
    }

    #[test]
    fn test_non_positive_block_size_is_invalid() {
        for threads in [0, -256] {
            let opts = SchedulerOptions {
                outer_grid_threads_per_block: threads,
                ..SchedulerOptions::default()
            };
            let cfg = PreferredLaunchConfig::with_options(108, &opts);
            assert!(cfg.is_invalid());
            assert_eq!(cfg.bdimy(), None);
            let device = DeviceInfo::mock();
            let params = grid_outer_normalization_params(8192, 4096, 4, 8192 * 4, &device, &opts);
            assert!(params.is_none());
        }
    }

    #[test]
    fn test_square_factor_not_duplicated() {
        let dims = valid_grid_dims(16);
        assert_eq!(dims.as_slice(), [(8, 2), (4, 4), (2, 8)]);
    }

    #[test]
    fn test_initial_state() {
        let cfg = PreferredLaunchConfig::new(108);
        assert!(!cfg.is_invalid());
        assert_eq!(cfg.bdimx(), Some(16));
        assert_eq!(cfg.bdimy(), Some(16));
        assert_eq!(cfg.gdimx(), Some(54));
        assert_eq!(cfg.gdimy(), Some(2));
        assert_eq!(cfg.peek_next_gdimx(), Some(36));
        assert_eq!(cfg.peek_next_gdimy(), Some(3));
        assert!(cfg.can_lower_bdimx());
        assert_eq!(cfg.to_string(), "{gdimx: 54, gdimy: 2, bdimx: 16, bdimy: 16}");
    }

    #[test]
    fn test_bdim_step_resets_grid() {
        let mut cfg = PreferredLaunchConfig::new(108);
        for _ in 0..9 {
            assert!(!cfg.is_next_smaller_bdimx());
            assert!(cfg.move_to_next_config());
        }
        assert_eq!(cfg.gdimx(), Some(2));
        assert!(cfg.is_next_smaller_bdimx());
        assert_eq!(cfg.peek_next_gdimx(), None);

        assert!(cfg.move_to_next_config());
        assert_eq!(cfg.bdimx(), Some(8));
        assert_eq!(cfg.bdimy(), Some(32));
        assert_eq!(cfg.gdimx(), Some(54));
        assert!(!cfg.can_lower_bdimx());
    }

    #[test]
    fn test_exhaustion_is_terminal() {
        let mut cfg = PreferredLaunchConfig::new(108);
        let mut moves = 0;
        while cfg.move_to_next_config() {
            moves += 1;
        }
        // Two blockDim.x values times ten grid shapes, minus the start.
        assert_eq!(moves, 19);
        assert!(cfg.is_invalid());
        assert_eq!(cfg.gdimx(), None);
        assert_eq!(cfg.gdimy(), None);
        assert_eq!(cfg.peek_next_gdimx(), None);
        assert_eq!(cfg.bdimx(), None);
        assert!(!cfg.move_to_next_config());
        assert!(!cfg.move_to_next_bdim());
        assert_eq!(cfg.to_string(), "{gdimx: -1, gdimy: -1, bdimx: -1, bdimy: -1}");
    }

    #[test]
    fn test_prime_sm_count_is_invalid() {
        let cfg = PreferredLaunchConfig::new(13);
        assert!(cfg.is_invalid());
    }

    #[test]
    fn test_grid_outer_params_fit() {
        let device = DeviceInfo::mock();
        let opts = SchedulerOptions::default();
        // 4096 iteration elements, 8192 float reduction elements.
        let params =
            grid_outer_normalization_params(8192, 4096, 4, 8192 * 4, &device, &opts).unwrap();
        let lp = params.launch_params;
        assert_eq!(lp.threads_per_block(), Some(256));
        assert_eq!(lp.total_blocks(), Some(108));
        let bdimy = i64::from(lp.bdimy.unwrap());
        let gdimy = i64::from(lp.gdimy.unwrap());
        assert_eq!(params.persistent_buffer_factor, ceil_div(8192, bdimy * gdimy));
        assert!(params.persistent_buffer_factor * 4 * 4 <= (255 - 40) * 4);
        assert!(params.unswitch_factor >= 1);
    }

    #[test]
    fn test_grid_outer_params_exhausted() {
        let device = DeviceInfo::mock();
        let opts = SchedulerOptions::default();
        // Far too deep to keep resident across 108 blocks.
        assert!(
            grid_outer_normalization_params(1 << 24, 4096, 4, (1 << 24) * 4, &device, &opts)
                .is_none()
        );
    }

    #[test]
    fn test_grid_outer_params_tiny_iteration() {
        let device = DeviceInfo::mock();
        let opts = SchedulerOptions::default();
        // Iteration after vectorization is 4, below the smallest blockDim.x.
        assert!(grid_outer_normalization_params(1024, 16, 4, 4096, &device, &opts).is_none());
    }
}
