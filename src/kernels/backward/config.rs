// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Kernel configuration for the attention backward pass.
//!
//! Tile shapes and residency decisions are derived from three inputs: the
//! target architecture, the storage precision, and an upper bound on the head
//! dimension. They are evaluated once per variant and threaded through the
//! kernel as plain values.
//!
//! | Constant              | Rule                                                      |
//! |-----------------------|-----------------------------------------------------------|
//! | `block_i` (queries)   | 128 if 64x128 tiles are supported and max-K > 64, else 64 |
//! | `block_j` (keys)      | 128 if preload mode and max-K > 64, else 64               |
//! | `output_in_rf`        | half precision and max-K <= `block_i`                     |
//! | `preload_mmas`        | half precision, sm80+, `output_in_rf`                     |
//! | `needs_accum_grad_q`  | half precision                                            |
//! | `needs_accum_grad_kv` | half precision and not `output_in_rf`                     |

use std::fmt;

use crate::error::{BackwardError, Result};
use crate::memory::SharedLayout;

/// Threads per warp.
pub const WARP_SIZE: usize = 32;

/// Target compute capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    /// Maxwell (sm50).
    Sm50,
    /// Volta (sm70).
    Sm70,
    /// Turing (sm75).
    Sm75,
    /// Ampere and newer (sm80).
    Sm80,
}

impl Arch {
    /// All architectures a variant can be built for.
    pub const ALL: [Arch; 4] = [Arch::Sm50, Arch::Sm70, Arch::Sm75, Arch::Sm80];

    /// Compute capability as `major * 10 + minor`.
    #[must_use]
    pub const fn compute_capability(self) -> u32 {
        match self {
            Arch::Sm50 => 50,
            Arch::Sm70 => 70,
            Arch::Sm75 => 75,
            Arch::Sm80 => 80,
        }
    }

    /// Shared memory available to one block, in bytes.
    #[must_use]
    pub const fn shared_memory_budget(self) -> usize {
        match self {
            Arch::Sm50 | Arch::Sm75 => 64 * 1024,
            Arch::Sm70 => 96 * 1024,
            Arch::Sm80 => 160 * 1024,
        }
    }

    /// Whether 64x128 query tiles fit the register/shared budget.
    #[must_use]
    pub const fn supports_64x128(self, precision: Precision) -> bool {
        let cc = self.compute_capability();
        cc >= 80 || (cc >= 70 && precision.is_half())
    }

    /// Whether matmuls of this precision run on tensor cores.
    #[must_use]
    pub const fn uses_tensor_cores(self, precision: Precision) -> bool {
        let cc = self.compute_capability();
        if precision.is_half() {
            cc >= 75
        } else {
            cc >= 80
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm{}", self.compute_capability())
    }
}

/// Storage precision of inputs and gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    /// 32-bit float.
    F32,
    /// IEEE half.
    F16,
    /// bfloat16.
    BF16,
}

impl Precision {
    /// 16-bit storage types.
    #[must_use]
    pub const fn is_half(self) -> bool {
        matches!(self, Precision::F16 | Precision::BF16)
    }

    /// Element size in bytes.
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F16 | Precision::BF16 => 2,
        }
    }

    /// Oldest architecture with a variant for this precision.
    #[must_use]
    pub const fn min_arch(self) -> Arch {
        match self {
            Precision::BF16 => Arch::Sm80,
            Precision::F32 | Precision::F16 => Arch::Sm50,
        }
    }
}

/// Head-dimension bucket a variant is specialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MaxK {
    /// Head dims up to 64.
    K64,
    /// Head dims up to 128.
    K128,
    /// Any head dim.
    Unbounded,
}

impl MaxK {
    /// Buckets in dispatch order, smallest first.
    pub const BUCKETS: [MaxK; 3] = [MaxK::K64, MaxK::K128, MaxK::Unbounded];

    /// Upper bound on `max(head_dim, head_dim_value)`, if any.
    #[must_use]
    pub const fn limit(self) -> Option<usize> {
        match self {
            MaxK::K64 => Some(64),
            MaxK::K128 => Some(128),
            MaxK::Unbounded => None,
        }
    }

    /// Whether a head dim fits this bucket.
    #[must_use]
    pub const fn fits(self, head_dim: usize) -> bool {
        match self.limit() {
            Some(limit) => head_dim <= limit,
            None => true,
        }
    }

    /// Whether the bucket admits head dims above 64.
    #[must_use]
    pub const fn exceeds_64(self) -> bool {
        !matches!(self, MaxK::K64)
    }
}

/// Tile shapes and residency flags of one kernel build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelConfig {
    /// Target architecture.
    pub arch: Arch,
    /// Storage precision.
    pub precision: Precision,
    /// Head-dimension bucket.
    pub max_k: MaxK,
    /// Query rows per tile.
    pub block_i: usize,
    /// Key rows per tile.
    pub block_j: usize,
    /// Keep dK/dV for a whole key tile in registers across the query loop.
    pub output_in_rf: bool,
    /// Prefetch the next iteration's operands while the current multiply runs.
    pub preload_mmas: bool,
    /// The kernel computes the row delta itself (otherwise the host does).
    pub kernel_computes_delta: bool,
    /// dQ partial sums live in the f32 workspace.
    pub needs_accum_grad_q: bool,
    /// dK partial sums live in the f32 workspace.
    pub needs_accum_grad_k: bool,
    /// dV partial sums live in the f32 workspace.
    pub needs_accum_grad_v: bool,
    /// Warps per block.
    pub num_warps: usize,
    /// Minimum alignment, in elements, of base pointers and head strides.
    pub min_alignment: usize,
}

impl KernelConfig {
    /// Derive the configuration for one (arch, precision, bucket) triple.
    #[must_use]
    pub const fn new(arch: Arch, precision: Precision, max_k: MaxK) -> Self {
        let is_half = precision.is_half();
        let block_i = if arch.supports_64x128(precision) && max_k.exceeds_64() {
            128
        } else {
            64
        };
        let output_in_rf = is_half
            && match max_k.limit() {
                Some(limit) => limit <= block_i,
                None => false,
            };
        let preload_mmas = is_half && arch.compute_capability() >= 80 && output_in_rf;
        let block_j = if preload_mmas && max_k.exceeds_64() {
            128
        } else {
            64
        };
        let kernel_computes_delta =
            is_half && (output_in_rf || arch.compute_capability() != 70);
        let min_alignment = if arch.uses_tensor_cores(precision) {
            128 / (precision.size_in_bytes() * 8)
        } else {
            1
        };

        Self {
            arch,
            precision,
            max_k,
            block_i,
            block_j,
            output_in_rf,
            preload_mmas,
            kernel_computes_delta,
            needs_accum_grad_q: is_half,
            needs_accum_grad_k: is_half && !output_in_rf,
            needs_accum_grad_v: is_half && !output_in_rf,
            num_warps: (block_i * block_j) / (WARP_SIZE * WARP_SIZE),
            min_alignment,
        }
    }

    /// Threads per block.
    #[must_use]
    pub const fn num_threads(&self) -> usize {
        self.num_warps * WARP_SIZE
    }

    /// Columns produced per pass of the dV and dK multiplies.
    #[must_use]
    pub const fn grad_kv_tile_cols(&self) -> usize {
        self.block_i
    }

    /// Columns produced per pass of the dQ multiply.
    #[must_use]
    pub const fn grad_q_tile_cols(&self) -> usize {
        self.block_j
    }

    /// Number of query tiles for a query length.
    #[must_use]
    pub const fn num_query_tiles(&self, num_queries: usize) -> usize {
        num_queries.div_ceil(self.block_i)
    }

    /// Number of key tiles for a key length.
    #[must_use]
    pub const fn num_key_tiles(&self, num_keys: usize) -> usize {
        num_keys.div_ceil(self.block_j)
    }

    /// Shared storage a block needs, in bytes.
    #[must_use]
    pub const fn shared_memory_bytes(&self, dropout: bool) -> usize {
        SharedLayout::total_bytes_for(
            self.block_i,
            self.block_j,
            self.precision.size_in_bytes(),
            dropout,
        )
    }
}

/// One instantiated kernel: a configuration plus the causal/dropout switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelVariant {
    /// Tile configuration.
    pub config: KernelConfig,
    /// Built with causal masking.
    pub causal: bool,
    /// Built with dropout-mask regeneration.
    pub dropout: bool,
    layout: SharedLayout,
}

impl KernelVariant {
    /// Build a variant, checking that its shared storage fits the architecture.
    ///
    /// # Errors
    /// Returns `ArchitectureMismatch` if the precision has no kernel on this
    /// architecture, or `OutOfMemory` if the shared layout exceeds the budget.
    pub fn new(
        arch: Arch,
        precision: Precision,
        max_k: MaxK,
        causal: bool,
        dropout: bool,
    ) -> Result<Self> {
        let required = precision.min_arch();
        if arch < required {
            return Err(BackwardError::ArchitectureMismatch {
                required: required.compute_capability(),
                actual: arch.compute_capability(),
            });
        }
        let config = KernelConfig::new(arch, precision, max_k);
        let layout = SharedLayout::new(
            config.block_i,
            config.block_j,
            precision.size_in_bytes(),
            dropout,
            arch.shared_memory_budget(),
        )?;
        Ok(Self {
            config,
            causal,
            dropout,
            layout,
        })
    }

    /// Shared storage layout of this variant.
    #[must_use]
    pub const fn shared_layout(&self) -> &SharedLayout {
        &self.layout
    }

    /// Whether this variant handles the given head dims.
    #[must_use]
    pub const fn supports_head_dims(&self, head_dim: usize, head_dim_value: usize) -> bool {
        self.config.max_k.fits(head_dim) && self.config.max_k.fits(head_dim_value)
    }

    /// Refuse to run on a device older than the variant's target.
    ///
    /// # Errors
    /// Returns `ArchitectureMismatch` when `device` predates the variant.
    pub fn check_device(&self, device: Arch) -> Result<()> {
        if device < self.config.arch {
            return Err(BackwardError::ArchitectureMismatch {
                required: self.config.arch.compute_capability(),
                actual: device.compute_capability(),
            });
        }
        Ok(())
    }
}

/// Lookup key into the variant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchKey {
    /// Storage precision.
    pub precision: Precision,
    /// Causal masking.
    pub causal: bool,
    /// Dropout enabled.
    pub dropout: bool,
    /// `max(head_dim, head_dim_value)`.
    pub max_head_dim: usize,
}

/// The closed set of variants built for one architecture.
///
/// Every (precision, causal, dropout, bucket) combination the architecture
/// supports is instantiated once; `select` picks the smallest fitting bucket.
#[derive(Debug, Clone)]
pub struct VariantTable {
    arch: Arch,
    variants: Vec<KernelVariant>,
}

impl VariantTable {
    /// Instantiate the table for an architecture.
    #[must_use]
    pub fn for_arch(arch: Arch) -> Self {
        let mut variants = Vec::new();
        for precision in [Precision::F32, Precision::F16, Precision::BF16] {
            for causal in [false, true] {
                for dropout in [false, true] {
                    for max_k in MaxK::BUCKETS {
                        // Combinations the arch cannot host are simply absent.
                        if let Ok(variant) =
                            KernelVariant::new(arch, precision, max_k, causal, dropout)
                        {
                            variants.push(variant);
                        }
                    }
                }
            }
        }
        Self { arch, variants }
    }

    /// Number of instantiated variants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Pick the variant for a problem.
    ///
    /// # Errors
    /// Returns `ArchitectureMismatch` when no variant of the precision exists
    /// for this architecture.
    pub fn select(&self, key: DispatchKey) -> Result<KernelVariant> {
        let selected = self
            .variants
            .iter()
            .filter(|v| {
                v.config.precision == key.precision
                    && v.causal == key.causal
                    && v.dropout == key.dropout
                    && v.config.max_k.fits(key.max_head_dim)
            })
            .min_by_key(|v| v.config.max_k)
            .copied();

        match selected {
            Some(variant) => {
                tracing::debug!(
                    "Selected {} variant: {:?} block {}x{} rf={} causal={} dropout={}",
                    self.arch,
                    variant.config.max_k,
                    variant.config.block_i,
                    variant.config.block_j,
                    variant.config.output_in_rf,
                    variant.causal,
                    variant.dropout
                );
                Ok(variant)
            }
            None => Err(BackwardError::ArchitectureMismatch {
                required: key.precision.min_arch().compute_capability(),
                actual: self.arch.compute_capability(),
            }),
        }
    }
}

/// Select a variant for a problem on the given architecture.
///
/// # Errors
/// See [`VariantTable::select`].
pub fn dispatch(arch: Arch, key: DispatchKey) -> Result<KernelVariant> {
    VariantTable::for_arch(arch).select(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_tiles() {
        let sm50 = KernelConfig::new(Arch::Sm50, Precision::F32, MaxK::Unbounded);
        assert_eq!((sm50.block_i, sm50.block_j), (64, 64));
        assert!(!sm50.output_in_rf);
        assert!(!sm50.needs_accum_grad_q);
        assert!(!sm50.kernel_computes_delta);
        assert_eq!(sm50.min_alignment, 1);

        let sm80 = KernelConfig::new(Arch::Sm80, Precision::F32, MaxK::K128);
        assert_eq!((sm80.block_i, sm80.block_j), (128, 64));
        assert_eq!(sm80.min_alignment, 4);
        assert_eq!(sm80.num_warps, 8);
    }

    #[test]
    fn test_half_tiles() {
        let small = KernelConfig::new(Arch::Sm80, Precision::F16, MaxK::K64);
        assert_eq!((small.block_i, small.block_j), (64, 64));
        assert!(small.output_in_rf);
        assert!(small.preload_mmas);
        assert!(small.needs_accum_grad_q);
        assert!(!small.needs_accum_grad_k);
        assert_eq!(small.min_alignment, 8);

        let mid = KernelConfig::new(Arch::Sm80, Precision::F16, MaxK::K128);
        assert_eq!((mid.block_i, mid.block_j), (128, 128));
        assert!(mid.output_in_rf);
        assert_eq!(mid.num_warps, 16);

        let big = KernelConfig::new(Arch::Sm80, Precision::F16, MaxK::Unbounded);
        assert_eq!((big.block_i, big.block_j), (128, 64));
        assert!(!big.output_in_rf);
        assert!(big.needs_accum_grad_k && big.needs_accum_grad_v);
    }

    #[test]
    fn test_volta_delta_on_host() {
        let cfg = KernelConfig::new(Arch::Sm70, Precision::F16, MaxK::Unbounded);
        assert!(!cfg.output_in_rf);
        assert!(!cfg.kernel_computes_delta);

        let cfg = KernelConfig::new(Arch::Sm70, Precision::F16, MaxK::K64);
        assert!(cfg.kernel_computes_delta);
    }

    #[test]
    fn test_num_tiles() {
        let cfg = KernelConfig::new(Arch::Sm50, Precision::F32, MaxK::K64);
        assert_eq!(cfg.num_query_tiles(64), 1);
        assert_eq!(cfg.num_query_tiles(65), 2);
        assert_eq!(cfg.num_key_tiles(0), 0);
    }

    #[test]
    fn test_bf16_requires_sm80() {
        let err = KernelVariant::new(Arch::Sm75, Precision::BF16, MaxK::K64, false, false);
        assert!(matches!(
            err,
            Err(BackwardError::ArchitectureMismatch {
                required: 80,
                actual: 75
            })
        ));
        assert!(KernelVariant::new(Arch::Sm80, Precision::BF16, MaxK::K64, false, false).is_ok());
    }

    #[test]
    fn test_every_variant_fits_shared_memory() {
        for arch in Arch::ALL {
            let table = VariantTable::for_arch(arch);
            let expected_precisions = if arch >= Arch::Sm80 { 3 } else { 2 };
            assert_eq!(table.len(), expected_precisions * 2 * 2 * MaxK::BUCKETS.len());
        }
    }

    #[test]
    fn test_dispatch_smallest_bucket() {
        let key = DispatchKey {
            precision: Precision::F16,
            causal: true,
            dropout: false,
            max_head_dim: 80,
        };
        let variant = dispatch(Arch::Sm80, key).unwrap();
        assert_eq!(variant.config.max_k, MaxK::K128);
        assert!(variant.causal);

        let key = DispatchKey {
            max_head_dim: 256,
            ..key
        };
        assert_eq!(dispatch(Arch::Sm80, key).unwrap().config.max_k, MaxK::Unbounded);
    }

    #[test]
    fn test_check_device() {
        let variant = KernelVariant::new(Arch::Sm80, Precision::F32, MaxK::K64, false, false).unwrap();
        assert!(variant.check_device(Arch::Sm80).is_ok());
        assert!(matches!(
            variant.check_device(Arch::Sm75),
            Err(BackwardError::ArchitectureMismatch { .. })
        ));
    }
}
