//! MPI adapter contract.
//!
//! The core never talks to a concrete MPI binding. It consumes a
//! [`Communicator`]: rank/size, a blocking `allgather`, and a scatter
//! primitive keyed by (source_indices, target_indices) supporting insert
//! (fwd) and accumulate (rev) modes. When no real transport is wired in,
//! [`SingleRankCommunicator`] is used (size=1, rank=0, `allgather` wraps its
//! argument in a single-element list). A real MPI binding is an external
//! collaborator and out of scope for this crate.

use crate::transfer::ScatterMode;

/// Collective operations the core needs from a parallel transport.
///
/// Every method is collective: every rank sharing a `Communicator` instance
/// must call it in the same order.
pub trait Communicator: std::fmt::Debug {
    /// Number of ranks sharing this communicator.
    fn size(&self) -> usize;

    /// This process's rank within the communicator, in `0..size()`.
    fn rank(&self) -> usize;

    /// Gather `value` from every rank and return it to every rank, in rank
    /// order.
    fn allgather(&self, value: &[usize]) -> Vec<Vec<usize>>;

    /// Move `src[i]` into/onto `dst[tgt_idx[i]]` for every `i`, using the
    /// given [`ScatterMode`]. `src` and `dst` are the *local* (this rank's)
    /// slices of the global flat buffers; `src_idx`/`tgt_idx` have already
    /// been rebased to this rank's local offsets by the caller.
    fn scatter(&self, src: &[f64], src_idx: &[usize], dst: &mut [f64], tgt_idx: &[usize], mode: ScatterMode);
}

/// Single-process stub used whenever no real parallel transport exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleRankCommunicator;

impl Communicator for SingleRankCommunicator {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn allgather(&self, value: &[usize]) -> Vec<Vec<usize>> {
        vec![value.to_vec()]
    }

    fn scatter(&self, src: &[f64], src_idx: &[usize], dst: &mut [f64], tgt_idx: &[usize], mode: ScatterMode) {
        apply_scatter(src, src_idx, dst, tgt_idx, mode);
    }
}

/// Shared scatter-application routine used by every in-process
/// `Communicator`: insert in forward mode, accumulate in reverse mode.
pub(crate) fn apply_scatter(
    src: &[f64],
    src_idx: &[usize],
    dst: &mut [f64],
    tgt_idx: &[usize],
    mode: ScatterMode,
) {
    debug_assert_eq!(src_idx.len(), tgt_idx.len());
    match mode {
        ScatterMode::Forward => {
            for (&s, &t) in src_idx.iter().zip(tgt_idx.iter()) {
                dst[t] = src[s];
            }
        }
        ScatterMode::Reverse => {
            for (&s, &t) in src_idx.iter().zip(tgt_idx.iter()) {
                dst[t] += src[s];
            }
        }
    }
}
