//! Global index computation and `DataTransfer`: computes, for one
//! connection observed from a given rank, the matched source/target index
//! arrays a scatter needs, then applies them forward (insert) or reverse
//! (accumulate).

use std::collections::HashMap;

use crate::variable::UnitConv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScatterMode {
    Forward,
    Reverse,
}

impl ScatterMode {
    pub fn reversed(self) -> Self {
        match self {
            ScatterMode::Forward => ScatterMode::Reverse,
            ScatterMode::Reverse => ScatterMode::Forward,
        }
    }
}

/// A `(rank, var_index) -> local size` table, built from an `allgather` of
/// each rank's local variable sizes. Rows are ranks, columns are variables
/// in the deterministic iteration order established by the group's layout.
#[derive(Debug, Clone)]
pub struct SizesTable {
    /// `sizes[rank][var_idx]`
    sizes: Vec<Vec<usize>>,
}

impl SizesTable {
    pub fn new(sizes: Vec<Vec<usize>>) -> Self {
        SizesTable { sizes }
    }

    pub fn num_ranks(&self) -> usize {
        self.sizes.len()
    }

    pub fn num_vars(&self) -> usize {
        self.sizes.first().map_or(0, Vec::len)
    }

    pub fn size(&self, rank: usize, var_idx: usize) -> usize {
        self.sizes[rank][var_idx]
    }

    /// Global element count for `var_idx` across every rank.
    pub fn global_size(&self, var_idx: usize) -> usize {
        self.sizes.iter().map(|row| row[var_idx]).sum()
    }

    /// Flat offset, within the conceptual concatenation of every rank's
    /// buffer (all vars, in order), at which rank `rank`'s own buffer
    /// begins.
    fn rank_base_offset(&self, rank: usize) -> usize {
        self.sizes[..rank].iter().map(|row| row.iter().sum::<usize>()).sum()
    }

    /// Flat offset, within rank `rank`'s own buffer, at which `var_idx`
    /// begins (i.e. the sum of sizes of every earlier variable on that
    /// rank).
    fn var_offset_within_rank(&self, rank: usize, var_idx: usize) -> usize {
        self.sizes[rank][..var_idx].iter().sum()
    }

    /// Global flat offset of `var_idx`'s first element on `rank`.
    pub fn global_offset(&self, rank: usize, var_idx: usize) -> usize {
        self.rank_base_offset(rank) + self.var_offset_within_rank(rank, var_idx)
    }

    /// Sum, over ranks `0..rank`, of `var_idx`'s local size (i.e. how many
    /// elements of this one distributed variable live on earlier ranks).
    pub fn cumulative_before_rank(&self, rank: usize, var_idx: usize) -> usize {
        self.sizes[..rank].iter().map(|row| row[var_idx]).sum()
    }
}

/// Inputs describing one connection's endpoints, sufficient to compute its
/// global index arrays for a given mode and observing rank.
pub struct ConnectionEndpoints<'a> {
    pub src_var_idx: usize,
    pub tgt_var_idx: usize,
    pub src_total_size: usize,
    /// The *target's* `src_indices` selector, if any: when both source and
    /// target specify `src_indices`, the target's indices apply.
    pub tgt_src_indices: Option<&'a [usize]>,
    /// Whether the source variable is itself distributed via its own
    /// `src_indices` (rare).
    pub src_is_distributed: bool,
    pub owning_rank_of_src: usize,
    pub owning_rank_of_tgt: usize,
    pub src_remote_on_this_rank: bool,
    pub tgt_remote_on_this_rank: bool,
}

/// Computes `(src_global_idx, tgt_global_idx)` for one connection, as
/// observed on `this_rank`. Remote endpoints yield empty arrays (a no-op
/// scatter on that rank).
pub fn compute_global_idxs(
    u_sizes: &SizesTable,
    p_sizes: &SizesTable,
    ep: &ConnectionEndpoints,
    mode: ScatterMode,
    this_rank: usize,
) -> (Vec<usize>, Vec<usize>) {
    let rev = matches!(mode, ScatterMode::Reverse);
    let pdist = ep.tgt_src_indices.is_some();
    let udist = ep.src_is_distributed;

    let no_op = (!rev && ep.tgt_remote_on_this_rank)
        || (rev && !pdist && ep.src_remote_on_this_rank)
        || (rev && udist && !pdist && this_rank != ep.owning_rank_of_tgt);
    if no_op {
        return (Vec::new(), Vec::new());
    }

    let arg_idxs: Vec<usize> = match ep.tgt_src_indices {
        Some(idxs) => idxs.to_vec(),
        None => (0..ep.src_total_size).collect(),
    };

    let ivar = ep.src_var_idx;
    let (src_idxs, var_rank_for_tgt) = if udist || pdist {
        let mut new_indices = vec![0usize; arg_idxs.len()];
        for irank in 0..u_sizes.num_ranks() {
            let start = u_sizes.cumulative_before_rank(irank, ivar);
            let end = start + u_sizes.size(irank, ivar);
            let offset =
                u_sizes.rank_base_offset(irank) + u_sizes.var_offset_within_rank(irank, ivar);
            for (slot, &idx) in arg_idxs.iter().enumerate() {
                if idx >= start && idx < end {
                    new_indices[slot] = idx - start + offset;
                }
            }
        }
        (new_indices, this_rank)
    } else {
        let var_rank = if !rev { ep.owning_rank_of_src } else { this_rank };
        let offset = u_sizes.global_offset(var_rank, ivar);
        let idxs: Vec<usize> = arg_idxs.iter().map(|&a| a + offset).collect();
        let var_rank_for_tgt = if rev { ep.owning_rank_of_tgt } else { this_rank };
        (idxs, var_rank_for_tgt)
    };

    let tgt_start = p_sizes.global_offset(var_rank_for_tgt, ep.tgt_var_idx);
    let tgt_idxs: Vec<usize> = (0..arg_idxs.len()).map(|i| tgt_start + i).collect();

    (src_idxs, tgt_idxs)
}

/// A pass-by-object connection, transferred by reference update rather than
/// indexed copy; excluded from reverse-mode (derivative) transfers.
#[derive(Debug, Clone)]
pub struct ByObjPair {
    pub tgt_promoted: String,
    pub src_promoted: String,
}

/// One precomputed scatter: merged source/target index arrays (with a
/// per-entry unit conversion for forward value transfers) plus any
/// pass-by-object pairs routed through this transfer.
#[derive(Debug, Clone)]
pub struct DataTransfer {
    pub src_idx: Vec<usize>,
    pub tgt_idx: Vec<usize>,
    /// `(scale, offset)` per entry of `src_idx`/`tgt_idx`, identity when no
    /// unit conversion is declared on that target.
    pub conv: Vec<UnitConv>,
    pub byobj: Vec<ByObjPair>,
    pub mode: ScatterMode,
}

impl DataTransfer {
    pub fn new(mode: ScatterMode) -> Self {
        DataTransfer {
            src_idx: Vec::new(),
            tgt_idx: Vec::new(),
            conv: Vec::new(),
            byobj: Vec::new(),
            mode,
        }
    }

    /// Appends one connection's computed indices (and the unit conversion
    /// that applies to its target) to this transfer.
    pub fn push(&mut self, mut src_idx: Vec<usize>, mut tgt_idx: Vec<usize>, conv: UnitConv) {
        debug_assert_eq!(src_idx.len(), tgt_idx.len());
        self.conv.resize(self.conv.len() + src_idx.len(), conv);
        self.src_idx.append(&mut src_idx);
        self.tgt_idx.append(&mut tgt_idx);
    }

    /// Builds the "full" transfer for a group: the concatenation of every
    /// per-child transfer for the same `(mode, voi)`.
    pub fn merge<'a>(mode: ScatterMode, parts: impl IntoIterator<Item = &'a DataTransfer>) -> Self {
        let mut full = DataTransfer::new(mode);
        for part in parts {
            full.src_idx.extend_from_slice(&part.src_idx);
            full.tgt_idx.extend_from_slice(&part.tgt_idx);
            full.conv.extend_from_slice(&part.conv);
            full.byobj.extend(part.byobj.iter().cloned());
        }
        full
    }

    /// Applies the scatter: forward mode copies `src[src_idx] ->
    /// tgt[tgt_idx]` (with unit conversion, unless `deriv`); reverse mode
    /// accumulates `src[src_idx] += tgt[tgt_idx]`.
    pub fn transfer(&self, src: &mut [f64], tgt: &mut [f64], deriv: bool) {
        match self.mode {
            ScatterMode::Forward => {
                for ((&s, &t), conv) in self.src_idx.iter().zip(&self.tgt_idx).zip(&self.conv) {
                    let (scale, offset) = if deriv { conv.deriv_conv() } else { conv.value_conv() };
                    tgt[t] = src[s] * scale + offset;
                }
            }
            ScatterMode::Reverse => {
                for ((&s, &t), conv) in self.src_idx.iter().zip(&self.tgt_idx).zip(&self.conv) {
                    src[s] += tgt[t] * conv.deriv_conv().0;
                }
            }
        }
    }
}

/// Looks up a unit conversion by absolute target path, defaulting to
/// identity.
pub fn conv_or_identity(convs: &HashMap<String, UnitConv>, path: &str) -> UnitConv {
    convs.get(path).copied().unwrap_or_else(UnitConv::identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_rank(sizes: Vec<usize>) -> SizesTable {
        SizesTable::new(vec![sizes])
    }

    #[test]
    fn simple_single_rank_connection() {
        // one source var of size 1 at index 0, one target var of size 1 at index 0
        let u = single_rank(vec![1]);
        let p = single_rank(vec![1]);
        let ep = ConnectionEndpoints {
            src_var_idx: 0,
            tgt_var_idx: 0,
            src_total_size: 1,
            tgt_src_indices: None,
            src_is_distributed: false,
            owning_rank_of_src: 0,
            owning_rank_of_tgt: 0,
            src_remote_on_this_rank: false,
            tgt_remote_on_this_rank: false,
        };
        let (s, t) = compute_global_idxs(&u, &p, &ep, ScatterMode::Forward, 0);
        assert_eq!(s, vec![0]);
        assert_eq!(t, vec![0]);
    }

    #[test]
    fn src_indices_selection_preserves_length_and_offsets() {
        // source size 5, target declares src_indices = [0, 2, 4]
        let u = single_rank(vec![5]);
        let p = single_rank(vec![3]);
        let sel = vec![0usize, 2, 4];
        let ep = ConnectionEndpoints {
            src_var_idx: 0,
            tgt_var_idx: 0,
            src_total_size: 5,
            tgt_src_indices: Some(&sel),
            src_is_distributed: false,
            owning_rank_of_src: 0,
            owning_rank_of_tgt: 0,
            src_remote_on_this_rank: false,
            tgt_remote_on_this_rank: false,
        };
        let (s, t) = compute_global_idxs(&u, &p, &ep, ScatterMode::Forward, 0);
        assert_eq!(s, vec![0, 2, 4]);
        assert_eq!(t, vec![0, 1, 2]);
        assert_eq!(s.len(), t.len());
    }

    #[test]
    fn distributed_ownership_two_ranks() {
        // variable `x` size 4, local to rank 0 only; target size 4 on rank 1.
        let u = SizesTable::new(vec![vec![4], vec![0]]);
        let p = SizesTable::new(vec![vec![0], vec![4]]);

        let ep_rank0 = ConnectionEndpoints {
            src_var_idx: 0,
            tgt_var_idx: 0,
            src_total_size: 4,
            tgt_src_indices: None,
            src_is_distributed: false,
            owning_rank_of_src: 0,
            owning_rank_of_tgt: 1,
            src_remote_on_this_rank: false,
            tgt_remote_on_this_rank: true,
        };
        let (s0, t0) = compute_global_idxs(&u, &p, &ep_rank0, ScatterMode::Forward, 0);
        assert_eq!(s0, vec![0, 1, 2, 3]);
        assert!(t0.is_empty());

        let ep_rank1 = ConnectionEndpoints {
            tgt_remote_on_this_rank: false,
            src_remote_on_this_rank: true,
            ..ep_rank0
        };
        let (s1, t1) = compute_global_idxs(&u, &p, &ep_rank1, ScatterMode::Forward, 1);
        assert!(s1.is_empty());
        assert_eq!(t1, vec![0, 1, 2, 3]);
    }

    #[test]
    fn full_transfer_equals_concatenation_of_parts() {
        let mut a = DataTransfer::new(ScatterMode::Forward);
        a.push(vec![0, 1], vec![0, 1], UnitConv::identity());
        let mut b = DataTransfer::new(ScatterMode::Forward);
        b.push(vec![2], vec![2], UnitConv::identity());
        let full = DataTransfer::merge(ScatterMode::Forward, [&a, &b]);
        assert_eq!(full.src_idx, vec![0, 1, 2]);
        assert_eq!(full.tgt_idx, vec![0, 1, 2]);
    }

    #[test]
    fn unit_conversion_applies_on_forward_value_only() {
        let mut xfer = DataTransfer::new(ScatterMode::Forward);
        xfer.push(vec![0], vec![0], UnitConv { scale: 100.0, offset: 0.0 });
        let mut src = vec![1.0];
        let mut tgt = vec![0.0];
        xfer.transfer(&mut src, &mut tgt, false);
        assert_eq!(tgt[0], 100.0);

        tgt[0] = 0.0;
        xfer.transfer(&mut src, &mut tgt, true);
        assert_eq!(tgt[0], 100.0); // scale still applies, offset suppressed either way here (offset=0)
    }

    #[test]
    fn reverse_transfer_accumulates_into_source() {
        let mut xfer = DataTransfer::new(ScatterMode::Reverse);
        xfer.push(vec![0], vec![0], UnitConv::identity());
        let mut src = vec![1.0];
        let mut tgt = vec![2.0];
        xfer.transfer(&mut src, &mut tgt, true);
        assert_eq!(src[0], 3.0);
    }

    #[test]
    fn reverse_transfer_applies_unit_conversion_scale() {
        // the adjoint of a unit-converted connection must scale the
        // accumulated value by the same factor the forward deriv transfer
        // uses, with the offset suppressed on both sides.
        let mut xfer = DataTransfer::new(ScatterMode::Reverse);
        xfer.push(vec![0], vec![0], UnitConv { scale: 2.5, offset: 32.0 });
        let mut src = vec![1.0];
        let mut tgt = vec![4.0];
        xfer.transfer(&mut src, &mut tgt, true);
        assert_eq!(src[0], 1.0 + 4.0 * 2.5);
    }
}
