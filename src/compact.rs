//! Conversions between the wire shape of a run list and its logical shape.
//!
//! On disk a compressed compression unit is a run of real clusters followed
//! by a sparse run padding the unit to its full size. In logical form the
//! padding is folded into [`Fragment::compressed_filler_clusters`]; the
//! reverse happens in [`crate::fragment::save`].

use log::debug;

use crate::fragment::Fragment;

/// Fold every (run, small sparse run) pair that completes a compression unit
/// of `unit_clusters` clusters into one compressed fragment. The first run
/// may itself be sparse; it then stays sparse and keeps its filler.
///
/// There is no per-run compression flag on disk: the pair shape together
/// with a non-zero unit size is the only signal.
pub fn compact_compressed_fragments(fragments: &mut Vec<Fragment>, unit_clusters: u64) {
    if unit_clusters == 0 {
        return;
    }
    let mut i = 0;
    while i + 1 < fragments.len() {
        let (current, next) = (fragments[i], fragments[i + 1]);
        let filler = u64::from(current.compressed_filler_clusters) + next.cluster_count;
        let mergeable = next.is_sparse()
            && next.cluster_count < unit_clusters
            && filler <= u64::from(u8::MAX)
            && current
                .cluster_count
                .checked_add(filler)
                .is_some_and(|total| total % unit_clusters == 0);

        if mergeable {
            fragments[i].compressed_filler_clusters = filler as u8;
            fragments.remove(i + 1);
            // stay on i: another filler may follow
        } else {
            i += 1;
        }
    }
}

/// Merge neighbouring plain runs whose physical extents touch. Sparse and
/// compressed fragments are never merged.
pub fn compact_fragment_list(fragments: &mut Vec<Fragment>) {
    let before = fragments.len();
    let mut i = 0;
    while i + 1 < fragments.len() {
        let (current, next) = (fragments[i], fragments[i + 1]);
        let plain = |f: &Fragment| !f.is_sparse() && !f.is_compressed();
        if plain(&current)
            && plain(&next)
            && current.lcn.checked_add(current.cluster_count) == Some(next.lcn)
            && next.lcn.checked_add(next.cluster_count).is_some()
            && current.next_vcn() == next.starting_vcn
        {
            fragments[i].cluster_count += next.cluster_count;
            fragments.remove(i + 1);
        } else {
            i += 1;
        }
    }
    if fragments.len() != before {
        debug!(
            "Merged {} contiguous fragment(s), {} left",
            before - fragments.len(),
            fragments.len()
        );
    }
}
