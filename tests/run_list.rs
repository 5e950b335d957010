use exhume_ntfs_runs::fragment::{check_contiguous, to_bytes};
use exhume_ntfs_runs::varrun::{decode_one, encode_one};
use exhume_ntfs_runs::{
    Fragment, NtfsError, compact_compressed_fragments, compact_fragment_list, get_save_length,
    parse_fragments, save,
};

fn last_vcn(fragments: &[Fragment]) -> u64 {
    fragments.last().map_or(0, |f| f.next_vcn()) - 1
}

/// Parse, check VCN tiling, re-serialize and compare with the input.
fn assert_round_trip(raw: &[u8], ending_vcn: u64, unit_clusters: u64) -> Vec<Fragment> {
    let mut fragments = parse_fragments(raw, raw.len(), 0, 0, ending_vcn).unwrap();
    compact_compressed_fragments(&mut fragments, unit_clusters);
    check_contiguous(&fragments).unwrap();
    assert_eq!(fragments[0].starting_vcn, 0);
    assert_eq!(last_vcn(&fragments), ending_vcn);

    let len = get_save_length(&fragments).unwrap();
    assert_eq!(len, raw.len());
    let mut out = vec![0xAAu8; len + 4];
    assert_eq!(save(&mut out, 2, &fragments).unwrap(), len);
    assert_eq!(&out[2..2 + len], raw);
    assert_eq!(&out[..2], &[0xAA, 0xAA]);
    fragments
}

#[test]
fn single_run_with_two_byte_delta() {
    // trailing padding after the terminator is not part of the run list
    let raw = [0x21, 0x18, 0x34, 0x56, 0x00, 0x00];
    let fragments = parse_fragments(&raw, raw.len(), 0, 0, 23).unwrap();
    assert_eq!(
        fragments,
        vec![Fragment {
            starting_vcn: 0,
            cluster_count: 0x18,
            lcn: 0x5634,
            compressed_filler_clusters: 0,
        }]
    );
    assert_eq!(get_save_length(&fragments).unwrap(), 5);
    assert_eq!(to_bytes(&fragments).unwrap(), &raw[..5]);
}

#[test]
fn sparse_run_between_real_runs() {
    let raw = [0x11, 0x30, 0x20, 0x01, 0x60, 0x11, 0x10, 0x30, 0x00];
    let fragments = assert_round_trip(&raw, 159, 0);
    assert_eq!(fragments.len(), 3);

    assert_eq!((fragments[0].starting_vcn, fragments[0].cluster_count), (0, 48));
    assert_eq!(fragments[0].lcn, 32);

    assert!(fragments[1].is_sparse());
    assert_eq!((fragments[1].starting_vcn, fragments[1].cluster_count), (48, 96));

    // delta is relative to the last real run, not to the sparse one
    assert_eq!(fragments[2].starting_vcn, 144);
    assert_eq!(fragments[2].lcn, 80);
}

#[test]
fn compressed_unit_is_folded_into_one_fragment() {
    let raw = [0x21, 0x02, 0xEF, 0x07, 0x01, 0x0E, 0x00];
    let fragments = assert_round_trip(&raw, 15, 16);
    assert_eq!(
        fragments,
        vec![Fragment {
            starting_vcn: 0,
            cluster_count: 2,
            lcn: 2031,
            compressed_filler_clusters: 14,
        }]
    );
    assert!(fragments[0].is_compressed());
    assert_eq!(fragments[0].virtual_cluster_count(), 16);
}

#[test]
fn compressed_pattern_without_unit_stays_wire_shaped() {
    let raw = [0x21, 0x02, 0xEF, 0x07, 0x01, 0x0E, 0x00];
    let fragments = assert_round_trip(&raw, 15, 0);
    assert_eq!(fragments.len(), 2);
    assert!(fragments[1].is_sparse());
}

#[test]
fn compressed_units_around_a_plain_unit() {
    // 2 + 14 filler, 16 stored as is, 3 + 13 filler
    let raw = [
        0x11, 0x02, 0x20, 0x01, 0x0E, 0x11, 0x10, 0x10, 0x11, 0x03, 0x05, 0x01, 0x0D, 0x00,
    ];
    let fragments = assert_round_trip(&raw, 47, 16);
    assert_eq!(fragments.len(), 3);
    assert_eq!(fragments[0].compressed_filler_clusters, 14);
    assert!(!fragments[1].is_compressed());
    assert_eq!((fragments[1].starting_vcn, fragments[1].lcn), (16, 48));
    assert_eq!(fragments[2].starting_vcn, 32);
    assert_eq!(fragments[2].lcn, 53);
    assert_eq!(fragments[2].compressed_filler_clusters, 13);
}

#[test]
fn four_byte_delta_uses_minimal_width() {
    let raw = [0x41, 0x01, 0x34, 0x38, 0x3D, 0x0B];
    let (fragment, used) = decode_one(&raw, 0, 0).unwrap();
    assert_eq!(used, raw.len());
    assert_eq!(fragment.cluster_count, 1);
    assert_eq!(fragment.lcn, 0x0B3D_3834);
    assert_eq!(encode_one(&fragment, 0).unwrap(), raw);
}

#[test]
fn run_list_ends_at_first_zero_header() {
    let raw = [0x31, 0x03, 0x1D, 0x41, 0x01, 0x00, 0x31, 0x05, 0xF0, 0xFF, 0xFF, 0x00];
    let fragments = parse_fragments(&raw, raw.len(), 0, 0, 2).unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].cluster_count, 3);
    assert_eq!(fragments[0].lcn, 0x01_411D);
    assert_eq!(to_bytes(&fragments).unwrap(), &raw[..6]);
}

#[test]
fn negative_one_byte_delta() {
    // +100, +10000, -10
    let raw = [
        0x11, 0x04, 0x64, 0x21, 0x02, 0x10, 0x27, 0x11, 0x08, 0xF6, 0x00,
    ];
    let fragments = assert_round_trip(&raw, 13, 0);
    let lcns: Vec<u64> = fragments.iter().map(|f| f.lcn).collect();
    assert_eq!(lcns, vec![100, 10_100, 10_090]);
}

#[test]
fn negative_two_byte_delta() {
    // +4096 then -256
    let raw = [0x21, 0x10, 0x00, 0x10, 0x21, 0x04, 0x00, 0xFF, 0x00];
    let fragments = assert_round_trip(&raw, 19, 0);
    assert_eq!(fragments[0].lcn, 4096);
    assert_eq!(fragments[1].lcn, 3840);
    assert_eq!(fragments[1].starting_vcn, 16);
}

#[test]
fn declared_range_must_match() {
    let raw = [0x11, 0x30, 0x20, 0x01, 0x60, 0x11, 0x10, 0x30, 0x00];
    match parse_fragments(&raw, raw.len(), 0, 0, 200) {
        Err(NtfsError::RunListVcnMismatch {
            declared_end,
            actual_end,
            ..
        }) => {
            assert_eq!(declared_end, 200);
            assert_eq!(actual_end, 159);
        }
        other => panic!("expected a VCN mismatch, got {:?}", other),
    }
}

#[test]
fn extension_attribute_starts_past_zero() {
    let raw = [0x11, 0x08, 0x40, 0x00];
    let fragments = parse_fragments(&raw, raw.len(), 0, 300, 307).unwrap();
    assert_eq!(fragments[0].starting_vcn, 300);
    assert_eq!(fragments[0].next_vcn(), 308);
}

#[test]
fn compaction_is_idempotent() {
    let raw = [
        0x11, 0x02, 0x20, 0x01, 0x0E, 0x11, 0x10, 0x10, 0x11, 0x03, 0x05, 0x01, 0x0D, 0x00,
    ];
    let mut once = parse_fragments(&raw, raw.len(), 0, 0, 47).unwrap();
    compact_compressed_fragments(&mut once, 16);
    let mut twice = once.clone();
    compact_compressed_fragments(&mut twice, 16);
    assert_eq!(once, twice);

    compact_fragment_list(&mut twice);
    let mut again = twice.clone();
    compact_fragment_list(&mut again);
    assert_eq!(twice, again);
}

#[test]
fn adjacent_plain_runs_merge() {
    // 8 clusters @64 then 8 clusters @72: physically contiguous
    let raw = [0x11, 0x08, 0x40, 0x11, 0x08, 0x08, 0x00];
    let mut fragments = parse_fragments(&raw, raw.len(), 0, 0, 15).unwrap();
    compact_fragment_list(&mut fragments);
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].cluster_count, 16);
    assert_eq!(fragments[0].lcn, 64);
    assert_eq!(to_bytes(&fragments).unwrap(), vec![0x11, 0x10, 0x40, 0x00]);
}

#[test]
fn save_rejects_a_short_buffer() {
    let raw = [0x21, 0x18, 0x34, 0x56, 0x00];
    let fragments = parse_fragments(&raw, raw.len(), 0, 0, 23).unwrap();
    let mut out = [0u8; 4];
    assert!(matches!(
        save(&mut out, 0, &fragments),
        Err(NtfsError::TruncatedRunList { .. })
    ));
}
