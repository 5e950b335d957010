use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use exhume_ntfs_runs::fragment::to_bytes;
use exhume_ntfs_runs::lznt1::{self, Decompressor, Lznt1};
use exhume_ntfs_runs::{
    DiskReader, Fragment, LogicalStream, NtfsError, Result, SeekDisk, StreamGeometry,
    compact_compressed_fragments, parse_fragments,
};

const CLUSTER: usize = 1024;
const UNIT: u64 = 16;
const UNIT_BYTES: usize = CLUSTER * UNIT as usize;

/// A volume image plus the logical content its fragments describe.
struct Scenario {
    image: Vec<u8>,
    fragments: Vec<Fragment>,
    reference: Vec<u8>,
}

impl Scenario {
    fn new() -> Self {
        Self {
            image: vec![0u8; 8 * CLUSTER], // LCN 0 is never data
            fragments: Vec::new(),
            reference: Vec::new(),
        }
    }

    fn next_vcn(&self) -> u64 {
        self.fragments.last().map_or(0, |f| f.next_vcn())
    }

    fn next_lcn(&self) -> u64 {
        (self.image.len() / CLUSTER) as u64
    }

    fn push_clusters(&mut self, data: &[u8]) -> u64 {
        let lcn = self.next_lcn();
        let padded = data.len().next_multiple_of(CLUSTER);
        self.image.extend_from_slice(data);
        self.image.resize(self.image.len() + padded - data.len(), 0);
        lcn
    }

    fn sparse(mut self, clusters: u64) -> Self {
        self.fragments.push(Fragment {
            starting_vcn: self.next_vcn(),
            cluster_count: clusters,
            lcn: 0,
            compressed_filler_clusters: 0,
        });
        self.reference.resize(self.reference.len() + clusters as usize * CLUSTER, 0);
        self
    }

    fn plain(mut self, data: &[u8]) -> Self {
        assert_eq!(data.len() % CLUSTER, 0);
        let starting_vcn = self.next_vcn();
        let lcn = self.push_clusters(data);
        self.fragments.push(Fragment {
            starting_vcn,
            cluster_count: (data.len() / CLUSTER) as u64,
            lcn,
            compressed_filler_clusters: 0,
        });
        self.reference.extend_from_slice(data);
        self
    }

    /// `stored` full units kept as is, followed by `tail` compressed into
    /// the last unit of the same fragment.
    fn compressed(mut self, stored: &[u8], tail: &[u8]) -> Self {
        assert_eq!(stored.len() % UNIT_BYTES, 0);
        assert!(tail.len() <= UNIT_BYTES);
        let packed = lznt1::compress(tail);
        let packed_clusters = packed.len().div_ceil(CLUSTER) as u64;
        assert!(packed_clusters < UNIT, "test data does not compress");

        let starting_vcn = self.next_vcn();
        let lcn = self.push_clusters(stored);
        let packed_lcn = self.push_clusters(&packed);
        if !stored.is_empty() {
            assert_eq!(packed_lcn, lcn + (stored.len() / CLUSTER) as u64);
        }
        self.fragments.push(Fragment {
            starting_vcn,
            cluster_count: (stored.len() / CLUSTER) as u64 + packed_clusters,
            lcn: if stored.is_empty() { packed_lcn } else { lcn },
            compressed_filler_clusters: (UNIT - packed_clusters) as u8,
        });
        self.reference.extend_from_slice(stored);
        self.reference.extend_from_slice(tail);
        self.reference.resize(self.reference.len() + UNIT_BYTES - tail.len(), 0);
        self
    }

    fn truncate(mut self, length: usize) -> Self {
        self.reference.truncate(length);
        self
    }

    fn disk(&self) -> SeekDisk<Cursor<Vec<u8>>> {
        SeekDisk::new(Cursor::new(self.image.clone())).unwrap()
    }

    fn geometry(&self) -> StreamGeometry {
        StreamGeometry::new(CLUSTER as u64, UNIT, self.reference.len() as u64)
    }

    fn open(&self) -> LogicalStream<'static, SeekDisk<Cursor<Vec<u8>>>> {
        LogicalStream::owned(self.disk(), self.fragments.clone(), self.geometry()).unwrap()
    }
}

fn text(len: usize, seed: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut i = seed;
    while out.len() < len {
        out.extend_from_slice(format!("record {:05}: status=ok, value={}\n", i, i % 7).as_bytes());
        i += 1;
    }
    out.truncate(len);
    out
}

fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        })
        .collect()
}

/// 96 sparse clusters, two compressed units, then a partial last unit.
fn sparse_then_compressed() -> Scenario {
    Scenario::new()
        .sparse(96)
        .compressed(&[], &b"abcdefgh".repeat(UNIT_BYTES / 8))
        .compressed(&[], &text(UNIT_BYTES, 0))
        .compressed(&[], &text(10_000, 900))
        .truncate(96 * CLUSTER + 2 * UNIT_BYTES + 10_000)
}

#[test]
fn wire_form_compacts_to_the_scenario_fragments() {
    let scenario = sparse_then_compressed();
    let raw = to_bytes(&scenario.fragments).unwrap();
    let last = scenario.fragments.last().unwrap().next_vcn() - 1;
    let mut parsed = parse_fragments(&raw, raw.len(), 0, 0, last).unwrap();
    compact_compressed_fragments(&mut parsed, UNIT);
    assert_eq!(parsed, scenario.fragments);
}

#[test]
fn whole_stream_matches_reference() {
    let scenario = sparse_then_compressed();
    let mut stream = scenario.open();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    assert_eq!(out.len(), scenario.reference.len());
    assert!(out == scenario.reference);
}

#[test]
fn reads_at_odd_offsets_match_reference() {
    let scenario = sparse_then_compressed();
    let len = scenario.reference.len();
    let mut stream = scenario.open();

    let offsets = [
        0,
        1,
        CLUSTER - 1,
        96 * CLUSTER - 5,
        96 * CLUSTER + 7,
        96 * CLUSTER + UNIT_BYTES - 3,
        96 * CLUSTER + 2 * UNIT_BYTES + 4_321,
        len - 1,
    ];
    for offset in offsets {
        for want in [1usize, 17, 5_000, 40_000] {
            let mut buf = vec![0xEEu8; want];
            stream.seek(SeekFrom::Start(offset as u64)).unwrap();
            let got = stream.read(&mut buf).unwrap();
            let expected = want.min(len - offset);
            assert_eq!(got, expected, "offset {offset}, want {want}");
            assert!(
                buf[..got] == scenario.reference[offset..offset + got],
                "offset {offset}, want {want}"
            );
            assert_eq!(stream.position(), (offset + got) as u64);
        }
    }
}

#[test]
fn small_buffered_reads_cross_every_boundary() {
    let scenario = sparse_then_compressed();
    let mut stream = scenario.open();
    let mut out = Vec::new();
    let mut buf = [0u8; 777];
    loop {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert!(out == scenario.reference);
}

#[test]
fn stored_units_precede_the_compressed_one() {
    let stored = noise(2 * UNIT_BYTES, 7);
    let scenario = Scenario::new()
        .plain(&noise(3 * CLUSTER, 1))
        .compressed(&stored, &text(UNIT_BYTES, 42))
        .sparse(16);
    assert!(scenario.fragments[1].cluster_count > 32);
    assert_eq!(scenario.fragments[1].virtual_cluster_count(), 48);

    let mut stream = scenario.open();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    assert!(out == scenario.reference);
}

#[test]
fn seek_is_bounded_by_the_stream() {
    let scenario = sparse_then_compressed();
    let len = scenario.reference.len() as u64;
    let mut stream = scenario.open();

    assert_eq!(stream.seek(SeekFrom::End(0)).unwrap(), len);
    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);

    assert!(matches!(
        stream.seek(SeekFrom::End(1)),
        Err(NtfsError::OutOfRange { .. })
    ));
    assert_eq!(stream.position(), len);

    stream.seek(SeekFrom::Start(10)).unwrap();
    assert!(stream.seek(SeekFrom::Current(-11)).is_err());
    assert_eq!(stream.seek(SeekFrom::Current(-10)).unwrap(), 0);

    let err = Seek::seek(&mut stream, SeekFrom::Start(len + 1)).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
}

#[test]
fn streams_are_read_only() {
    let mut stream = sparse_then_compressed().open();
    assert!(matches!(
        stream.write(b"data"),
        Err(NtfsError::Unsupported(_))
    ));
    let err = Write::write(&mut stream, b"data").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::Unsupported);
}

#[test]
fn borrowed_disk_outlives_the_stream() {
    let scenario = sparse_then_compressed();
    let mut disk = scenario.disk();
    {
        let mut stream =
            LogicalStream::borrowed(&mut disk, scenario.fragments.clone(), scenario.geometry())
                .unwrap();
        let mut buf = [0u8; 16];
        stream.read(&mut buf).unwrap();
        stream.close();
        assert!(stream.is_closed());
        assert!(matches!(stream.read(&mut buf), Err(NtfsError::StreamClosed)));
    }
    // the owner can keep using it
    assert_eq!(disk.size(), scenario.image.len() as u64);
    let mut again =
        LogicalStream::borrowed(&mut disk, scenario.fragments.clone(), scenario.geometry())
            .unwrap();
    let mut out = Vec::new();
    again.read_to_end(&mut out).unwrap();
    assert!(out == scenario.reference);
}

#[test]
fn owned_stream_reports_closed_after_close() {
    let mut stream = sparse_then_compressed().open();
    stream.close();
    let err = Read::read(&mut stream, &mut [0u8; 4]).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotConnected);
}

/// Counts how many units get decompressed.
struct Counting {
    inner: Lznt1,
    calls: Arc<AtomicUsize>,
}

impl Decompressor for Counting {
    fn set_block_size(&mut self, block_size: usize) {
        self.inner.set_block_size(block_size);
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.decompress(input, output)
    }
}

#[test]
fn a_unit_is_decompressed_once_for_many_small_reads() {
    let scenario = Scenario::new().compressed(&[], &text(UNIT_BYTES, 3));
    let calls = Arc::new(AtomicUsize::new(0));
    let mut stream = scenario.open().with_decompressor(Box::new(Counting {
        inner: Lznt1::default(),
        calls: calls.clone(),
    }));

    let mut out = Vec::new();
    let mut buf = [0u8; 100];
    loop {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert!(out == scenario.reference);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn whole_unit_reads_skip_the_cache() {
    let scenario = Scenario::new()
        .compressed(&[], &text(UNIT_BYTES, 5))
        .compressed(&[], &text(UNIT_BYTES, 500));
    let calls = Arc::new(AtomicUsize::new(0));
    let mut stream = scenario.open().with_decompressor(Box::new(Counting {
        inner: Lznt1::default(),
        calls: calls.clone(),
    }));

    let mut unit = vec![0u8; UNIT_BYTES];
    stream.read_exact_at(UNIT_BYTES as u64, &mut unit).unwrap();
    assert!(unit[..] == scenario.reference[UNIT_BYTES..]);
    stream.read_exact_at(UNIT_BYTES as u64, &mut unit).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
