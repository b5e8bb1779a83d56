//! Stream codec properties: round-trip at chunk boundaries, tamper
//! detection, wrong-key rejection, and truncation.

use proptest::prelude::*;
use pxv_crypto::stream::{FRAME_HEADER_SIZE, HEADER_SIZE};
use pxv_crypto::{
    decrypt_stream, decrypt_to_vec, encrypt_stream, encrypt_to_vec, CipherError, FormatVersion,
    MediaKey, TAG_SIZE,
};

const VERSIONS: [FormatVersion; 2] = [FormatVersion::V1, FormatVersion::V2];

fn key() -> MediaKey {
    MediaKey::new("primary", [0x5a; 32])
}

fn data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8).collect()
}

/// (start, end) of every frame body in a sealed stream.
fn body_ranges(sealed: &[u8]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut at = HEADER_SIZE;
    while at < sealed.len() {
        let mut len = [0u8; 4];
        len.copy_from_slice(&sealed[at + 9..at + 13]);
        let body_len = u32::from_be_bytes(len) as usize;
        let start = at + FRAME_HEADER_SIZE;
        ranges.push((start, start + body_len));
        at = start + body_len;
    }
    ranges
}

#[test]
fn test_roundtrip_at_chunk_boundaries() {
    for version in VERSIONS {
        let cs = version.chunk_size();
        for len in [0, 1, cs - 1, cs, cs + 1, 3 * cs + 7] {
            let plain = data(len);
            let sealed = encrypt_to_vec(&plain, &key(), version).unwrap();
            let opened = decrypt_to_vec(&sealed, &key()).unwrap();
            assert_eq!(opened, plain, "version {version:?}, length {len}");
        }
    }
}

#[test]
fn test_streaming_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let plain_path = dir.path().join("clip.mov");
    let sealed_path = dir.path().join("clip.pxv");
    let opened_path = dir.path().join("clip.out");
    let plain = data(200_000);
    std::fs::write(&plain_path, &plain).unwrap();

    let stats = encrypt_stream(
        std::fs::File::open(&plain_path).unwrap(),
        std::fs::File::create(&sealed_path).unwrap(),
        &key(),
        FormatVersion::V2,
        None,
    )
    .unwrap();
    assert_eq!(stats.chunks, 4);
    assert_eq!(stats.plaintext_bytes, 200_000);

    decrypt_stream(
        std::fs::File::open(&sealed_path).unwrap(),
        std::fs::File::create(&opened_path).unwrap(),
        &key(),
        None,
    )
    .unwrap();
    assert_eq!(std::fs::read(&opened_path).unwrap(), plain);
}

#[test]
fn test_every_body_bit_flip_is_corrupt() {
    let version = FormatVersion::V1;
    let sealed = encrypt_to_vec(&data(2 * version.chunk_size() + 100), &key(), version).unwrap();
    let ranges = body_ranges(&sealed);
    assert_eq!(ranges.len(), 3);

    for (start, end) in ranges {
        assert!(end - start >= TAG_SIZE);
        for byte in start..end {
            let bit = (byte % 8) as u8;
            let mut tampered = sealed.clone();
            tampered[byte] ^= 1 << bit;
            match decrypt_to_vec(&tampered, &key()) {
                Err(CipherError::CorruptStream(_)) => {}
                other => panic!("flip at byte {byte} bit {bit} gave {other:?}"),
            }
        }
    }
}

#[test]
fn test_wrong_key_never_returns_cleartext() {
    for version in VERSIONS {
        let sealed = encrypt_to_vec(&data(5000), &key(), version).unwrap();
        let wrong = MediaKey::new("other", [0xa5; 32]);
        let mut out = Vec::new();
        let result = decrypt_stream(&sealed[..], &mut out, &wrong, None);
        assert!(matches!(result, Err(CipherError::KeyMismatch)));
        assert!(out.is_empty());
    }
}

#[test]
fn test_truncation_at_every_frame_boundary() {
    let version = FormatVersion::V1;
    let sealed = encrypt_to_vec(&data(4 * version.chunk_size() + 10), &key(), version).unwrap();
    let ranges = body_ranges(&sealed);

    // Cutting after any frame but the last leaves a stream without its final marker.
    for &(_, end) in &ranges[..ranges.len() - 1] {
        assert!(matches!(
            decrypt_to_vec(&sealed[..end], &key()),
            Err(CipherError::TruncatedStream)
        ));
    }
    // Header alone.
    assert!(matches!(
        decrypt_to_vec(&sealed[..HEADER_SIZE], &key()),
        Err(CipherError::TruncatedStream)
    ));
}

proptest! {
    #[test]
    fn prop_roundtrip(
        plain in proptest::collection::vec(any::<u8>(), 0..=8192),
        v2 in any::<bool>(),
    ) {
        let version = if v2 { FormatVersion::V2 } else { FormatVersion::V1 };
        let sealed = encrypt_to_vec(&plain, &key(), version).unwrap();
        let opened = decrypt_to_vec(&sealed, &key()).unwrap();
        prop_assert_eq!(opened, plain, "round-trip must be identical");
    }

    #[test]
    fn prop_tamper_never_yields_altered_cleartext(
        plain in proptest::collection::vec(any::<u8>(), 1..=4096),
        pick in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let sealed = encrypt_to_vec(&plain, &key(), FormatVersion::V1).unwrap();
        let ranges = body_ranges(&sealed);
        let (start, end) = ranges[pick.index(ranges.len())];
        let mut tampered = sealed.clone();
        let at = start + pick.index(end - start);
        tampered[at] ^= 1 << bit;
        prop_assert!(matches!(
            decrypt_to_vec(&tampered, &key()),
            Err(CipherError::CorruptStream(_))
        ));
    }
}
