//! End-to-end scans of nested archives built on the fly.

#![cfg(feature = "builtin-formats")]

use byteorder::{LittleEndian, WriteBytesExt};
use carve_core::{
    FormatRegistry, Input, MemoryInput, NodeKind, NullListener, ResultNode, ScanState, ScannerConfig, Scheduler,
    StatsListener,
};
use flate2::write::DeflateEncoder;
use flate2::{Compression, GzBuilder};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

const PNG: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

fn png_image() -> Vec<u8> {
    let mut data = PNG.to_vec();
    for (kind, body) in [(b"IHDR", &[0u8; 13][..]), (b"IEND", &[][..])] {
        data.extend_from_slice(&(body.len() as u32).to_be_bytes());
        data.extend_from_slice(kind);
        data.extend_from_slice(body);
        data.extend_from_slice(&[0; 4]);
    }
    data
}

fn gzip(name: &str, content: &[u8]) -> Vec<u8> {
    let mut encoder = GzBuilder::new()
        .filename(name)
        .write(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

/// Minimal archive writer: local entries, central directory, end record
fn zip(entries: &[(&str, u16, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut directory = Vec::new();
    for &(name, method, content) in entries {
        let payload = if method == 8 {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(content).unwrap();
            encoder.finish().unwrap()
        } else {
            content.to_vec()
        };
        let offset = out.len() as u32;

        for (buf, central) in [(&mut out, false), (&mut directory, true)] {
            buf.write_u32::<LittleEndian>(if central { 0x0201_4B50 } else { 0x0403_4B50 })
                .unwrap();
            if central {
                buf.write_u16::<LittleEndian>(20).unwrap();
            }
            buf.write_u16::<LittleEndian>(20).unwrap();
            buf.write_u16::<LittleEndian>(0).unwrap();
            buf.write_u16::<LittleEndian>(method).unwrap();
            buf.write_u32::<LittleEndian>(0).unwrap();
            buf.write_u32::<LittleEndian>(0).unwrap();
            buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
            buf.write_u32::<LittleEndian>(content.len() as u32).unwrap();
            buf.write_u16::<LittleEndian>(name.len() as u16).unwrap();
            buf.write_u16::<LittleEndian>(0).unwrap();
            if central {
                buf.write_u16::<LittleEndian>(0).unwrap();
                buf.write_u16::<LittleEndian>(0).unwrap();
                buf.write_u16::<LittleEndian>(0).unwrap();
                buf.write_u32::<LittleEndian>(0).unwrap();
                buf.write_u32::<LittleEndian>(offset).unwrap();
            }
            buf.extend_from_slice(name.as_bytes());
        }
        out.extend_from_slice(&payload);
    }

    let directory_offset = out.len() as u32;
    out.extend_from_slice(&directory);
    out.write_u32::<LittleEndian>(0x0605_4B50).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(entries.len() as u16).unwrap();
    out.write_u16::<LittleEndian>(entries.len() as u16).unwrap();
    out.write_u32::<LittleEndian>(directory.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(directory_offset).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out
}

fn memory(name: &str, data: Vec<u8>) -> Arc<dyn Input> {
    Arc::new(MemoryInput::new(name, data))
}

fn find(root: &Arc<ResultNode>, name: &str) -> Arc<ResultNode> {
    let mut found = None;
    root.walk(&mut |node, _| {
        if found.is_none() && node.name() == name {
            found = Some(node.clone());
        }
    });
    found.unwrap_or_else(|| panic!("no node named '{}'", name))
}

fn scheduler(dir: &TempDir) -> Scheduler {
    Scheduler::new(FormatRegistry::builtin(), ScannerConfig::new().cache_dir(dir.path()))
}

#[test]
fn test_zip_of_gzip_of_png() {
    let dir = TempDir::new().unwrap();
    let inner = gzip("inner.png", &png_image());
    let archive = zip(&[
        ("nested.gz", 0, &inner),
        ("readme.txt", 8, b"plain text, compressed twice over and over and over"),
    ]);

    let mut scheduler = scheduler(&dir);
    let root = scheduler.queue_input(memory("outer.zip", archive));
    let mut listener = StatsListener::default();
    let stats = scheduler.run(&mut listener).unwrap();

    assert_eq!(scheduler.handle().state(), ScanState::Finished);
    // outer.zip, nested.gz, readme.txt, inner.png
    assert_eq!(stats.inputs_scanned, 4);
    assert_eq!(stats.formats_matched, 3);
    assert_eq!(stats.unrecognized, 1);
    assert_eq!(stats.derived_inputs, 3);
    assert_eq!(stats.failures, 0);
    assert_eq!(listener.results, 4);

    let png = find(&root, "png");
    assert_eq!(png.kind(), NodeKind::Format);
    assert_eq!(
        png.path(),
        vec!["outer.zip", "zip", "entry", "nested.gz", "gzip", "inner.png", "png"]
    );
    assert_eq!(png.children().len(), 2);

    let image = find(&root, "inner.png");
    assert_eq!(image.encoded_depth(), 2);
    assert_eq!(image.content().unwrap().size(), png_image().len() as u64);

    let text = find(&root, "readme.txt");
    assert!(text.children().is_empty());
    assert!(text.failure().is_none());
}

#[test]
fn test_corrupt_entry_does_not_stop_scan() {
    let dir = TempDir::new().unwrap();
    let good = gzip("good.txt", b"good");
    let mut bad = gzip("bad.txt", b"this member is corrupted after the header");
    // Fixed header plus "bad.txt\0", then a reserved deflate block type
    bad[18] = 0xFF;

    let mut scheduler = scheduler(&dir);
    let bad_root = scheduler.queue_input(memory("bad.gz", bad));
    let good_root = scheduler.queue_input(memory("good.gz", good));
    let stats = scheduler.run(&mut NullListener).unwrap();

    assert_eq!(stats.formats_matched, 2);
    // bad.txt and good.txt carry no known format
    assert_eq!(stats.unrecognized, 2);
    assert_eq!(stats.failures, 1);
    let bad_gzip = find(&bad_root, "gzip");
    let mut failed = false;
    bad_gzip.walk(&mut |node, _| failed |= node.failure().is_some());
    assert!(failed);

    let good_gzip = find(&good_root, "gzip");
    assert!(good_gzip.failure().is_none());
    assert_eq!(find(&good_root, "good.txt").content().unwrap().size(), 4);
}

#[test]
fn test_files_from_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("image.png");
    std::fs::write(&path, png_image()).unwrap();

    let scheduler = scheduler(&dir);
    let handle = scheduler.handle();
    let root = handle.queue_file(&path).unwrap();
    assert!(handle.queue_file(dir.path().join("missing.bin")).is_err());

    let stats = scheduler.spawn(NullListener).unwrap().join().unwrap().unwrap();
    assert_eq!(stats.formats_matched, 1);
    assert_eq!(root.name(), path.display().to_string());
    assert_eq!(root.children()[0].name(), "png");
    assert_eq!(handle.tree().len(), 4);
}

#[test]
fn test_disabled_format_is_not_probed() {
    let dir = TempDir::new().unwrap();
    let registry = FormatRegistry::builtin().retain_names(&["zip"]);
    let mut scheduler = Scheduler::new(registry, ScannerConfig::new().cache_dir(dir.path()));
    let root = scheduler.queue_input(memory("image.png", png_image()));
    let stats = scheduler.run(&mut NullListener).unwrap();

    assert_eq!(stats.unrecognized, 1);
    assert!(root.children().is_empty());
}
