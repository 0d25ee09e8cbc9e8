mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{counting_registry, ArchiveBuilder, Built, Method, CUSTOM_CODER, UNKNOWN_CODER};
use import7z::archive::Archive;
use import7z::folder::DecodeError;
use import7z::hook::PathHook;
use import7z::importer::{CodeKind, ImportOptions, Importer, LoadError, Lookup};

fn importer(built: &Built) -> Importer {
    Importer::new(Arc::new(built.archive()), "", ImportOptions::default())
}

fn package_archive() -> Built {
    ArchiveBuilder::new()
        .dir("pak")
        .folder(Method::Copy, &[
            ("module1.py", "imported = True\n"),
            ("pak/__init__.py", ""),
            ("pak/module2.py", "imported = True\r\nsecond = 2"),
        ])
        .build()
}

#[test]
fn test_plain_module_loads() {
    let imp = importer(&package_archive());

    let unit = imp.find("module1").unwrap().expect("module1 is stored");
    assert!(!unit.is_package);
    assert_eq!(unit.kind, CodeKind::Source);
    assert_eq!(unit.path, "module1.py");
    assert!(unit.search_root.is_none());

    let module = imp.load(&unit).unwrap();
    assert_eq!(module.source(), Some("imported = True\n"));
    assert!(module.origin.ends_with("module1.py"));
    assert!(module.search_path.is_empty());

    assert!(imp.find("missing").unwrap().is_none());
    assert!(matches!(imp.load_module("missing"), Err(LoadError::NotFound { .. })));
}

#[test]
fn test_package_then_submodule() {
    let imp = importer(&package_archive());

    let pak = imp.find("pak").unwrap().unwrap();
    assert!(pak.is_package);
    assert_eq!(pak.path, "pak/__init__.py");
    assert!(pak.search_root.as_deref().unwrap().ends_with("pak"));

    let loaded = imp.load(&pak).unwrap();
    assert!(loaded.is_package);
    assert_eq!(loaded.search_path.len(), 1);
    // Empty source still ends with a newline.
    assert_eq!(loaded.source(), Some("\n"));

    let sub = imp.for_package(&pak).unwrap();
    assert_eq!(sub.prefix(), "pak/");
    let module2 = sub.load_module("pak.module2").unwrap();
    assert!(!module2.is_package);
    assert_eq!(module2.source(), Some("imported = True\nsecond = 2\n"));
}

#[test]
fn test_package_wins_over_module() {
    let built = ArchiveBuilder::new()
        .folder(Method::Copy, &[("pak.py", "kind = 'module'"), ("pak/__init__.py", "kind = 'package'")])
        .build();
    let imp = importer(&built);
    let unit = imp.find("pak").unwrap().unwrap();
    assert!(unit.is_package);
    assert!(imp.is_package("pak").unwrap());
    assert_eq!(imp.load(&unit).unwrap().source(), Some("kind = 'package'\n"));
}

#[test]
fn test_bytecode_precedence_and_fallback() {
    let mut pyc = vec![0xAA, 0xBB, 0x0D, 0x0A];
    pyc.extend_from_slice(&[0; 12]);
    pyc.extend_from_slice(b"code object");
    let built = ArchiveBuilder::new()
        .folder_bytes(Method::Copy, vec![
            ("m.py".into(), b"source = 1".to_vec()),
            ("m.pyc".into(), pyc),
        ])
        .build();
    let archive = Arc::new(built.archive());

    let imp = Importer::new(Arc::clone(&archive), "", ImportOptions::default());
    let unit = imp.find("m").unwrap().unwrap();
    assert_eq!(unit.kind, CodeKind::Bytecode);
    let module = imp.load(&unit).unwrap();
    assert_eq!(module.bytecode_body(), Some(&b"code object"[..]));
    assert_eq!(imp.get_source("m").unwrap().as_deref(), Some("source = 1"));

    // A stale magic number makes the loader fall back to source.
    let strict = ImportOptions { bytecode_magic: Some([1, 2, 0x0D, 0x0A]), ..ImportOptions::default() };
    let imp = Importer::new(Arc::clone(&archive), "", strict);
    let unit = imp.find("m").unwrap().unwrap();
    let module = imp.load(&unit).unwrap();
    assert_eq!(module.kind, CodeKind::Source);
    assert_eq!(module.source(), Some("source = 1\n"));

    let source_only = ImportOptions { allow_bytecode: false, ..ImportOptions::default() };
    let imp = Importer::new(archive, "", source_only);
    assert_eq!(imp.find("m").unwrap().unwrap().kind, CodeKind::Source);
}

#[test]
fn test_only_stale_bytecode_is_bad_bytecode() {
    let built = ArchiveBuilder::new()
        .folder_bytes(Method::Copy, vec![("c.pyc".into(), vec![0; 20])])
        .build();
    let options = ImportOptions { bytecode_magic: Some(*b"MAGI"), ..ImportOptions::default() };
    let imp = Importer::new(Arc::new(built.archive()), "", options);
    assert!(matches!(imp.load_module("c"), Err(LoadError::BadBytecode { .. })));
    assert_eq!(imp.get_source("c").unwrap(), None);
}

#[test]
fn test_namespace_portion() {
    let built = ArchiveBuilder::new()
        .folder(Method::Copy, &[("ns/mod.py", "x = 1")])
        .build();
    let imp = importer(&built);
    assert!(imp.find("ns").unwrap().is_none());
    match imp.find_loader("ns").unwrap() {
        Lookup::Namespace(portion) => assert!(portion.ends_with("ns")),
        other => panic!("expected namespace portion, got {other:?}"),
    }
    assert_eq!(imp.find_loader("nothing").unwrap(), Lookup::NotFound);
}

#[test]
fn test_solid_folder_entries_match_declared_size_and_crc() {
    let files: Vec<(String, Vec<u8>)> = (0..20)
        .map(|i| (format!("pkg/m{i:02}.py"), format!("value = {i}\n").repeat(i + 1).into_bytes()))
        .collect();
    let built = ArchiveBuilder::new()
        .folder_bytes(Method::Lzma, files.clone())
        .build();
    let ar = built.archive();

    for info in ar.list() {
        let data = ar.read_entry(info.index).unwrap();
        assert_eq!(data.len() as u64, info.size);
        assert_eq!(Some(crc32fast::hash(&data)), info.crc);
    }
    for (name, content) in &files {
        assert_eq!(&ar.read_file(name).unwrap()[..], &content[..]);
    }
    // One decode served every entry.
    assert_eq!(ar.cache_stats().decodes, 1);
}

#[test]
fn test_concurrent_loads_decode_once() {
    let (registry, calls) = counting_registry(Duration::from_millis(100));
    let built = ArchiveBuilder::new()
        .folder(Method::Custom(CUSTOM_CODER), &[
            ("a.py", "name = 'a'"),
            ("b.py", "name = 'b'"),
            ("c.py", "name = 'c'"),
        ])
        .build();
    let imp = Importer::new(Arc::new(built.archive_with(registry)), "", ImportOptions::default());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let imp = imp.clone();
            thread::spawn(move || {
                let name = ["a", "b", "c"][i % 3];
                imp.load_module(name).unwrap().source().unwrap().to_owned()
            })
        })
        .collect();
    for (i, h) in handles.into_iter().enumerate() {
        let name = ["a", "b", "c"][i % 3];
        assert_eq!(h.join().unwrap(), format!("name = '{name}'\n"));
    }
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn test_corrupt_folder_fails_alone() {
    let built = ArchiveBuilder::new()
        .folder(Method::Copy, &[("good.py", "ok = True")])
        .folder(Method::Copy, &[("bad.py", "this text will be damaged"), ("bad2.py", "so will this")])
        .build()
        .corrupt_folder(1);
    let imp = importer(&built);

    // Lookup does not decode, so it still succeeds.
    let unit = imp.find("bad").unwrap().unwrap();
    match imp.load(&unit) {
        Err(LoadError::Unreadable { source: DecodeError::CrcMismatch { folder: 1, .. }, .. }) => {}
        other => panic!("expected CRC mismatch, got {other:?}"),
    }
    assert_eq!(imp.load_module("good").unwrap().source(), Some("ok = True\n"));

    // Failures are not cached: asking again decodes again.
    assert!(imp.load_module("bad2").is_err());
    assert_eq!(imp.archive().cache_stats().decodes, 3);
}

#[test]
fn test_substream_crc_catches_damage_without_folder_crc() {
    let built = ArchiveBuilder::new()
        .without_folder_crcs()
        .folder(Method::Copy, &[("first.py", "aaaaaaaa"), ("second.py", "bbbbbbbb")])
        .build()
        .corrupt_folder(0);
    let ar = built.archive();
    // The flipped byte sits at the start of the second file.
    assert!(ar.read_file("first.py").is_ok());
    assert!(matches!(
        ar.read_file("second.py"),
        Err(import7z::ReadError::Decode(DecodeError::SubstreamCrcMismatch { substream: 1, .. }))
    ));
}

#[test]
fn test_unknown_coder_is_scoped_to_its_folder() {
    let built = ArchiveBuilder::new()
        .folder(Method::Copy, &[("plain.py", "x = 1")])
        .folder(Method::Custom(UNKNOWN_CODER), &[("exotic.py", "y = 2")])
        .build();
    let imp = importer(&built);

    let unit = imp.find("exotic").unwrap().unwrap();
    match imp.load(&unit) {
        Err(LoadError::Unreadable { source: DecodeError::UnsupportedCoder { id, .. }, .. }) => {
            assert_eq!(id, UNKNOWN_CODER.0);
        }
        other => panic!("expected unsupported coder, got {other:?}"),
    }
    assert!(imp.load_module("plain").is_ok());
}

#[test]
fn test_overlong_coder_id_is_scoped_to_its_folder() {
    let built = ArchiveBuilder::new()
        .folder(Method::Copy, &[("plain.py", "x = 1")])
        .folder(Method::RawId(&[1, 2, 3, 4, 5, 6, 7, 8, 9]), &[("exotic.py", "y = 2")])
        .build();
    let ar = built.open().unwrap();
    assert!(!ar.info().folders[1].coders[0].supported);
    let imp = Importer::new(Arc::new(ar), "", ImportOptions::default());

    let unit = imp.find("exotic").unwrap().unwrap();
    assert!(matches!(
        imp.load(&unit),
        Err(LoadError::Unreadable { source: DecodeError::UnsupportedCoder { folder: 1, .. }, .. })
    ));
    assert!(imp.load_module("plain").is_ok());
}

#[test]
fn test_invalid_graph_reported_at_find() {
    let built = ArchiveBuilder::new()
        .folder(Method::Cyclic, &[("loop.py", "z = 3")])
        .folder(Method::Copy, &[("fine.py", "w = 4")])
        .build();
    let imp = importer(&built);
    assert!(matches!(
        imp.find("loop"),
        Err(LoadError::Unreadable { source: DecodeError::InvalidGraph { folder: 0, .. }, .. })
    ));
    assert!(imp.load_module("fine").is_ok());
    assert!(imp.archive().info().folders[0].graph_error.is_some());
}

#[test]
fn test_close_rejects_later_requests() {
    let built = package_archive();
    let imp = importer(&built);
    let unit = imp.find("module1").unwrap().unwrap();
    imp.load(&unit).unwrap();

    imp.archive().close();
    imp.archive().close();
    assert!(imp.archive().is_closed());
    assert!(matches!(imp.load(&unit), Err(LoadError::Closed { .. })));
    assert!(matches!(imp.find("module1"), Err(LoadError::Closed { .. })));
    assert_eq!(imp.archive().cache_stats().cached_folders, 0);
}

#[test]
fn test_supplementary_calls() {
    let imp = importer(&package_archive());
    assert!(imp.get_filename("module1").unwrap().ends_with("module1.py"));
    assert!(!imp.is_package("module1").unwrap());
    assert!(matches!(imp.is_package("nope"), Err(LoadError::NotFound { .. })));
    assert_eq!(imp.get_source("module1").unwrap().as_deref(), Some("imported = True\n"));

    assert_eq!(&imp.get_data("pak/module2.py").unwrap()[..], b"imported = True\r\nsecond = 2");
    let absolute = format!("{}/module1.py", imp.archive().path().display());
    assert_eq!(&imp.get_data(&absolute).unwrap()[..], b"imported = True\n");
    assert!(matches!(imp.get_data("pak"), Err(LoadError::NotFound { .. })));
}

#[test]
fn test_path_hook_with_prefix() {
    let built = package_archive();
    let file = built.write_temp();
    let hook = PathHook::default();

    let root = hook.importer_for(file.path()).unwrap();
    assert_eq!(root.prefix(), "");
    assert!(root.find("pak").unwrap().unwrap().is_package);

    let sub = hook.importer_for(file.path().join("pak")).unwrap();
    assert_eq!(sub.prefix(), "pak/");
    assert_eq!(sub.load_module("pak.module2").unwrap().source(), Some("imported = True\nsecond = 2\n"));

    // Both importers share one handle.
    assert!(Arc::ptr_eq(root.archive(), sub.archive()));
    assert_eq!(hook.open_archives().len(), 1);

    assert!(hook.close(file.path()));
    assert!(root.archive().is_closed());
    assert!(!hook.close(file.path()));

    // A fresh request reopens the archive.
    let again = hook.importer_for(file.path()).unwrap();
    assert!(!again.archive().is_closed());

    hook.close_all();
    assert!(again.archive().is_closed());
    assert!(hook.open_archives().is_empty());
}

#[test]
fn test_archive_opened_from_disk() {
    let built = package_archive();
    let file = built.write_temp();
    let ar = Archive::open(file.path()).unwrap();
    assert_eq!(ar.list().len(), 4);
    assert!(ar.list().iter().any(|f| f.name == "pak" && f.is_dir));
    // Directories are not readable entries.
    assert!(ar.stat("pak").is_none());
    assert!(ar.resolver().is_dir("pak"));
    assert_eq!(&ar.read_file("module1.py").unwrap()[..], b"imported = True\n");
    assert!(ar.verify().iter().all(|c| c.result.is_ok()));
}
