//! End-to-end injection and ejection against synthetic app bundles.

mod common;

use binject::{EjectionError, Error, ErrorKind, MetadataStore, PatchError, Stage};
use common::{list_dir, zip_names, FailingSigner, Fixture, LIBSYSTEM};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const TWEAK_REF: &str = "@executable_path/Frameworks/Tweak.dylib";

#[test]
fn test_inject_single_dylib_into_clean_app() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    let tweak = fixture.dylib("Tweak.dylib");

    let log = injector.inject(&[tweak.clone()]).unwrap();

    let placed = fixture.root().join("Frameworks/Tweak.dylib");
    assert_eq!(fs::read(&placed).unwrap(), fs::read(&tweak).unwrap());
    assert_eq!(fixture.load_paths(), [LIBSYSTEM, TWEAK_REF]);
    assert_eq!(injector.list_injected_assets(), [placed.clone()]);
    assert_eq!(injector.metadata().provenance(&placed), Some(false));

    let backups = list_dir(&fixture.backups_dir());
    assert_eq!(backups.len(), 1);
    assert!(backups[0].starts_with("DemoPlugins_"));
    assert!(zip_names(&fixture.backups_dir().join(&backups[0])).is_empty());

    assert_eq!(injector.latest_log_path(), Some(log.clone()));
    assert!(fs::read_to_string(&log).unwrap().contains("Stage Done"));
    assert!(list_dir(&fixture.staging_dir()).is_empty());
    assert!(tweak.exists());
}

#[test]
fn test_zip_with_two_bundles_and_text_file() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    let original = fixture.executable_bytes();
    let archive = fixture.zip(
        "resources.zip",
        &[
            ("A.bundle/Info.plist", b"a"),
            ("B.bundle/icon.png", b"b"),
            ("notes.txt", b"ignored"),
        ],
    );

    injector.inject(&[archive.clone()]).unwrap();

    let root = fixture.root();
    assert!(root.join("A.bundle/Info.plist").exists());
    assert!(root.join("B.bundle/icon.png").exists());
    assert!(!root.join("notes.txt").exists());
    assert_eq!(
        injector.list_injected_assets(),
        [root.join("A.bundle"), root.join("B.bundle")]
    );
    let metadata = MetadataStore::open(root);
    assert_eq!(metadata.provenance(Path::new("A.bundle")), Some(true));
    assert_eq!(metadata.provenance(Path::new("B.bundle")), Some(true));

    // Bundles carry no load reference.
    assert_eq!(fixture.executable_bytes(), original);

    // A single zip input is backed up verbatim.
    let backups = list_dir(&fixture.backups_dir());
    assert_eq!(backups.len(), 1);
    assert_eq!(
        fs::read(fixture.backups_dir().join(&backups[0])).unwrap(),
        fs::read(&archive).unwrap()
    );
}

#[test]
fn test_deb_with_bundle_and_dylib() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    let package = fixture.deb(
        "tweak.deb",
        &[
            ("Library/Application Support/foo.bundle/Info.plist", b"foo"),
            ("Library/MobileSubstrate/DynamicLibraries/bar.dylib", b"bar"),
            ("Library/MobileSubstrate/DynamicLibraries/bar.plist", b"filter"),
        ],
    );

    injector.inject(&[package]).unwrap();

    let root = fixture.root();
    let metadata = injector.metadata();
    assert_eq!(metadata.injected().len(), 2);
    assert_eq!(metadata.provenance(&root.join("foo.bundle")), Some(true));
    assert_eq!(metadata.provenance(&root.join("Frameworks/bar.dylib")), Some(false));
    assert!(fixture
        .load_paths()
        .contains(&"@executable_path/Frameworks/bar.dylib".to_string()));
}

#[test]
fn test_eject_restores_executable() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    let original = fixture.executable_bytes();

    injector.inject(&[fixture.dylib("Tweak.dylib")]).unwrap();
    assert_ne!(fixture.executable_bytes(), original);

    let placed = fixture.root().join("Frameworks/Tweak.dylib");
    injector.eject(&[placed.clone()]).unwrap();

    assert_eq!(fixture.executable_bytes(), original);
    assert!(!placed.exists());
    assert!(injector.list_injected_assets().is_empty());

    injector.eject_all().unwrap();
}

#[test]
fn test_round_trip_keeps_larger_signature_reservation() {
    let fixture = Fixture::with_reserved_signature(0x2000);
    let injector = fixture.injector();
    let original = fixture.executable_bytes();

    injector.inject(&[fixture.dylib("Tweak.dylib")]).unwrap();
    assert_eq!(fixture.executable_bytes().len(), original.len());

    injector.eject_all().unwrap();
    let sizeofcmds = u32::from_le_bytes(original[20..24].try_into().unwrap()) as usize;
    let restored = fixture.executable_bytes();
    assert_eq!(&restored[32..32 + sizeofcmds], &original[32..32 + sizeofcmds]);
    assert_eq!(restored.len(), original.len());
}

#[test]
fn test_eject_accepts_bundle_relative_paths() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    injector
        .inject(&[fixture.framework("Foo.framework", "FooCore")])
        .unwrap();
    assert!(fixture
        .load_paths()
        .contains(&"@executable_path/Frameworks/Foo.framework/FooCore".to_string()));

    injector
        .eject(&[PathBuf::from("Frameworks/Foo.framework")])
        .unwrap();
    assert_eq!(fixture.load_paths(), [LIBSYSTEM]);
    assert!(!fixture.root().join("Frameworks/Foo.framework").exists());
}

#[test]
fn test_eject_refuses_host_files() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    injector.inject(&[fixture.dylib("Tweak.dylib")]).unwrap();
    let shipped = fixture.root().join("Frameworks/Shipped.framework");
    fs::create_dir_all(&shipped).unwrap();
    let executable = fixture.executable_bytes();

    for target in ["Frameworks", "Demo", "Frameworks/Shipped.framework", "Info.plist"] {
        let err = injector.eject(&[PathBuf::from(target)]).unwrap_err();
        match err {
            EjectionError::Aborted { source, .. } => {
                assert_eq!(source.kind(), ErrorKind::Validation, "{target}");
            }
            other => panic!("unexpected {other:?} for {target}"),
        }
    }

    assert!(shipped.exists());
    assert!(fixture.root().join("Frameworks/Tweak.dylib").exists());
    assert_eq!(fixture.executable_bytes(), executable);
    assert_eq!(fixture.load_paths(), [LIBSYSTEM, TWEAK_REF]);
}

#[test]
fn test_detached_flag_pins_app() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    assert!(!injector.is_detached());

    injector.set_detached(true).unwrap();
    assert!(injector.is_detached());
    assert!(!MetadataStore::open(fixture.root()).permits_replacement());

    injector.inject(&[fixture.dylib("Tweak.dylib")]).unwrap();
    injector.eject_all().unwrap();
    assert!(injector.is_detached());

    injector.set_detached(false).unwrap();
    assert!(MetadataStore::open(fixture.root()).permits_replacement());
}

#[test]
fn test_injecting_twice_is_idempotent() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    let tweak = fixture.dylib("Tweak.dylib");

    injector.inject(&[tweak.clone()]).unwrap();
    let after_first = fixture.executable_bytes();
    injector.inject(&[tweak]).unwrap();

    assert_eq!(fixture.executable_bytes(), after_first);
    let refs = fixture.load_paths();
    assert_eq!(refs.iter().filter(|r| *r == TWEAK_REF).count(), 1);
    assert_eq!(list_dir(&fixture.root().join("Frameworks")), ["Tweak.dylib"]);
    assert_eq!(injector.list_injected_assets().len(), 1);
}

#[test]
fn test_signing_failure_commits_no_markers() {
    let fixture = Fixture::new();
    let injector = binject::Injector::new(
        fixture.app.clone(),
        fixture.config().signer(Arc::new(FailingSigner)),
    );
    let original = fixture.executable_bytes();

    let err = injector.inject(&[fixture.dylib("Tweak.dylib")]).unwrap_err();

    assert_eq!(err.stage, Stage::PatchSign);
    assert_eq!(err.kind(), ErrorKind::Signing);
    assert!(err.log_path.is_some());
    assert_eq!(fixture.executable_bytes(), original);
    assert!(!fixture.root().join("Frameworks/Tweak.dylib").exists());
    assert!(injector.metadata().injected().is_empty());
    assert!(list_dir(&fixture.staging_dir()).is_empty());
}

#[test]
fn test_metadata_failure_reverts_binary_and_files() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    let original = fixture.executable_bytes();

    // A directory in place of the metadata document makes every write fail.
    fs::create_dir(injector.metadata().path()).unwrap();

    let err = injector.inject(&[fixture.dylib("Tweak.dylib")]).unwrap_err();

    assert_eq!(err.stage, Stage::MarkFinal);
    assert_eq!(err.kind(), ErrorKind::Metadata);
    assert_eq!(fixture.executable_bytes(), original);
    assert!(!fixture.root().join("Frameworks/Tweak.dylib").exists());
}

#[test]
fn test_existing_file_is_restored_on_failure() {
    let fixture = Fixture::new();
    let frameworks = fixture.root().join("Frameworks");
    fs::create_dir_all(&frameworks).unwrap();
    fs::write(frameworks.join("Tweak.dylib"), b"shipped with the app").unwrap();

    let injector = binject::Injector::new(
        fixture.app.clone(),
        fixture.config().signer(Arc::new(FailingSigner)),
    );
    injector.inject(&[fixture.dylib("Tweak.dylib")]).unwrap_err();

    assert_eq!(
        fs::read(frameworks.join("Tweak.dylib")).unwrap(),
        b"shipped with the app"
    );
    assert_eq!(list_dir(&frameworks), ["Tweak.dylib"]);
}

#[test]
fn test_insufficient_padding_aborts() {
    let fixture = Fixture::with_text_offset(336);
    let injector = fixture.injector();
    let original = fixture.executable_bytes();

    let err = injector.inject(&[fixture.dylib("Tweak.dylib")]).unwrap_err();

    assert_eq!(err.stage, Stage::PatchSign);
    assert_eq!(err.kind(), ErrorKind::BinaryPatch);
    assert!(matches!(
        err.source,
        Error::BinaryPatch {
            source: PatchError::InsufficientHeaderPadding { .. },
            ..
        }
    ));
    assert_eq!(fixture.executable_bytes(), original);
    assert!(injector.list_injected_assets().is_empty());
}

#[test]
fn test_nothing_injectable() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    let substrate = fixture.dylib("libsubstrate.dylib");
    let notes = fixture.inputs_dir().join("notes.txt");
    fs::write(&notes, b"hello").unwrap();

    let err = injector.inject(&[substrate, notes]).unwrap_err();

    assert_eq!(err.stage, Stage::Preprocess);
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(list_dir(&fixture.backups_dir()).is_empty());
}

#[test]
fn test_eject_all_with_one_missing_file() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    let inputs = ["a.dylib", "b.dylib", "c.dylib"].map(|name| fixture.dylib(name));
    injector.inject(&inputs).unwrap();

    let frameworks = fixture.root().join("Frameworks");
    fs::remove_file(frameworks.join("b.dylib")).unwrap();

    let err = injector.eject_all().unwrap_err();
    match &err {
        EjectionError::Partial { failures, total, .. } => {
            assert_eq!(*total, 3);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].asset, frameworks.join("b.dylib"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(err.log_path().is_some());

    assert!(list_dir(&frameworks).is_empty());
    assert!(injector.list_injected_assets().is_empty());
    assert_eq!(fixture.load_paths(), [LIBSYSTEM]);
}

#[test]
fn test_universal_binary_round_trip() {
    let fixture = Fixture::universal();
    let injector = fixture.injector();
    let original = fixture.executable_bytes();

    injector.inject(&[fixture.dylib("Tweak.dylib")]).unwrap();
    assert!(fixture.every_slice_loads(TWEAK_REF));

    injector.eject_all().unwrap();
    assert!(!fixture.every_slice_loads(TWEAK_REF));
    assert!(fixture.every_slice_loads(LIBSYSTEM));
    assert_eq!(fixture.executable_bytes(), original);
}

#[test]
fn test_backup_and_restore() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    injector
        .inject(&[
            fixture.dylib("a.dylib"),
            fixture.framework("Foo.framework", "Foo"),
        ])
        .unwrap();

    // The snapshot taken by this injection holds the two plug-ins above.
    injector.inject(&[fixture.dylib("b.dylib")]).unwrap();
    let backups = list_dir(&fixture.backups_dir());
    assert_eq!(backups.len(), 1);
    assert_eq!(
        zip_names(&fixture.backups_dir().join(&backups[0])),
        [
            "Foo.framework/",
            "Foo.framework/Foo",
            "Foo.framework/Info.plist",
            "a.dylib"
        ]
    );

    injector.eject_all().unwrap();
    injector.restore_last_configuration().unwrap();

    let frameworks = fixture.root().join("Frameworks");
    assert_eq!(list_dir(&frameworks), ["Foo.framework", "a.dylib"]);
    assert_eq!(fixture.load_paths().len(), 3);
}

#[test]
fn test_restore_without_backup() {
    let fixture = Fixture::new();
    let err = fixture
        .injector()
        .restore_last_configuration()
        .unwrap_err();
    assert!(matches!(err.source, Error::BackupNotFound { .. }));
}

#[test]
fn test_foreign_load_references() {
    let fixture = Fixture::with_dylibs(&[LIBSYSTEM, "@rpath/Other.framework/Other"]);
    let injector = fixture.injector();
    injector.inject(&[fixture.dylib("Tweak.dylib")]).unwrap();

    let foreign: Vec<String> = injector
        .foreign_load_references()
        .unwrap()
        .into_iter()
        .map(|r| r.path().to_string())
        .collect();
    assert_eq!(foreign, ["@rpath/Other.framework/Other"]);
}

#[test]
fn test_export_plugins() {
    let fixture = Fixture::new();
    let injector = fixture.injector();
    injector
        .inject(&[fixture.dylib("a.dylib"), fixture.dylib("b.dylib")])
        .unwrap();

    let dest = fixture.dir.path().join("export/plugins.zip");
    assert_eq!(injector.export_plugins(&dest).unwrap(), 2);
    assert_eq!(zip_names(&dest), ["a.dylib", "b.dylib"]);
}

#[test]
fn test_reload_hook_fires() {
    let fixture = Fixture::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let injector = fixture
        .injector()
        .on_reload(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    injector.inject(&[fixture.dylib("Tweak.dylib")]).unwrap();
    injector.eject_all().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
