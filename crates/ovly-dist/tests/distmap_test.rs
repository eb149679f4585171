//! Integration tests for the DistMap and the Distroot
//!
//! These tests exercise persistence and integrity checking against a real
//! file system.

use std::collections::BTreeSet;
use std::fs;

use ovly_config::testing::TestEnvironment;
use ovly_dist::{
    Compression, DistMap, DistMapEntry, DistfileInfo, Distroot, DistrootLayout, Strategy,
};

type Tuple = (String, Option<String>, String, String);

fn persistent_tuples(map: &DistMap) -> BTreeSet<Tuple> {
    map.iter()
        .filter_map(|(distfile, entry)| {
            entry.digest().map(|d| {
                (
                    distfile.to_string(),
                    entry.repo_name.clone(),
                    entry.repo_file.clone(),
                    d.to_string(),
                )
            })
        })
        .collect()
}

fn sample_map() -> DistMap {
    let mut map = DistMap::new(true);
    // repo_file equal to the distfile (written as the sentinel)
    map.add_entry(
        "seewave_2.0.tar.gz",
        DistMapEntry::persistent(Some("CRAN".into()), "seewave_2.0.tar.gz".into(), "aa11".into()),
    );
    // repo_file differing from the distfile
    map.add_entry(
        "bioc/affy_1.2.tar.gz",
        DistMapEntry::persistent(
            Some("BIOC".into()),
            "src/contrib/affy_1.2.tar.gz".into(),
            "bb22".into(),
        ),
    );
    // no repository
    map.add_dummy_entry("orphan.tgz", "cc33".into());
    map
}

/// Writing and reloading reproduces every persistent tuple, for every codec
#[test]
fn test_distmap_roundtrip_all_compressions() {
    let env = TestEnvironment::new().unwrap();

    for (name, compression) in [
        ("plain", Compression::None),
        ("bz2", Compression::Bzip2),
        ("gz", Compression::Gzip),
    ] {
        let path = env.root().join(format!("distmap.{}", name));
        let mut map = sample_map();
        assert_eq!(map.write_file(&path, compression).unwrap(), 3);
        assert!(!map.is_dirty());

        let reloaded = DistMap::read_file(&path, false, true).unwrap();
        assert_eq!(persistent_tuples(&reloaded), persistent_tuples(&map), "{}", name);
        assert!(!reloaded.is_dirty());

        let raw = fs::read(&path).unwrap();
        match compression {
            Compression::None => assert!(raw.starts_with(b"<|<1\n")),
            Compression::Bzip2 => assert!(raw.starts_with(b"BZh")),
            Compression::Gzip => assert!(raw.starts_with(&[0x1f, 0x8b])),
        }
    }
}

/// The sentinel and the empty repo_name field are what land on disk
#[test]
fn test_distmap_text_format() {
    let env = TestEnvironment::new().unwrap();
    let path = env.root().join("distmap.txt");
    sample_map().write_file(&path, Compression::None).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        vec![
            "<|<1",
            "bioc/affy_1.2.tar.gz|BIOC|src/contrib/affy_1.2.tar.gz|bb22",
            "orphan.tgz||_|cc33",
            "seewave_2.0.tar.gz|CRAN|_|aa11",
        ]
    );
}

/// A distroot reopened after finalize sees what the previous run registered
#[test]
fn test_distroot_survives_reopen() {
    let env = TestEnvironment::new().unwrap();
    let src = env.source_file("seewave_2.0.tar.gz", b"seewave sources").unwrap();
    let config = env.config();

    {
        let distroot = Distroot::from_config(&config.distfiles, &config.distmap).unwrap();
        let owner = distroot.owners().register("sci-R/seewave");
        let info = DistfileInfo::new("seewave_2.0.tar.gz", &src, Some("CRAN"), "seewave_2.0.tar.gz");
        distroot.distmap_register(owner, &info).unwrap();
        distroot.finalize().unwrap();
    }
    assert!(env.distmap_path().exists());

    let distroot = Distroot::open_persistent(
        &env.distroot,
        DistrootLayout::Flat,
        Strategy::default(),
        &env.distmap_path(),
        Compression::Bzip2,
        true,
    )
    .unwrap();
    let report = distroot.check_integrity().unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.added + report.mismatched + report.missing, 0);

    let distmap = distroot.distmap();
    let (distfile, entry) = distmap.lookup(Some("CRAN"), "seewave_2.0.tar.gz").unwrap();
    assert_eq!(distfile, "seewave_2.0.tar.gz");
    assert!(entry.is_persistent());
}

/// Tampered files lose their entry on the next integrity check
#[test]
fn test_integrity_drops_tampered_file() {
    let env = TestEnvironment::new().unwrap();
    let src = env.source_file("a_1.0.tar.gz", b"original").unwrap();
    let config = env.config();

    let distroot = Distroot::from_config(&config.distfiles, &config.distmap).unwrap();
    let owner = distroot.owners().register("dev-R/a");
    let dest = distroot
        .distmap_register(owner, &DistfileInfo::new("a_1.0.tar.gz", &src, None, "a_1.0.tar.gz"))
        .unwrap();

    // Break the link and rewrite the content in place
    fs::remove_file(&dest).unwrap();
    fs::write(&dest, b"tampered").unwrap();

    let report = distroot.check_integrity().unwrap();
    assert_eq!(report.mismatched, 1);
    assert!(!distroot.distmap().contains("a_1.0.tar.gz"));
}
