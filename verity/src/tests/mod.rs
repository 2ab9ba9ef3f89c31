//! Tests going from learned or generated digests to verified reads.
use std::{fs, sync::Arc};

use tempfile::TempDir;

use crate::{
    config::VerityConfig,
    digests::DigestAlgorithm,
    fixtures::BLOB_4097,
    learning::{read_log, DigestLog, WriterLog},
    manifest::{self, ManifestBuilder},
    Mode, ReadError, Verity,
};

/// Digests learned while reading, assembled into a manifest, verify the same
/// contents and reject anything else.
#[test]
fn learn_assemble_verify() {
    let tmpdir = TempDir::new().unwrap();
    let learned = tmpdir.path().join("learned");

    let log: Arc<dyn DigestLog> = Arc::new(WriterLog::create(&learned).unwrap());
    let learning = Verity::new(DigestAlgorithm::Sha1.digester(), Mode::Learn(log));

    let mut buf = vec![0u8; 8192];
    assert_eq!(
        4097,
        learning
            .read(b"/blob", &BLOB_4097[..], &mut buf, 0)
            .expect("must succeed")
    );

    let mut builder = ManifestBuilder::new();
    let records = read_log(
        std::io::BufReader::new(fs::File::open(&learned).unwrap()),
        &mut builder,
    )
    .expect("must read");
    assert_eq!(2, records);

    let assembled = builder.build(DigestAlgorithm::Sha1.hex_len());
    assert!(assembled.skipped.is_empty());

    let manifest_path = tmpdir.path().join("manifest");
    fs::write(&manifest_path, &assembled.manifest).unwrap();

    let config = VerityConfig {
        manifest_path,
        manifest_digest: DigestAlgorithm::Sha1.digester().compute(&assembled.manifest),
        ..Default::default()
    };
    let verity = Verity::initialize(&config).expect("must initialize");

    let mut buf = vec![0u8; 4097];
    assert_eq!(
        4097,
        verity
            .read(b"/blob", &BLOB_4097[..], &mut buf, 0)
            .expect("must succeed")
    );
    assert_eq!(&BLOB_4097[..], &buf[..]);

    let mut tampered = BLOB_4097.to_vec();
    tampered[10] ^= 0x01;
    assert!(matches!(
        verity.read(b"/blob", &tampered[..], &mut buf, 4000),
        Err(ReadError::Tampered { block: 0, .. })
    ));
}

/// A manifest generated from a tree verifies that tree, with any algorithm.
#[test]
fn generate_verify() {
    for algorithm in [
        DigestAlgorithm::Sha1,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha512,
        DigestAlgorithm::Md5,
        DigestAlgorithm::Blake3,
    ] {
        let tmpdir = TempDir::new().unwrap();
        let root = tmpdir.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/blob"), &BLOB_4097[..]).unwrap();

        let digester = algorithm.digester();
        let assembled = manifest::generate(&root, digester.as_ref())
            .expect("must generate")
            .build(algorithm.hex_len());
        assert_eq!(1, assembled.entries);

        let manifest_path = tmpdir.path().join("manifest");
        fs::write(&manifest_path, &assembled.manifest).unwrap();

        let config = VerityConfig {
            manifest_path,
            manifest_digest: digester.compute(&assembled.manifest),
            algorithm,
            ..Default::default()
        };
        let verity = Verity::initialize(&config).expect("must initialize");

        let f = fs::File::open(root.join("sub/blob")).unwrap();
        let mut buf = vec![0u8; 10];
        assert_eq!(
            2,
            verity
                .read(b"/sub/blob", &f, &mut buf, 4095)
                .expect("must succeed")
        );
        assert_eq!(&BLOB_4097[4095..], &buf[..2]);
    }
}
