//! End-to-end builds against fixture raw files
//!
//! Knowledge bases are built offline into SQLite, then a corpus is aligned
//! against them through the same data directory the CLI uses.

use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use belb::corpora::build::{read_split, QAQC_FILE};
use belb::schema::Table;
use belb::store::manifest::read_export;
use belb::{
    BelbConfig, BelbError, CorpusBuildOptions, CorpusBuilder, KbBuildOptions, KbBuilder, KbReader,
    Manifest, Resolution, Split, StatusMarker, StoreError,
};

const CTD_DISEASES: &str = "\
# CTD diseases vocabulary
# DiseaseName\tDiseaseID\tAltDiseaseIDs\tDefinition\tParentIDs\tTreeNumbers\tParentTreeNumbers\tSynonyms\tSlimMappings
Asthma\tMESH:D001249\t\t\t\tC08.127\t\tAsthmas\t
Gout\tMESH:D006073\tMESH:D000001\t\t\t\t\tGouts|Podagra\t
Breast Neoplasms\tMESH:D001943\tOMIM:114480\t\t\t\t\tBreast Cancer|Breast Tumors\t
";

const NCBI_TRAIN: &str = "\
10021369|t|Asthma and gout.
10021369|a|Breast cancer is frequent. Podagra is painful.
10021369\t0\t6\tAsthma\tSpecificDisease\tD001249
10021369\t11\t15\tgout\tSpecificDisease\tD000001
10021369\t17\t30\tBreast cancer\tDiseaseClass\tOMIM:114480
10021369\t44\t51\tPodagra\tSpecificDisease\tD999999

";

const NCBI_DEV: &str = "\
20000001|t|Asthma.
20000001|a|
20000001\t0\t6\tAsthma\tSpecificDisease\tD001249

";

fn gzip(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut encoder = GzEncoder::new(std::fs::File::create(path).unwrap(), Compression::default());
    encoder.write_all(content.as_bytes()).unwrap();
    encoder.finish().unwrap();
}

fn write_kb_raw(root: &Path) {
    gzip(&root.join("raw/kbs/ctd_diseases/CTD_diseases.tsv.gz"), CTD_DISEASES);
}

fn write_corpus_raw(root: &Path) {
    let dir = root.join("raw/corpora/ncbi_disease");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("NCBItrainset_corpus.txt"), NCBI_TRAIN).unwrap();
    std::fs::write(dir.join("NCBIdevelopset_corpus.txt"), NCBI_DEV).unwrap();
    std::fs::write(dir.join("NCBItestset_corpus.txt"), "").unwrap();
}

fn kb_builder(root: &Path) -> KbBuilder {
    KbBuilder::new(
        root,
        BelbConfig::default(),
        KbBuildOptions {
            offline: true,
            ..KbBuildOptions::default()
        },
    )
}

#[tokio::test]
async fn test_kb_build_is_deterministic() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    write_kb_raw(first.path());
    write_kb_raw(second.path());

    let a = kb_builder(first.path()).build("ctd_diseases").await.unwrap();
    let b = kb_builder(second.path()).build("ctd_diseases").await.unwrap();
    assert_eq!(a.checksum, b.checksum);
    assert_eq!(a.counts, b.counts);

    for table in Table::ALL {
        assert_eq!(read_export(&a.dir, table).unwrap(), read_export(&b.dir, table).unwrap());
    }

    let manifest = Manifest::read(&a.dir).unwrap();
    assert_eq!(manifest.resource, "ctd_diseases");
    assert_eq!(manifest.backend, "sqlite");
    assert_eq!(manifest.counts["entities"], 3);
    assert!(StatusMarker::is_up(&a.dir));
    assert!(a.dir.join("kb.db").exists());
}

#[tokio::test]
async fn test_rebuild_keeps_checksum() {
    let root = tempfile::tempdir().unwrap();
    write_kb_raw(root.path());

    let builder = kb_builder(root.path());
    let first = builder.build("ctd_diseases").await.unwrap();
    let second = builder.build("ctd_diseases").await.unwrap();
    assert_eq!(first.checksum, second.checksum);

    let reader = KbReader::open(root.path(), "ctd_diseases", &BelbConfig::default())
        .await
        .unwrap();
    assert_eq!(reader.count().await.unwrap(), 3);
    assert_eq!(
        reader.resolve("MESH:D000001").await.unwrap(),
        Resolution::Current("MESH:D006073".into())
    );
}

#[tokio::test]
async fn test_reader_refuses_unbuilt_kb() {
    let root = tempfile::tempdir().unwrap();
    let err = KbReader::open(root.path(), "ctd_diseases", &BelbConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BelbError::Store(StoreError::NotBuilt(_))));

    let err = KbReader::open(root.path(), "not_a_kb", &BelbConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BelbError::UnknownResource { .. }));
}

#[tokio::test]
async fn test_build_all_reports_each_resource() {
    let root = tempfile::tempdir().unwrap();
    write_kb_raw(root.path());

    let names = vec!["ctd_diseases".to_string(), "ctd_chemicals".to_string()];
    let results = kb_builder(root.path()).build_all(&names, 2).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "ctd_diseases");
    assert!(results[0].1.is_ok());
    // no raw chemicals file
    assert!(results[1].1.is_err());
    assert!(StatusMarker::is_up(&root.path().join("processed/kbs/ctd_diseases")));
    assert!(!StatusMarker::is_up(&root.path().join("processed/kbs/ctd_chemicals")));
}

#[tokio::test]
async fn test_corpus_aligned_against_built_kb() {
    let root = tempfile::tempdir().unwrap();
    write_kb_raw(root.path());
    write_corpus_raw(root.path());
    kb_builder(root.path()).build("ctd_diseases").await.unwrap();

    let builder = CorpusBuilder::new(
        root.path(),
        BelbConfig::default(),
        CorpusBuildOptions {
            sentences: true,
            offline: true,
            overwrite: false,
        },
    );
    let summaries = builder.build("ncbi_disease").await.unwrap();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert!(StatusMarker::is_up(&summary.dir));
    assert!(summary.dir.join(QAQC_FILE).exists());

    let train = &summary.stats["train"];
    assert_eq!(train.annotations_in, 4);
    // D000001 and OMIM:114480 are secondary identifiers
    assert_eq!(train.ann_identifier_replaced, 2);
    assert_eq!(train.ann_identifier_na, 1);
    assert_eq!(train.annotations_out, 3);

    let documents = read_split(&summary.dir, Split::Train).unwrap();
    assert_eq!(documents.len(), 1);
    let document = &documents[0];
    assert!(document.sentences);
    assert!(document.offset_errors().is_empty());

    let identifiers: Vec<_> = document
        .annotations()
        .flat_map(|a| a.identifiers.iter().map(String::as_str))
        .collect();
    assert_eq!(identifiers, vec!["MESH:D001249", "MESH:D006073", "MESH:D001943"]);

    assert_eq!(read_split(&summary.dir, Split::Dev).unwrap().len(), 1);
    assert!(read_split(&summary.dir, Split::Test).unwrap().is_empty());
}
