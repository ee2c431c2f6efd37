use std::collections::HashMap;

use tabular_convert::IngestionError;
use tabular_convert::ingestion::{
    Location, ReadOptions, SourceFormat, fetch_source, parse_location, read_bytes, resolve_format,
};

mod common;

#[test]
fn format_resolution_prefers_request_then_source_then_extension() {
    assert_eq!(
        resolve_format(Some(SourceFormat::Tsv), Some("csv"), Some("a.json")).unwrap(),
        SourceFormat::Tsv
    );
    assert_eq!(
        resolve_format(None, Some("ndjson"), Some("a.csv")).unwrap(),
        SourceFormat::Json
    );
    // A database connector type is not a file format; fall through to the extension.
    assert_eq!(
        resolve_format(None, Some("postgresql"), Some("export.GEOJSON")).unwrap(),
        SourceFormat::GeoJson
    );
    let err = resolve_format(None, None, Some("notes.txt")).unwrap_err();
    assert!(matches!(err, IngestionError::Unsupported { .. }));
}

#[tokio::test]
async fn directory_fetch_reads_the_first_matching_upload() {
    let root = common::scratch_dir("unified");
    common::upload(&root, "s1", "b.csv", b"x\n2\n");
    common::upload(&root, "s1", "a.csv", b"x\n1\n");
    common::upload(&root, "s1", "readme.txt", b"ignore me");

    let location = parse_location(&root.display().to_string(), &HashMap::new())
        .unwrap()
        .join("org-acme/uploads/s1");
    let fetched = fetch_source(&location, SourceFormat::Csv, 1024).await.unwrap();
    assert!(fetched.name.ends_with("a.csv"));

    let ds = read_bytes(SourceFormat::Csv, fetched.bytes, &ReadOptions::default()).unwrap();
    assert_eq!(ds.row_count(), 1);
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn glob_patterns_and_size_ceiling() {
    let root = common::scratch_dir("unified-glob");
    let big = vec![b'x'; 4096];
    common::upload(&root, "s2", "big.csv", &big);
    common::upload(&root, "s2", "small.tsv", b"a\tb\n1\t2\n");

    let pattern = root.join("org-acme/uploads/s2/*.tsv");
    let fetched = fetch_source(&Location::Local(pattern), SourceFormat::Tsv, 1024)
        .await
        .unwrap();
    assert!(fetched.name.ends_with("small.tsv"));

    let dir = Location::Local(root.join("org-acme/uploads/s2"));
    let err = fetch_source(&dir, SourceFormat::Csv, 1024).await.unwrap_err();
    assert!(matches!(err, IngestionError::TooLarge { .. }));
    let _ = std::fs::remove_dir_all(&root);
}
