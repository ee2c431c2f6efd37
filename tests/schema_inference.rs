use tabular_convert::PipelineError;
use tabular_convert::inference::{IssueKind, SemanticFormat};
use tabular_convert::ingestion::SourceFormat;
use tabular_convert::service::SchemaInferRequest;
use tabular_convert::types::DataType;
use tabular_convert::versioning::MetadataStore;

mod common;

use common::HarnessBuilder;

/// 950 addresses and 50 blanks, interleaved.
fn contacts_csv() -> String {
    let mut out = String::from("id,email\n");
    for i in 0..1000 {
        if i % 20 == 7 {
            out.push_str(&format!("{i},\n"));
        } else {
            out.push_str(&format!("{i},user{i}@example.com\n"));
        }
    }
    out
}

#[tokio::test]
async fn email_column_with_blanks_is_nullable_and_recognized() {
    let h = HarnessBuilder::new("infer-email").build();
    common::file_source(&h.store, "contacts", "csv");
    common::upload(&h.root, "contacts", "contacts.csv", contacts_csv().as_bytes());

    let report = h
        .converter
        .infer_schema(SchemaInferRequest::new("contacts"))
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.format, SourceFormat::Csv);
    assert_eq!(report.schema_info.total_rows, 1000);
    assert_eq!(report.schema_info.total_columns, 2);
    assert!(report.schema_info.file_size_bytes.unwrap() > 0);

    let id = &report.schema_info.columns[0];
    assert_eq!(id.data_type, DataType::Int64);
    assert!(!id.nullable);

    let email = &report.schema_info.columns[1];
    assert_eq!(email.data_type, DataType::Utf8);
    assert!(email.nullable);
    assert_eq!(email.null_count, 50);
    assert_eq!(email.detected_format, Some(SemanticFormat::Email));
    assert_eq!(email.unique_count, 950);

    assert_eq!(report.sample_data.len(), 100);
    assert!(h.store.list_versions("contacts").await.unwrap().is_empty());
}

#[tokio::test]
async fn inference_is_repeatable() {
    let h = HarnessBuilder::new("infer-repeat").build();
    common::file_source(&h.store, "contacts", "csv");
    common::upload(&h.root, "contacts", "contacts.csv", contacts_csv().as_bytes());

    let first = h.converter.infer_schema(SchemaInferRequest::new("contacts")).await.unwrap();
    let second = h.converter.infer_schema(SchemaInferRequest::new("contacts")).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn sample_size_bounds_the_rows_examined() {
    let h = HarnessBuilder::new("infer-sample").build();
    common::file_source(&h.store, "contacts", "csv");
    common::upload(&h.root, "contacts", "contacts.csv", contacts_csv().as_bytes());

    let mut req = SchemaInferRequest::new("contacts");
    req.sample_size = Some(5);
    let report = h.converter.infer_schema(req).await.unwrap();
    assert_eq!(report.schema_info.total_rows, 5);
    assert_eq!(report.schema_info.columns[1].null_count, 0);

    let mut too_big = SchemaInferRequest::new("contacts");
    too_big.sample_size = Some(10_001);
    let err = h.converter.infer_schema(too_big).await.unwrap_err();
    assert!(matches!(err, PipelineError::Input(_)));
}

#[tokio::test]
async fn declared_non_nullable_columns_warn_on_nulls() {
    let h = HarnessBuilder::new("infer-warn").build();
    common::file_source(&h.store, "people", "csv");
    common::upload(
        &h.root,
        "people",
        "people.csv",
        &std::fs::read(common::fixture("people.csv")).unwrap(),
    );

    let mut req = SchemaInferRequest::new("people");
    req.non_nullable = vec!["score".into()];
    let report = h.converter.infer_schema(req).await.unwrap();
    let warning = report
        .warnings
        .iter()
        .find(|w| w.issue == IssueKind::NullValues)
        .unwrap();
    assert_eq!(warning.column, "score");
    assert_eq!(warning.affected_rows, vec![2]);
}
