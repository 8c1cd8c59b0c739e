use std::time::Duration;

use serde_json::json;

use super::aggregate::MetricAggregator;
use super::compare::{FieldComparator, VerdictKind};
use super::score::{DocumentScore, RecordScorer};
use crate::schema::{Field, GroundTruthRecord, InvoiceFields};

fn scorer() -> RecordScorer {
    RecordScorer::new(
        FieldComparator::with_defaults().expect("default rules compile"),
        None,
    )
}

#[test]
fn end_to_end_format_variants_are_all_true_positive() {
    let truth = GroundTruthRecord::from_json(
        "inv-e2e",
        &json!({
            "invoice_number": null,
            "invoice_date": null,
            "vendor_name": "Mustermann GmbH",
            "recipient_name": null,
            "total_amount": 367.50,
            "currency": null,
            "tax_rate": 19.00,
            "purchase_order_number": null,
            "ust-id": null,
            "iban": "AT491700000122001632",
        }),
    )
    .expect("ground truth parses");
    let extraction = InvoiceFields::from_json_object(&json!({
        "invoice_number": null,
        "invoice_date": null,
        "vendor_name": "Mustermann GmbH.",
        "recipient_name": null,
        "total_amount": "367,50",
        "currency": null,
        "tax_rate": 19.0,
        "purchase_order_number": null,
        "ust-id": null,
        "iban": "AT49 1700 0001 2200 1632",
    }))
    .expect("extraction parses");

    let score = scorer().score(&truth, &extraction);

    for field in [Field::TotalAmount, Field::TaxRate, Field::Iban, Field::VendorName] {
        assert_eq!(score.verdict(field).kind, VerdictKind::TruePositive, "{field}");
    }
    assert!(score.fully_correct);
}

#[test]
fn ten_documents_split_and_merged_match_direct_aggregation() {
    let scorer = scorer();
    let scores = (0..10)
        .map(|index| {
            let truth = GroundTruthRecord::from_json(
                &format!("inv-{index:02}"),
                &json!({
                    "invoice_number": format!("RE-{index}"),
                    "invoice_date": "12.03.2015",
                    "vendor_name": "Mustermann GmbH",
                    "recipient_name": "Beispiel AG",
                    "total_amount": 100.0 + index as f64,
                    "currency": "EUR",
                    "tax_rate": 19.0,
                    "purchase_order_number": null,
                    "ust-id": "DE123456789",
                    "iban": null,
                }),
            )
            .expect("ground truth parses");

            let extraction = if index % 4 == 3 {
                InvoiceFields::empty()
            } else {
                InvoiceFields::from_json_object(&json!({
                    "invoice_number": format!("re-{}", index + index % 2),
                    "invoice_date": "2015-03-12",
                    "vendor_name": if index % 3 == 0 { "Mustermann" } else { "Mustermann GmbH" },
                    "recipient_name": "Beispiel AG",
                    "total_amount": format!("{},00", 100 + index),
                    "currency": "eur",
                    "tax_rate": "19 %",
                    "purchase_order_number": if index == 5 { "PO-1" } else { "" },
                    "ust-id": "DE123456789",
                    "iban": null,
                }))
                .expect("extraction parses")
            };

            let score = scorer.score(&truth, &extraction);
            DocumentScore::from_record(
                &truth.document_id,
                "paddle+mistral",
                score,
                Duration::from_millis(900 + 10 * index as u64),
                Some(Duration::from_millis(700)),
                None,
            )
        })
        .collect::<Vec<_>>();

    let mut direct = MetricAggregator::new("paddle+mistral");
    scores.iter().for_each(|score| direct.ingest(score));

    let mut first = MetricAggregator::new("paddle+mistral");
    let mut second = MetricAggregator::new("paddle+mistral");
    scores[..5].iter().for_each(|score| first.ingest(score));
    scores[5..].iter().for_each(|score| second.ingest(score));
    let merged = first.merge(&second).expect("same variant merges");

    let direct = direct.finalize();
    assert_eq!(merged.finalize(), direct);
    assert_eq!(direct.documents, 10);
    assert_eq!(direct.field(Field::PurchaseOrderNumber).counts.false_positive, 1);
}
