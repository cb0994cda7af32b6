use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use serde_json::Value;
use tower::ServiceExt;

use crate::routes::build_router;
use crate::state::test_support::test_context;

fn pdf_with_text(lines: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut operations = vec![
        Operation::new("BT", vec![]),
        Operation::new(
            "Tf",
            vec![Object::Name(b"F1".to_vec()), Object::Integer(12)],
        ),
        Operation::new(
            "Tm",
            vec![
                Object::Integer(1),
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(1),
                Object::Integer(100),
                Object::Integer(700),
            ],
        ),
        Operation::new("TL", vec![Object::Integer(14)]),
    ];
    for (index, line) in lines.iter().enumerate() {
        if index > 0 {
            operations.push(Operation::new("T*", vec![]));
        }
        operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
    }
    operations.push(Operation::new("ET", vec![]));
    let content = Content { operations }.encode().unwrap();

    let content_id = doc.add_object(Stream::new(dictionary! {}, content));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

const BOUNDARY: &str = "veil-test-boundary";

fn multipart_body(files: &[(&str, &[u8])], fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, content) in files {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: application/pdf\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_and_security_headers() {
    let app = build_router(test_context().await);
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert!(headers.contains_key("strict-transport-security"));
    assert!(headers.contains_key("content-security-policy"));
    assert_eq!(headers["cache-control"], "no-store");
    assert!(headers.contains_key("permissions-policy"));
}

#[tokio::test]
async fn test_help_engines_etag_roundtrip() {
    let context = test_context().await;
    let app = build_router(context.clone());

    let first = app
        .clone()
        .oneshot(Request::get("/help/engines").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let etag = first.headers()[header::ETAG].to_str().unwrap().to_string();

    let second = app
        .oneshot(
            Request::get("/help/engines")
                .header(header::IF_NONE_MATCH, etag.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    let bytes = axum::body::to_bytes(second.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn test_pdf_extract_counts_and_minimization() {
    let app = build_router(test_context().await);
    let pdf = pdf_with_text(&["Hello John Doe.", "Contact kari@example.no now."]);
    let body = multipart_body(&[("doc.pdf", &pdf)], &[]);

    let response = app
        .oneshot(multipart_request("/pdf/extract", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = response_json(response).await;

    assert_eq!(json["total_document_pages"], 1);
    assert_eq!(json["content_pages"], 1);
    assert!(json["pages"][0]["words"].as_array().unwrap().len() >= 5);
    // Minimization metadata is attached; identifying fields are gone.
    assert!(json["metadata"]["_minimization_meta"].is_object());
    assert_eq!(json["file_info"]["filename"], "doc.pdf");
}

#[tokio::test]
async fn test_ml_detect_pattern_engine() {
    let app = build_router(test_context().await);
    let pdf = pdf_with_text(&["Contact kari@example.no today."]);
    let body = multipart_body(&[("doc.pdf", &pdf)], &[]);

    let response = app
        .oneshot(multipart_request("/ml/detect", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = response_json(response).await;

    let entities = json["entities"].as_array().unwrap();
    assert!(entities.iter().any(|e| e["entity_type"] == "EMAIL"));
    assert_eq!(json["model_info"]["engine"], "pattern");
    let spans = json["redaction_mapping"]["pages"][0]["sensitive"]
        .as_array()
        .unwrap();
    assert!(!spans.is_empty());
    // remove_words was not requested: matched strings stay out of the
    // mapping.
    assert!(spans[0].get("original_text").is_none());
}

#[tokio::test]
async fn test_detect_threshold_filters_scores() {
    let context = test_context().await;
    let app = build_router(context);
    let pdf = pdf_with_text(&["Hello John Doe."]);

    // The mock span engine scores PERSON at 0.92; a 0.95 threshold drops it.
    let body = multipart_body(&[("doc.pdf", &pdf)], &[("threshold", "0.95")]);
    let response = app
        .clone()
        .oneshot(multipart_request("/ml/gl_detect", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = response_json(response).await;
    assert!(json["entities"].as_array().unwrap().is_empty());

    let body = multipart_body(&[("doc2.pdf", &pdf)], &[("threshold", "0.5")]);
    let response = app
        .oneshot(multipart_request("/ml/gl_detect", body))
        .await
        .unwrap();
    let json = response_json(response).await;
    assert_eq!(json["entities"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_threshold_rejected_with_envelope() {
    let app = build_router(test_context().await);
    let pdf = pdf_with_text(&["Hello."]);
    let body = multipart_body(&[("doc.pdf", &pdf)], &[("threshold", "1.5")]);

    let response = app
        .oneshot(multipart_request("/ml/detect", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = response_json(response).await;
    assert_eq!(json["error_type"], "validation");
    assert_eq!(json["status_code"], 400);
    assert!(json["error_id"].is_string());
}

#[tokio::test]
async fn test_non_pdf_upload_rejected() {
    let app = build_router(test_context().await);
    let body = multipart_body(&[("not.pdf", b"PK\x03\x04zipzip")], &[]);

    let response = app
        .oneshot(multipart_request("/pdf/extract", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_pronoun_filter_via_norwegian_route() {
    let app = build_router(test_context().await);
    // "jeg" is in the mock model's vocabulary but is a bare pronoun.
    let pdf = pdf_with_text(&["jeg har en avtale med John Doe."]);
    let body = multipart_body(&[("doc.pdf", &pdf)], &[]);

    let response = app
        .oneshot(multipart_request("/ml/hm_detect", body))
        .await
        .unwrap();
    let json = response_json(response).await;
    let entities = json["entities"].as_array().unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0]["original_text"], "John Doe");
}

#[tokio::test]
async fn test_batch_extract_envelope() {
    let app = build_router(test_context().await);
    let pdf_a = pdf_with_text(&["First document."]);
    let pdf_b = pdf_with_text(&["Second document."]);
    let body = multipart_body(&[("a.pdf", &pdf_a), ("b.pdf", &pdf_b)], &[]);

    let response = app
        .oneshot(multipart_request("/batch/extract", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = response_json(response).await;

    assert_eq!(json["batch_summary"]["total_files"], 2);
    assert_eq!(json["batch_summary"]["successful"], 2);
    assert_eq!(json["batch_summary"]["failed"], 0);
    assert!(json["batch_summary"]["batch_id"].is_string());
    let results = json["file_results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r["status"] == "success"));
}

#[tokio::test]
async fn test_batch_search_finds_word_boxes() {
    let app = build_router(test_context().await);
    let pdf = pdf_with_text(&["The secret word appears here."]);
    let body = multipart_body(&[("doc.pdf", &pdf)], &[("search_terms", "secret")]);

    let response = app
        .oneshot(multipart_request("/batch/search", body))
        .await
        .unwrap();
    let json = response_json(response).await;
    let results = json["file_results"].as_array().unwrap();
    assert_eq!(results[0]["status"], "success");
    let pages = results[0]["results"]["pages"].as_array().unwrap();
    assert_eq!(pages.len(), 1);
    let matches = pages[0]["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["text"], "secret");
    assert!(matches[0]["bbox"]["x0"].is_number());
}

#[tokio::test]
async fn test_pdf_redact_returns_pdf_bytes() {
    let app = build_router(test_context().await);
    let pdf = pdf_with_text(&["the secret value"]);
    let mapping = serde_json::json!({
        "pages": [{
            "page": 1,
            "sensitive": [{
                "entity_type": "SECRET",
                "score": 0.99,
                "bbox": {"x0": 100.0, "y0": 700.0, "x1": 250.0, "y1": 712.0},
                "start": 4, "end": 10,
                "original_text": "secret"
            }]
        }]
    });
    let body = multipart_body(
        &[("doc.pdf", &pdf)],
        &[("redaction_mapping", &mapping.to_string())],
    );

    let response = app
        .oneshot(multipart_request("/pdf/redact", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(bytes.starts_with(b"%PDF-"));
}

#[tokio::test]
async fn test_readiness_reports_engines() {
    let app = build_router(test_context().await);
    let response = app
        .oneshot(Request::get("/readiness").body(Body::empty()).unwrap())
        .await
        .unwrap();
    // The pattern engine is always ready.
    assert_eq!(response.status(), StatusCode::OK);
    let json = response_json(response).await;
    assert_eq!(json["ready"], true);
}

#[tokio::test]
async fn test_status_exposes_subsystems() {
    let app = build_router(test_context().await);
    let response = app
        .oneshot(Request::get("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = response_json(response).await;
    assert!(json["memory"].is_object());
    assert!(json["locks"]["locks"].is_array());
    assert!(json["cache"].is_object());
    assert!(json["detectors"].is_array());
}
