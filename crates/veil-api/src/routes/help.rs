//! `/help/*`: engine and entity catalogs plus live detector status.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use veil_detect::PatternDetector;

use crate::state::AppContext;

fn engine_catalog() -> Value {
    json!([
        {
            "engine": "pattern",
            "route": "/ml/detect",
            "description": "Rule-based detection of structured identifiers",
            "entities": PatternDetector::supported_entities(),
        },
        {
            "engine": "span",
            "route": "/ml/gl_detect",
            "description": "Multilingual span-model PII detection",
            "entities": ["PERSON", "LOCATION", "ORGANISATION", "EMAIL", "PHONE", "NATIONAL_ID", "ADDRESS", "DATE"],
        },
        {
            "engine": "span_no",
            "route": "/ml/hm_detect",
            "description": "Norwegian-tuned span-model PII detection",
            "entities": ["PERSON-H", "FNR-H", "TLF-H", "EPOST-H", "ADRESSE-H", "STED-H", "ORG-H", "DATO-H"],
        },
        {
            "engine": "llm",
            "route": "/ai/detect",
            "description": "LLM-backed contextual detection",
            "entities": ["PERSON", "EMAIL", "PHONE", "ADDRESS", "NATIONAL_ID", "ORGANISATION"],
        },
        {
            "engine": "hybrid",
            "route": "/batch/hybrid_detect",
            "description": "All configured engines in parallel, results merged",
        },
    ])
}

pub async fn engines() -> Json<Value> {
    Json(json!({ "engines": engine_catalog() }))
}

pub async fn entities() -> Json<Value> {
    Json(json!({
        "engines": engine_catalog()
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|e| {
                let entities = e.get("entities")?;
                Some(json!({ "engine": e["engine"], "entities": entities }))
            })
            .collect::<Vec<_>>(),
    }))
}

pub async fn entity_examples() -> Json<Value> {
    Json(json!({
        "examples": {
            "PERSON": "Kari Nordmann",
            "PERSON-H": "Ola Nordmann",
            "EMAIL": "kari@example.no",
            "PHONE": "+47 22 33 44 55",
            "NATIONAL_ID": "01017012345",
            "FNR-H": "01017012345",
            "ADDRESS": "Storgata 1, 0155 Oslo",
            "ORGANISATION": "Eksempel AS",
            "CREDIT_CARD": "4242 4242 4242 4242",
            "IP_ADDRESS": "192.168.1.10",
            "MAC_ADDRESS": "00:1B:44:11:3A:B7",
            "DATE": "17. mai 2024",
        }
    }))
}

pub async fn detectors_status(State(context): State<Arc<AppContext>>) -> Json<Value> {
    let mut statuses = Vec::new();
    for detector in context.all_detectors() {
        statuses.push(detector.status().await);
    }
    Json(json!({ "detectors": statuses }))
}

pub async fn routes() -> Json<Value> {
    Json(json!({
        "routes": [
            { "path": "/pdf/extract", "method": "POST" },
            { "path": "/pdf/redact", "method": "POST" },
            { "path": "/ai/detect", "method": "POST" },
            { "path": "/ml/detect", "method": "POST" },
            { "path": "/ml/gl_detect", "method": "POST" },
            { "path": "/ml/hm_detect", "method": "POST" },
            { "path": "/batch/detect", "method": "POST" },
            { "path": "/batch/hybrid_detect", "method": "POST" },
            { "path": "/batch/extract", "method": "POST" },
            { "path": "/batch/redact", "method": "POST" },
            { "path": "/batch/search", "method": "POST" },
            { "path": "/batch/find_words", "method": "POST" },
            { "path": "/status", "method": "GET" },
            { "path": "/health", "method": "GET" },
            { "path": "/metrics", "method": "GET" },
            { "path": "/readiness", "method": "GET" },
            { "path": "/help/engines", "method": "GET" },
            { "path": "/help/entities", "method": "GET" },
            { "path": "/help/entity-examples", "method": "GET" },
            { "path": "/help/detectors-status", "method": "GET" },
            { "path": "/help/routes", "method": "GET" },
        ]
    }))
}
