//! End-to-end checks of a configured symbol server: config file on disk,
//! JSON registry, filesystem store, HTTP upload and download.

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use zip::write::SimpleFileOptions;

use symstore::config::{ServerConfig, StorageConfig};
use symstore::pdb::METADATA_SIGNATURE;
use symstore::server::{self, AppState, API_KEY_HEADER};
use symstore::{PdbSignature, SymbolKey};

const API_KEY: &str = "push-key";
const GUID: [u8; 16] = [
    0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef,
];

/// Minimal portable PDB: metadata root with a single `#Pdb` stream.
fn portable_pdb(guid: [u8; 16]) -> Vec<u8> {
    let version = b"PDB v1.0\0\0\0\0";
    let mut out = Vec::new();
    out.extend_from_slice(&METADATA_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(version.len() as u32).to_le_bytes());
    out.extend_from_slice(version);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    let stream_offset = (out.len() + 16) as u32;
    out.extend_from_slice(&stream_offset.to_le_bytes());
    out.extend_from_slice(&20u32.to_le_bytes());
    out.extend_from_slice(b"#Pdb\0\0\0\0");
    out.extend_from_slice(&guid);
    out.extend_from_slice(&[0u8; 4]);
    out
}

fn snupkg(id: &str, version: &str, pdb: &[u8]) -> Vec<u8> {
    let manifest = format!(
        "<?xml version=\"1.0\"?><package><metadata><id>{}</id><version>{}</version>\
         </metadata></package>",
        id, version
    );
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer.start_file(format!("{}.nuspec", id), options).unwrap();
    writer.write_all(manifest.as_bytes()).unwrap();
    writer.start_file("_rels/.rels", options).unwrap();
    writer.write_all(b"<Relationships/>").unwrap();
    writer.start_file(format!("lib/net8.0/{}.pdb", id), options).unwrap();
    writer.write_all(pdb).unwrap();
    writer.finish().unwrap().into_inner()
}

/// Write a config and registry under `root` and load the config back from disk.
fn configure(root: &Path) -> ServerConfig {
    let registry_path = root.join("packages.json");
    std::fs::write(
        &registry_path,
        r#"[{"id": "Contoso.Widgets", "version": "2.1"}]"#,
    )
    .unwrap();

    let config = ServerConfig {
        api_key: Some(API_KEY.to_string()),
        registry_path,
        storage: StorageConfig::Filesystem {
            path: root.join("symbols"),
        },
        ..ServerConfig::default()
    };
    let config_path = root.join("symstore.toml");
    let config_path = config_path.to_str().unwrap();
    config.save(config_path).unwrap();

    let loaded = ServerConfig::load_or_create(Some(config_path)).unwrap();
    loaded.ensure_directories().unwrap();
    loaded
}

async fn app(config: &ServerConfig) -> axum::Router {
    let state = AppState::from_config(config, CancellationToken::new()).await.unwrap();
    server::router(Arc::new(state))
}

fn push(body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri("/api/v2/symbol")
        .header(API_KEY_HEADER, API_KEY)
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn download_uri(file: &str) -> String {
    let key = SymbolKey::portable_pdb(file, &PdbSignature(GUID));
    format!("/api/download/symbols/{}", key)
}

async fn body(response: axum::http::Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn pushed_symbols_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = configure(dir.path());
    let pdb = portable_pdb(GUID);

    let first = app(&config).await;
    let response = first
        .clone()
        .oneshot(push(snupkg("Contoso.Widgets", "2.1.0", &pdb)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // A fresh server over the same directories serves what the first stored.
    let second = app(&config).await;
    let response = second
        .clone()
        .oneshot(get(&download_uri("Contoso.Widgets.pdb")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await, pdb);

    let response = second
        .oneshot(push(snupkg("Contoso.Widgets", "2.1", &pdb)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn rejected_pushes_store_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = configure(dir.path());
    let app = app(&config).await;
    let pdb = portable_pdb(GUID);

    let response = app
        .clone()
        .oneshot(push(snupkg("Contoso.Gadgets", "2.1.0", &pdb)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let unauthenticated = Request::builder()
        .method("PUT")
        .uri("/api/v2/symbol")
        .body(Body::from(snupkg("Contoso.Widgets", "2.1.0", &pdb)))
        .unwrap();
    let response = app.clone().oneshot(unauthenticated).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    for file in ["Contoso.Gadgets.pdb", "Contoso.Widgets.pdb"] {
        let response = app.clone().oneshot(get(&download_uri(file))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{file}");
    }
}
