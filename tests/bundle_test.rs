//! Integration tests for page bundles and the shared dependency zip.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::Arc;

use site_archiver::archiver::{ArchiveOptions, SiteArchiver};
use site_archiver::error::ArchiveError;
use site_archiver::fetch::{FetchOptions, Fetcher};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html")
}

async fn mount_site(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/one.html"))
        .respond_with(html(
            r#"<html><head><link rel="stylesheet" href="/shared.css"></head><body><img src="/one.png"></body></html>"#,
        ))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/two.html"))
        .respond_with(html(
            r#"<html><head><link rel="stylesheet" href="/shared.css"></head><body><img src="/two.png"></body></html>"#,
        ))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/shared.css"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("body { margin: 0 }", "text/css"))
        .mount(server)
        .await;
    for image in ["/one.png", "/two.png"] {
        Mock::given(method("GET"))
            .and(path(image))
            .respond_with(ResponseTemplate::new(200).set_body_raw(image.as_bytes().to_vec(), "image/png"))
            .mount(server)
            .await;
    }
}

async fn archive_both(server: &MockServer, root: &std::path::Path) -> SiteArchiver {
    let fetcher = Fetcher::new(FetchOptions::default()).unwrap();
    let mut archiver = SiteArchiver::open(root, Arc::new(fetcher), ArchiveOptions::default())
        .await
        .unwrap();
    for page in ["one.html", "two.html"] {
        archiver
            .get_page(&format!("{}/{page}", server.uri()), false, None)
            .await
            .unwrap()
            .unwrap();
    }
    archiver
}

fn entry_names(zip_path: &std::path::Path) -> BTreeSet<String> {
    let archive = zip::ZipArchive::new(std::fs::File::open(zip_path).unwrap()).unwrap();
    archive.file_names().map(str::to_string).collect()
}

#[tokio::test]
async fn test_export_page_round_trip() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    let site_dir = format!("127.0.0.1_{}", server.address().port());

    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("archive");
    let archiver = archive_both(&server, &root).await;

    let out = temp_dir.path().join("bundles/one.zip");
    let seed = format!("{}/one.html", server.uri());
    archiver.export_page_as_zip(&seed, &out).await.unwrap();

    let names = entry_names(&out);
    let expected: BTreeSet<String> = [
        "index.html".to_string(),
        format!("{site_dir}/one.png"),
        format!("{site_dir}/shared.css"),
    ]
    .into_iter()
    .collect();
    assert_eq!(names, expected);

    let mut archive = zip::ZipArchive::new(std::fs::File::open(&out).unwrap()).unwrap();
    let mut index = String::new();
    archive
        .by_name("index.html")
        .unwrap()
        .read_to_string(&mut index)
        .unwrap();
    assert_eq!(index, archiver.cache().page_html(&seed).await.unwrap());
    assert!(index.contains(&format!(r#"src="{site_dir}/one.png""#)));

    // Rebuilding the same bundle is byte-identical.
    let again = temp_dir.path().join("bundles/one-again.zip");
    archiver.export_page_as_zip(&seed, &again).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), std::fs::read(&again).unwrap());
}

#[tokio::test]
async fn test_dependency_zip_holds_shared_resources_only() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    let site_dir = format!("127.0.0.1_{}", server.address().port());

    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("archive");
    let archiver = archive_both(&server, &root).await;

    let out = temp_dir.path().join("deps.zip");
    assert!(archiver.create_dependency_zip(2, &out).await.unwrap());
    assert_eq!(
        entry_names(&out),
        [format!("{site_dir}/shared.css")].into_iter().collect()
    );

    let none = temp_dir.path().join("none.zip");
    assert!(!archiver.create_dependency_zip(3, &none).await.unwrap());
    assert!(!none.exists());
}

#[tokio::test]
async fn test_export_unknown_page() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = Fetcher::new(FetchOptions::default()).unwrap();
    let archiver = SiteArchiver::open(temp_dir.path(), Arc::new(fetcher), ArchiveOptions::default())
        .await
        .unwrap();

    let err = archiver
        .export_page_as_zip("https://never.example/", &temp_dir.path().join("x.zip"))
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::PageNotArchived(_)));
}
