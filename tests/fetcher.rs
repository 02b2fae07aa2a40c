use std::time::Duration;

use proxy_pool::{Anonymity, FetcherConfig, ProxyFetcher, ProxyProtocol, ProxyRecord, ProxySource, SourceFormat};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher(sources: Vec<ProxySource>, seeds: Vec<ProxyRecord>) -> ProxyFetcher {
    let config = FetcherConfig::new()
        .with_sources(sources)
        .with_seeds(seeds)
        .with_timeout(Duration::from_secs(5))
        .with_pacing(Duration::ZERO, Duration::ZERO);
    ProxyFetcher::with_config(config).unwrap()
}

fn text_list(count: usize) -> String {
    (0..count)
        .map(|i| format!("45.{}.{}.7:8080\n", i / 250, i % 250))
        .collect()
}

#[tokio::test]
async fn test_fetch_all_merges_text_and_geonode_sources() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/http.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "# fresh list\n8.8.4.4:3128\n1.1.1.1:80\n\n999.1.1.1:80\n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/geonode"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"ip": "9.9.9.9", "port": "1080", "protocols": ["socks5"],
                 "country": "DE", "anonymityLevel": "elite"},
                {"ip": "1.1.1.1", "port": 80, "protocols": ["http"]},
                {"ip": "bad", "port": "1"}
            ]
        })))
        .mount(&server)
        .await;

    let fetcher = fetcher(
        vec![
            ProxySource::new("geonode", &format!("{}/geonode", server.uri()), SourceFormat::Geonode, 1),
            ProxySource::new("plain-http", &format!("{}/http.txt", server.uri()), SourceFormat::Text, 2),
        ],
        Vec::new(),
    );

    let candidates = fetcher.fetch_all().await;
    let addresses: Vec<&str> = candidates.iter().map(|r| r.address.as_str()).collect();
    assert_eq!(addresses, vec!["9.9.9.9:1080", "1.1.1.1:80", "8.8.4.4:3128"]);

    let socks = &candidates[0];
    assert_eq!(socks.protocol, ProxyProtocol::Socks5);
    assert_eq!(socks.country, "DE");
    assert_eq!(socks.anonymity, Anonymity::HighAnonymous);
    assert_eq!(socks.source, "geonode");

    // the duplicate keeps the record from the higher-priority source
    assert_eq!(candidates[1].source, "geonode");
    assert_eq!(candidates[2].source, "plain-http");
    assert_eq!(candidates[2].protocol, ProxyProtocol::Http);
}

#[tokio::test]
async fn test_failing_source_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_string("8.8.8.8:8080\n"))
        .mount(&server)
        .await;

    let fetcher = fetcher(
        vec![
            ProxySource::new("broken", &format!("{}/broken", server.uri()), SourceFormat::Text, 1),
            ProxySource::new("working", &format!("{}/list", server.uri()), SourceFormat::Text, 2),
        ],
        vec![ProxyRecord::new("10.0.0.1:80", ProxyProtocol::Http).with_source("builtin")],
    );

    let results = fetcher.fetch_sources_with_results().await;
    assert_eq!(results.len(), 2);
    assert!(!results[0].is_success());
    assert!(results[0].error.as_deref().unwrap_or_default().contains("500"));
    assert!(results[1].is_success());

    // seeds stay unused while any source delivers
    let candidates = fetcher.fetch_all().await;
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].address, "8.8.8.8:8080");
}

#[tokio::test]
async fn test_results_capped_by_priority() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big"))
        .respond_with(ResponseTemplate::new(200).set_body_string(text_list(120)))
        .mount(&server)
        .await;

    let url = format!("{}/big", server.uri());
    let fetcher = fetcher(Vec::new(), Vec::new());

    let trusted = ProxySource::new("trusted", &url, SourceFormat::Text, 1);
    assert_eq!(fetcher.fetch_source(&trusted).await.unwrap().len(), 50);

    let secondary = ProxySource::new("secondary", &url, SourceFormat::Text, 3);
    assert_eq!(fetcher.fetch_source(&secondary).await.unwrap().len(), 30);
}

#[tokio::test]
async fn test_unreadable_json_source_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/geonode"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>rate limited</html>"))
        .mount(&server)
        .await;

    let fetcher = fetcher(Vec::new(), Vec::new());
    let source = ProxySource::new("geonode", &format!("{}/geonode", server.uri()), SourceFormat::Geonode, 1);
    let err = fetcher.fetch_source(&source).await.unwrap_err();
    assert!(err.to_string().contains("geonode"));
}
