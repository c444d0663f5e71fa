// Integration tests for the gateway HTTP surface, backed by the in-memory swarm.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

use ma_magnet_gateway::locator::InfoHash;
use ma_magnet_gateway::swarm::memory::{MemorySwarm, MemoryTorrent, Readiness};
use ma_magnet_gateway::{Gateway, GatewayConfig, GatewayServer};

const MOVIE: &str = "C9E15763F722F23E98A29DECDFAE341B98D53056";
const BLOCKED: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
const UNKNOWN: &str = "1111111111111111111111111111111111111111";

/// Deterministic test content.
fn generate_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

fn magnet(hash: &str) -> String {
    format!("magnet:?xt=urn:btih:{}&dn=movie", hash)
}

fn test_config() -> GatewayConfig {
    GatewayConfig {
        trackers: Vec::new(),
        blocked_hashes: vec![BLOCKED.to_string()],
        resolve_timeout_secs: 5,
        ..GatewayConfig::default()
    }
}

async fn start(config: GatewayConfig, swarm: Arc<MemorySwarm>) -> GatewayServer {
    let gateway = Arc::new(Gateway::new(config, swarm).unwrap());
    GatewayServer::start(gateway, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
}

fn swarm_with(hash: &str, torrent: MemoryTorrent) -> Arc<MemorySwarm> {
    let swarm = Arc::new(MemorySwarm::new());
    swarm.insert(InfoHash::parse(hash).unwrap(), torrent);
    swarm
}

fn header<'a>(resp: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn test_partial_range() {
    let content = generate_content(1000);
    let swarm = swarm_with(MOVIE, MemoryTorrent::new().file("movie.mp4", content.clone()));
    let server = start(test_config(), swarm.clone()).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(server.url_for_magnet(&magnet(MOVIE)))
        .header("Range", "bytes=0-99")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, "content-range"), Some("bytes 0-99/1000"));
    assert_eq!(header(&resp, "content-length"), Some("100"));
    assert_eq!(header(&resp, "accept-ranges"), Some("bytes"));
    assert_eq!(header(&resp, "content-type"), Some("video/mp4"));
    assert_eq!(header(&resp, "access-control-allow-origin"), Some("*"));

    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &content[0..100]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_full_content_without_range() {
    let content = generate_content(1_000_000);
    let swarm = swarm_with(MOVIE, MemoryTorrent::new().file("movie.mkv", content.clone()));
    let server = start(test_config(), swarm.clone()).await;

    let resp = reqwest::get(server.url_for_magnet(&magnet(MOVIE)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "content-length"), Some("1000000"));
    assert!(header(&resp, "content-range").is_none());

    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), 1_000_000);
    assert_eq!(&body[..], &content[..]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unsatisfiable_range() {
    let swarm = swarm_with(
        MOVIE,
        MemoryTorrent::new().file("movie.mp4", generate_content(1_000_000)),
    );
    let server = start(test_config(), swarm.clone()).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(server.url_for_magnet(&magnet(MOVIE)))
        .header("Range", "bytes=999999-1000000")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(header(&resp, "content-range"), Some("bytes */1000000"));
    assert_eq!(header(&resp, "access-control-allow-origin"), Some("*"));
    assert!(resp.bytes().await.unwrap().is_empty());
    assert!(server.gateway().connections().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_unordered_range_past_end_is_416() {
    let swarm = swarm_with(
        MOVIE,
        MemoryTorrent::new().file("movie.mp4", generate_content(1000)),
    );
    let server = start(test_config(), swarm.clone()).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(server.url_for_magnet(&magnet(MOVIE)))
        .header("Range", "bytes=5000-10")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(header(&resp, "content-range"), Some("bytes */1000"));
    assert!(resp.bytes().await.unwrap().is_empty());
    assert_eq!(swarm.live_sources(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_blocked_content_never_joins() {
    let swarm = swarm_with(
        BLOCKED,
        MemoryTorrent::new().file("movie.mp4", generate_content(100)),
    );
    let server = start(test_config(), swarm.clone()).await;

    let lowercase = magnet(&BLOCKED.to_lowercase());
    let resp = reqwest::get(server.url_for_magnet(&lowercase)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 451);
    assert_eq!(header(&resp, "access-control-allow-origin"), Some("*"));
    assert_eq!(swarm.join_count(), 0);
    assert!(server.gateway().sessions().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_locator_rejected() {
    let swarm = Arc::new(MemorySwarm::new());
    let server = start(test_config(), swarm.clone()).await;
    let client = reqwest::Client::new();

    let missing = format!("http://127.0.0.1:{}/stream", server.port());
    assert_eq!(
        client.get(&missing).send().await.unwrap().status(),
        StatusCode::BAD_REQUEST
    );

    for bad in [
        "http://example.com/movie.mp4".to_string(),
        "magnet:?dn=no-hash".to_string(),
        "magnet:?xt=urn:btih:tooshort".to_string(),
    ] {
        let resp = client.get(server.url_for_magnet(&bad)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "locator {}", bad);
    }

    assert_eq!(swarm.join_count(), 0);
    assert!(server.gateway().sessions().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_health() {
    let server = start(test_config(), Arc::new(MemorySwarm::new())).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{}/health", server.port()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "access-control-allow-origin"), Some("*"));
    assert_eq!(resp.text().await.unwrap(), "OK");

    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_share_one_join() {
    let content = generate_content(4096);
    let swarm = swarm_with(
        MOVIE,
        MemoryTorrent::new()
            .file("movie.mp4", content.clone())
            .readiness(Readiness::After(Duration::from_millis(300))),
    );
    let server = start(test_config(), swarm.clone()).await;
    let client = reqwest::Client::new();
    let url = server.url_for_magnet(&magnet(MOVIE));

    let mut tasks = Vec::new();
    for i in 0..5u64 {
        let client = client.clone();
        let url = url.clone();
        tasks.push(tokio::spawn(async move {
            let start = i * 100;
            let resp = client
                .get(&url)
                .header("Range", format!("bytes={}-{}", start, start + 99))
                .send()
                .await
                .unwrap();
            (resp.status(), start, resp.bytes().await.unwrap())
        }));
    }
    for task in tasks {
        let (status, start, body) = task.await.unwrap();
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(&body[..], &content[start as usize..start as usize + 100]);
    }
    assert_eq!(swarm.join_count(), 1);

    // A later request reuses the ready session.
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(swarm.join_count(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_resolution_timeout_not_cached() {
    let swarm = Arc::new(MemorySwarm::new());
    let config = GatewayConfig {
        resolve_timeout_secs: 1,
        ..test_config()
    };
    let server = start(config, swarm.clone()).await;
    let url = server.url_for_magnet(&magnet(UNKNOWN));

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(swarm.join_count(), 1);
    assert_eq!(swarm.destroyed_handles(), 1);
    assert!(server.gateway().sessions().is_empty());

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(swarm.join_count(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn test_engine_error_is_500() {
    let swarm = swarm_with(
        MOVIE,
        MemoryTorrent::new().readiness(Readiness::Fail("metadata rejected".into())),
    );
    let server = start(test_config(), swarm.clone()).await;

    let resp = reqwest::get(server.url_for_magnet(&magnet(MOVIE)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(server.gateway().sessions().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_open_ended_range_is_capped() {
    let content = generate_content(1000);
    let swarm = swarm_with(MOVIE, MemoryTorrent::new().file("movie.mp4", content.clone()));
    let config = GatewayConfig {
        open_ended_chunk_bytes: 100,
        ..test_config()
    };
    let server = start(config, swarm.clone()).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(server.url_for_magnet(&magnet(MOVIE)))
        .header("Range", "bytes=10-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, "content-range"), Some("bytes 10-109/1000"));
    assert_eq!(&resp.bytes().await.unwrap()[..], &content[10..110]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_head_does_not_open_source() {
    let swarm = swarm_with(
        MOVIE,
        MemoryTorrent::new().file("movie.mp4", generate_content(1000)),
    );
    let server = start(test_config(), swarm.clone()).await;

    let client = reqwest::Client::new();
    let resp = client
        .head(server.url_for_magnet(&magnet(MOVIE)))
        .header("Range", "bytes=0-9")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, "content-range"), Some("bytes 0-9/1000"));
    assert_eq!(header(&resp, "accept-ranges"), Some("bytes"));
    assert_eq!(swarm.destroyed_sources(), 0);
    assert_eq!(swarm.live_sources(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_source_failure_before_first_byte_is_500() {
    let swarm = swarm_with(
        MOVIE,
        MemoryTorrent::new()
            .file("movie.mp4", generate_content(1000))
            .fail_after(0),
    );
    let server = start(test_config(), swarm.clone()).await;

    let resp = reqwest::get(server.url_for_magnet(&magnet(MOVIE)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(server.gateway().connections().is_empty());
    assert_eq!(swarm.live_sources(), 0);

    // The shared session survives a per-connection failure.
    let hash = InfoHash::parse(MOVIE).unwrap();
    let session = server.gateway().sessions().get(&hash).unwrap();
    assert_eq!(session.active_connections(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_disconnect_releases_connection() {
    let swarm = swarm_with(
        MOVIE,
        MemoryTorrent::new()
            .file("movie.mp4", generate_content(32 * 1024 * 1024))
            .paced(Duration::from_millis(5), 16 * 1024),
    );
    let server = start(test_config(), swarm.clone()).await;

    let mut resp = reqwest::get(server.url_for_magnet(&magnet(MOVIE)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.chunk().await.unwrap().is_some());
    assert_eq!(server.gateway().connections().len(), 1);
    drop(resp);

    let hash = InfoHash::parse(MOVIE).unwrap();
    let session = server.gateway().sessions().get(&hash).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !(server.gateway().connections().is_empty() && swarm.live_sources() == 0) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection not released after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(swarm.destroyed_sources(), 1);
    assert_eq!(session.active_connections(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_destroys_in_flight_sources() {
    let swarm = swarm_with(
        MOVIE,
        MemoryTorrent::new()
            .file("movie.mp4", generate_content(32 * 1024 * 1024))
            .paced(Duration::from_millis(5), 16 * 1024),
    );
    let server = start(test_config(), swarm.clone()).await;

    let mut resp = reqwest::get(server.url_for_magnet(&magnet(MOVIE)))
        .await
        .unwrap();
    assert!(resp.chunk().await.unwrap().is_some());
    assert_eq!(swarm.live_sources(), 1);

    // The client is still attached; teardown must not wait for it.
    server.gateway().shutdown();
    assert!(server.gateway().connections().is_empty());
    assert_eq!(swarm.live_sources(), 0);
    assert_eq!(swarm.destroyed_handles(), 1);

    drop(resp);
    server.shutdown().await;
}
