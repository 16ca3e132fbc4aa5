//! Two-node replication behavior across real sockets.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time;

use meshvault::crypto::Secret;
use meshvault::server::{FileServer, FileServerOptions};

fn mesh_secret() -> Secret {
    Secret::from_bytes(&[11u8; 32]).unwrap()
}

async fn start_node(
    dir: &TempDir,
    name: &str,
    secret: Secret,
    bootstrap: Vec<std::net::SocketAddr>,
) -> Arc<FileServer> {
    FileServer::start(
        FileServerOptions {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            storage_root: dir.path().join(name),
            bootstrap_peers: bootstrap,
            fetch_timeout: Duration::from_secs(2),
        },
        secret,
    )
    .await
    .unwrap()
}

async fn wait_for_peers(server: &Arc<FileServer>, expected: usize) {
    for _ in 0..300 {
        if server.peer_count().await == expected {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "never saw {expected} peers, have {}",
        server.peer_count().await
    );
}

async fn wait_for_key(server: &Arc<FileServer>, key: &str) {
    for _ in 0..300 {
        if server.has(key).await.unwrap() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("blob {key} never arrived");
}

#[tokio::test]
async fn store_pushes_the_blob_to_connected_peers() {
    let dir = TempDir::new().unwrap();
    let node_a = start_node(&dir, "a", mesh_secret(), Vec::new()).await;
    let node_b = start_node(&dir, "b", mesh_secret(), vec![node_a.local_addr()]).await;

    wait_for_peers(&node_a, 1).await;
    wait_for_peers(&node_b, 1).await;

    let content = b"replicated everywhere".to_vec();
    node_a
        .store("shared.txt", &mut content.as_slice())
        .await
        .unwrap();

    // The push is fire-and-forget; b holds the blob shortly after.
    wait_for_key(&node_b, "shared.txt").await;

    let mut out = Vec::new();
    node_b.retrieve("shared.txt", &mut out).await.unwrap();
    assert_eq!(out, content);
}

#[tokio::test]
async fn retrieve_pulls_from_the_mesh_and_caches_locally() {
    let dir = TempDir::new().unwrap();
    let node_a = start_node(&dir, "a", mesh_secret(), Vec::new()).await;

    // The blob exists before b ever joins, so no push reaches b.
    let content: Vec<u8> = (0..150_000u32).map(|i| (i % 241) as u8).collect();
    node_a
        .store("archive.bin", &mut content.as_slice())
        .await
        .unwrap();

    let node_b = start_node(&dir, "b", mesh_secret(), vec![node_a.local_addr()]).await;
    wait_for_peers(&node_a, 1).await;
    assert!(!node_b.has("archive.bin").await.unwrap());

    let mut out = Vec::new();
    node_b.retrieve("archive.bin", &mut out).await.unwrap();
    assert_eq!(out, content);

    // The fetched copy is cached; a is no longer needed.
    node_a.shutdown();
    wait_for_peers(&node_b, 0).await;

    let mut cached = Vec::new();
    node_b.retrieve("archive.bin", &mut cached).await.unwrap();
    assert_eq!(cached, content);
}

#[tokio::test]
async fn missing_key_times_out_to_not_found() {
    let dir = TempDir::new().unwrap();
    let node_a = start_node(&dir, "a", mesh_secret(), Vec::new()).await;
    let node_b = start_node(&dir, "b", mesh_secret(), vec![node_a.local_addr()]).await;
    wait_for_peers(&node_b, 1).await;

    let mut out = Vec::new();
    let err = node_b.retrieve("nobody-has-this", &mut out).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn concurrent_stores_replicate_independently() {
    let dir = TempDir::new().unwrap();
    let node_a = start_node(&dir, "a", mesh_secret(), Vec::new()).await;
    let node_b = start_node(&dir, "b", mesh_secret(), vec![node_a.local_addr()]).await;
    wait_for_peers(&node_a, 1).await;

    let mut tasks = Vec::new();
    for i in 0..6u8 {
        let node_a = node_a.clone();
        tasks.push(tokio::spawn(async move {
            let content = vec![i; 20_000];
            node_a
                .store(&format!("bulk-{i}"), &mut content.as_slice())
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for i in 0..6u8 {
        wait_for_key(&node_b, &format!("bulk-{i}")).await;
        let mut out = Vec::new();
        node_b
            .retrieve(&format!("bulk-{i}"), &mut out)
            .await
            .unwrap();
        assert_eq!(out, vec![i; 20_000]);
    }
}

#[tokio::test]
async fn nodes_with_different_secrets_exchange_garbage() {
    let dir = TempDir::new().unwrap();
    let node_a = start_node(&dir, "a", mesh_secret(), Vec::new()).await;
    let other_secret = Secret::from_bytes(&[99u8; 32]).unwrap();
    let node_b = start_node(&dir, "b", other_secret, vec![node_a.local_addr()]).await;

    wait_for_peers(&node_a, 1).await;

    let content = b"only readable with the right key".to_vec();
    node_a.store("mixed", &mut content.as_slice()).await.unwrap();
    wait_for_key(&node_b, "mixed").await;

    // Replication carries ciphertext; the mismatched secret decrypts it
    // into garbage, never into an error.
    let mut out = Vec::new();
    node_b.retrieve("mixed", &mut out).await.unwrap();
    assert_eq!(out.len(), content.len());
    assert_ne!(out, content);
}
