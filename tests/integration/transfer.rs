use archipel_services::Event;
use archipeld::TransferStatus;
use bytes::Bytes;

use crate::*;

/// 10 MiB at 256 KiB chunks: 40 chunks, fetched and verified end to end.
#[tokio::test]
async fn ten_mib_file_arrives_intact() {
    let a = spawn_node().await;
    let mut b = spawn_node().await;

    let data = pattern(10 * 1024 * 1024, 0x11);
    let manifest = a.node.share(Bytes::from(data.clone()), Some("big.bin".into())).await.unwrap();
    assert_eq!(manifest.chunk_size, 256 * 1024);
    assert_eq!(manifest.chunk_count(), 40);

    connect(&b, &a).await;
    let hash = manifest.content_hash;
    wait_for_event(&mut b.events, "manifest announcement", |e| {
        matches!(e, Event::ManifestAnnounced { content_hash, .. } if *content_hash == hash)
    })
    .await;

    let path = within("fetch", b.node.fetch(hash).wait()).await.unwrap();
    let fetched = std::fs::read(&path).unwrap();
    assert_eq!(fetched.len(), data.len());
    assert!(fetched == data, "fetched bytes differ");
    assert!(b.node.catalogue().is_complete(&hash));

    let status = b.node.status();
    assert_eq!(status.chunks_stored, 40);
    assert_eq!(status.bytes_stored, data.len() as u64);
}

/// A fetch started before anyone has the file waits for the announcement.
#[tokio::test]
async fn fetch_waits_for_a_later_announcement() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    connect(&b, &a).await;

    let data = pattern(700_000, 0x22);
    let hash = archipel_core::FileManifest::from_bytes(&data, 256 * 1024)
        .unwrap()
        .content_hash;

    let handle = b.node.fetch(hash);
    assert_eq!(handle.status(), TransferStatus::AwaitingManifest);

    a.node.share(Bytes::from(data.clone()), None).await.unwrap();
    let path = within("fetch", handle.wait()).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), data);
}

/// A node that finished a download serves it on to the next one.
#[tokio::test]
async fn downloader_becomes_a_provider() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let c = spawn_node().await;

    let data = pattern(1_000_000, 0x33);
    let hash = a.node.share(Bytes::from(data.clone()), None).await.unwrap().content_hash;

    connect(&b, &a).await;
    wait_until("b learns the manifest", || b.node.catalogue().get(&hash).is_some()).await;
    within("b fetch", b.node.fetch(hash).wait()).await.unwrap();

    // C is introduced to B only; A may still be dialled through its peer list.
    connect(&c, &b).await;
    let path = within("c fetch", c.node.fetch(hash).wait()).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), data);
}

#[tokio::test]
async fn unknown_content_fails_after_waiting() {
    let a = spawn_node_with(
        archipel_core::Identity::generate(),
        std::sync::Arc::new(archipel_services::MemoryPersistence::default()),
        |c| {
            c.transfer.request_timeout_secs = 1;
            c.transfer.max_chunk_attempts = 1;
        },
    )
    .await;

    let result = within("fetch", a.node.fetch([0x42; 32]).wait()).await;
    assert_eq!(result, Err(archipel_services::TransferError::ManifestUnavailable));
}
