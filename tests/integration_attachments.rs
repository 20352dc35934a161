mod common;

use bytes::Bytes;
use common::{open_thread, test_platform};
use uuid::Uuid;
use waveline_messaging::domain::attachment::MediaUpload;
use waveline_messaging::error::AppError;

#[tokio::test]
async fn oversized_attachment_is_rejected_before_any_call() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();

    let mut thread = open_thread(&platform, &config, alice, Uuid::new_v4()).await;
    let six_megabytes = MediaUpload::new(Bytes::from(vec![0_u8; 6 * 1024 * 1024]), "image/jpeg");

    let result = thread.send_message("check out this photo".into(), Some(six_megabytes)).await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    // Rejected locally: no upload, no message row, no optimistic entry.
    assert_eq!(platform.blob_put_count(), 0);
    assert_eq!(platform.message_count(), 0);
    assert!(thread.messages().is_empty());
}

#[tokio::test]
async fn unsupported_content_type_is_rejected_before_any_call() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();

    let mut thread = open_thread(&platform, &config, alice, Uuid::new_v4()).await;
    let archive = MediaUpload::new(Bytes::from_static(b"PK\x03\x04"), "application/zip");

    let result = thread.send_message("logs attached".into(), Some(archive)).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
    assert_eq!(platform.blob_put_count(), 0);
    assert!(thread.messages().is_empty());
}

#[tokio::test]
async fn valid_attachment_travels_with_the_message() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut bob_thread = open_thread(&platform, &config, bob, alice).await;
    let mut alice_thread = open_thread(&platform, &config, alice, bob).await;

    let photo = MediaUpload::new(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
    alice_thread.send_message("studio tonight".into(), Some(photo)).await.unwrap();

    assert_eq!(platform.blob_put_count(), 1);
    let url = alice_thread.messages()[0].media_url.clone().expect("sender keeps the media url");
    assert!(url.starts_with("memory://attachments/"));

    assert!(bob_thread.next_remote().await.unwrap());
    assert_eq!(bob_thread.messages()[0].media_url.as_deref(), Some(url.as_str()));
}
