use std::sync::Arc;
use uuid::Uuid;
use waveline_messaging::config::Config;
use waveline_messaging::platform::{BlobStore, DataStore, InMemoryPlatform};
use waveline_messaging::services::attachment::AttachmentService;
use waveline_messaging::services::conversation_store::ConversationStore;
use waveline_messaging::services::thread::ThreadController;

pub fn setup_tracing() {
    waveline_messaging::telemetry::init_test_telemetry();
}

pub fn test_platform() -> (Arc<InMemoryPlatform>, Config) {
    setup_tracing();
    let config = Config::default();
    (Arc::new(InMemoryPlatform::new(&config)), config)
}

#[allow(dead_code)]
pub fn attachment_service(platform: &Arc<InMemoryPlatform>, config: &Config) -> AttachmentService {
    let blobs: Arc<dyn BlobStore> = Arc::<InMemoryPlatform>::clone(platform);
    AttachmentService::new(blobs, config.attachments.clone())
}

#[allow(dead_code)]
pub fn conversation_store(platform: &Arc<InMemoryPlatform>) -> ConversationStore {
    let store: Arc<dyn DataStore> = Arc::<InMemoryPlatform>::clone(platform);
    ConversationStore::new(store)
}

/// Creates (or finds) the conversation between the two users and opens it
/// as `user`.
#[allow(dead_code)]
pub async fn open_thread(
    platform: &Arc<InMemoryPlatform>,
    config: &Config,
    user: Uuid,
    peer: Uuid,
) -> ThreadController {
    let conversation_id = conversation_store(platform)
        .create_or_get(user, peer)
        .await
        .expect("create_or_get should succeed");
    let store: Arc<dyn DataStore> = Arc::<InMemoryPlatform>::clone(platform);
    ThreadController::open(store, attachment_service(platform, config), config, conversation_id, user)
        .await
        .expect("participant should be able to open the thread")
}
