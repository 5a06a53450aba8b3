//! Service wiring.

use std::sync::Arc;

use spacebox_cas::{
    ContentStore, DiskIndex, DiskPlacer, DiskTopology, EventSink, Fs2Probe, MemoryIndex,
    SpaceProbe,
};
use spacebox_config::{log_store_info, Config};
use spacebox_multipart::{Sweeper, UploadTaskManager};

use crate::async_task::AsyncTaskTracker;
use crate::metadata::{MemoryMetadata, MetadataStore};
use crate::publisher::{EventPublisher, EventTransport, LogTransport};
use crate::upload::UploadService;
use crate::Result;

/// Collaborators that differ between deployments and tests.
pub struct RuntimeOptions {
    pub probe: Arc<dyn SpaceProbe>,
    pub transport: Arc<dyn EventTransport>,
    pub metadata: Arc<dyn MetadataStore>,
    /// Start the maintenance thread.
    pub background: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            probe: Arc::new(Fs2Probe),
            transport: Arc::new(LogTransport),
            metadata: Arc::new(MemoryMetadata::new()),
            background: true,
        }
    }
}

/// Everything a server process needs, built from one [`Config`].
pub struct Runtime {
    pub config: Config,
    pub store: Arc<ContentStore>,
    pub publisher: Arc<EventPublisher>,
    pub manager: Arc<UploadTaskManager>,
    pub service: UploadService,
    sweeper: Option<Sweeper>,
}

impl Runtime {
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_options(config, RuntimeOptions::default())
    }

    pub fn with_options(config: &Config, options: RuntimeOptions) -> Result<Self> {
        let storage = &config.storage;
        let topology = DiskTopology::load(&storage.topology_path())?;
        let placer = Arc::new(DiskPlacer::new(
            &storage.data_root,
            &topology,
            storage.reserved_space,
            options.probe,
        )?);

        let publisher = Arc::new(EventPublisher::new(&config.notify, options.transport)?);
        let index: Arc<dyn DiskIndex> = Arc::new(MemoryIndex::new());
        let sink: Arc<dyn EventSink> = publisher.clone();
        let store = Arc::new(ContentStore::new(placer, index, sink));
        let indexed = store.rebuild_index(&storage.bucket)?;

        let manager = Arc::new(UploadTaskManager::new(
            store.clone(),
            storage.bucket.clone(),
            storage.multipart_meta_dir(),
            config.multipart.clone(),
        )?);
        let tracker = AsyncTaskTracker::new(&config.tasks);
        let service = UploadService::new(manager.clone(), options.metadata, tracker);

        let sweeper = if options.background {
            Some(Sweeper::spawn(
                manager.clone(),
                config.multipart.sweep_interval(),
            )?)
        } else {
            None
        };

        log_store_info!(
            "runtime ready",
            data_root = tracing::field::display(storage.data_root.display()),
            bucket = storage.bucket.as_str(),
            indexed = indexed
        );
        Ok(Self {
            config: config.clone(),
            store,
            publisher,
            manager,
            service,
            sweeper,
        })
    }

    /// Stop background threads and flush pending events.
    pub fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
        self.publisher.shutdown();
    }
}
