//! Gateway assembly and lifecycle
//!
//! The gateway subscribes to both topics, so reconnection is driven by the
//! link's disconnect notifications. The first connect runs on the link's
//! scheduler and retries with backoff until the broker answers.

use meshlink_core::{
    Connector, DeduplicationCache, Dispatcher, GatewayConfig, LinkManager, MessageSink,
    PacketCodec, RegistrationStorage, Scheduler, SessionStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::mesh::MeshRouter;
use crate::notifier::ChatNotifier;
use crate::outbox::MeshOutbox;
use crate::router::ChatRouter;
use crate::status::{GatewayTracker, StatusAnnouncer};

/// A wired gateway process
pub struct Gateway {
    config: GatewayConfig,
    link: Arc<LinkManager>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionStore>,
    dedup: DeduplicationCache,
    outbox: Arc<MeshOutbox>,
    chat_router: Arc<ChatRouter>,
    mesh_router: Arc<MeshRouter>,
    announcer: Arc<StatusAnnouncer>,
    tracker: Arc<GatewayTracker>,
    scheduler: Scheduler,
}

impl Gateway {
    /// Wire every component; nothing runs until [`Gateway::start`]
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        storage: Arc<dyn RegistrationStorage>,
        notifier: Arc<dyn ChatNotifier>,
        codec: Arc<dyn PacketCodec>,
    ) -> meshlink_core::Result<Self> {
        let gateway_node = config.mesh.node_number()?;

        let link = Arc::new(LinkManager::new(config.link.clone(), connector));
        let dispatcher = Arc::new(Dispatcher::new(
            &config.dispatcher,
            link.clone() as Arc<dyn MessageSink>,
        ));
        let sessions = Arc::new(SessionStore::new(config.session.clone(), storage.clone()));
        let dedup = DeduplicationCache::from_config(&config.admission);
        let tracker = Arc::new(GatewayTracker::new());

        let outbox = Arc::new(MeshOutbox::new(
            dispatcher.clone(),
            codec.clone(),
            config.topics.mesh.clone(),
            config.mesh.gateway_id.clone(),
            gateway_node,
            config.mesh.hop_limit,
        ));
        let chat_router = Arc::new(ChatRouter::new(
            sessions.clone(),
            outbox.clone(),
            notifier.clone(),
        ));
        let mesh_router = Arc::new(MeshRouter::new(
            sessions.clone(),
            dedup.clone(),
            codec,
            notifier,
            tracker.clone(),
            gateway_node,
        ));
        let announcer = Arc::new(StatusAnnouncer::new(
            config.mesh.gateway_id.clone(),
            config.topics.status.clone(),
            link.clone(),
            dispatcher.clone(),
            storage,
            tracker.clone(),
        ));

        link.register_handler(config.topics.chat_updates.clone(), chat_router.clone());
        link.register_handler(config.topics.mesh.clone(), mesh_router.clone());

        Ok(Self {
            config,
            link,
            dispatcher,
            sessions,
            dedup,
            outbox,
            chat_router,
            mesh_router,
            announcer,
            tracker,
            scheduler: Scheduler::new(),
        })
    }

    /// Start the link, the dispatcher and the periodic work
    pub fn start(&self) -> meshlink_core::Result<()> {
        self.link.start()?;
        self.dispatcher.start()?;
        self.link.connect_in_background();

        let announcer = self.announcer.clone();
        self.scheduler
            .schedule("status-initial", Duration::ZERO, move || async move {
                announcer.announce().await
            });

        let announcer = self.announcer.clone();
        self.scheduler.schedule_periodic(
            "status",
            self.config.mesh.status_interval,
            move || {
                let announcer = announcer.clone();
                async move { announcer.announce().await }
            },
        );

        let dedup = self.dedup.clone();
        let sessions = self.sessions.clone();
        self.scheduler.schedule_periodic(
            "purge",
            self.config.mesh.purge_interval,
            move || {
                let dedup = dedup.clone();
                let sessions = sessions.clone();
                async move {
                    let purged = dedup.purge_expired() + sessions.purge_expired();
                    debug!(purged, "Expired entries purged");
                    Ok(())
                }
            },
        );

        info!(
            gateway = %self.config.mesh.gateway_id,
            chat_topic = %self.config.topics.chat_updates,
            mesh_topic = %self.config.topics.mesh,
            "Gateway started"
        );
        Ok(())
    }

    /// Cancel periodic work, stop the dispatcher and close the link
    pub async fn shutdown(&self) {
        self.scheduler.dispose_all().await;
        self.dispatcher.stop().await;
        self.link.shutdown().await;
        info!("Gateway stopped");
    }

    /// Broker link shared by both routers and the dispatcher
    pub fn link(&self) -> &Arc<LinkManager> {
        &self.link
    }

    /// Paced mesh sender
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Conversation state, codes and registrations
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Encoder for outgoing mesh text
    pub fn outbox(&self) -> &Arc<MeshOutbox> {
        &self.outbox
    }

    /// Handler for chat platform updates
    pub fn chat_router(&self) -> &Arc<ChatRouter> {
        &self.chat_router
    }

    /// Handler for inbound mesh envelopes
    pub fn mesh_router(&self) -> &Arc<MeshRouter> {
        &self.mesh_router
    }

    /// Publisher of the retained status payload
    pub fn announcer(&self) -> &Arc<StatusAnnouncer> {
        &self.announcer
    }

    /// Last-seen times of other gateways
    pub fn tracker(&self) -> &Arc<GatewayTracker> {
        &self.tracker
    }
}
