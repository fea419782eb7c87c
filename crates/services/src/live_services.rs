use std::sync::Arc;

use storage::repository::{SessionFilter, Storage};

use crate::Clock;
use crate::admin::SessionAdminService;
use crate::answers::AnswerSubmissionService;
use crate::catalog::CatalogService;
use crate::config::LiveConfig;
use crate::error::LiveServicesInitError;
use crate::registry::ParticipantRegistry;
use crate::results::ResultsService;
use crate::sync::SyncClient;

/// Assembles the live-session services over one storage backend.
#[derive(Clone)]
pub struct LiveServices {
    clock: Clock,
    config: LiveConfig,
    catalog: Arc<CatalogService>,
    admin: Arc<SessionAdminService>,
    registry: Arc<ParticipantRegistry>,
    answers: Arc<AnswerSubmissionService>,
    results: Arc<ResultsService>,
}

impl LiveServices {
    #[must_use]
    pub fn new(storage: &Storage, clock: Clock, config: LiveConfig) -> Self {
        let policy = config.lifecycle;
        let catalog = Arc::new(CatalogService::new(
            clock,
            policy,
            Arc::clone(&storage.sessions),
        ));
        let admin = Arc::new(SessionAdminService::new(
            clock,
            policy,
            Arc::clone(&storage.sessions),
            config.default_max_participants,
        ));
        let registry = Arc::new(ParticipantRegistry::new(
            clock,
            policy,
            Arc::clone(&storage.sessions),
            Arc::clone(&storage.participants),
        ));
        let answers = Arc::new(AnswerSubmissionService::new(
            clock,
            policy,
            Arc::clone(&storage.sessions),
            Arc::clone(&storage.answers),
        ));
        let results = Arc::new(ResultsService::new(
            clock,
            policy,
            Arc::clone(&storage.sessions),
            Arc::clone(&storage.participants),
        ));

        Self {
            clock,
            config,
            catalog,
            admin,
            registry,
            answers,
            results,
        }
    }

    /// Build services backed by `SQLite` storage.
    ///
    /// # Errors
    ///
    /// Returns `LiveServicesInitError` if the database cannot be opened or migrated.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        config: LiveConfig,
    ) -> Result<Self, LiveServicesInitError> {
        let storage = Storage::sqlite(db_url).await?;
        Ok(Self::new(&storage, clock, config))
    }

    #[must_use]
    pub fn in_memory(clock: Clock, config: LiveConfig) -> Self {
        Self::new(&Storage::in_memory(), clock, config)
    }

    #[must_use]
    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    #[must_use]
    pub fn catalog(&self) -> Arc<CatalogService> {
        Arc::clone(&self.catalog)
    }

    #[must_use]
    pub fn admin(&self) -> Arc<SessionAdminService> {
        Arc::clone(&self.admin)
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ParticipantRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn answers(&self) -> Arc<AnswerSubmissionService> {
        Arc::clone(&self.answers)
    }

    #[must_use]
    pub fn results(&self) -> Arc<ResultsService> {
        Arc::clone(&self.results)
    }

    /// An in-process polling client over the catalog.
    #[must_use]
    pub fn sync_client(&self, filter: SessionFilter) -> SyncClient<CatalogService> {
        SyncClient::new(
            self.catalog.as_ref().clone(),
            self.clock,
            self.config.lifecycle,
            self.config.sync,
            filter,
        )
    }
}
