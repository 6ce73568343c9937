//! Database handle.
//!
//! # Responsibility
//! - Open a backend from a connection URL or configuration.
//! - Hand out versioned and plain collections bound to that backend, all
//!   sharing one revision sequence.

use crate::config::{DatabaseConfig, StoreUrl};
use crate::error::CoreResult;
use crate::model::audit::{ActorSource, StaticActor};
use crate::model::schema::CollectionSchema;
use crate::revision::{last_revision, Revision, RevisionSequencer};
use crate::service::crud_service::Collection;
use crate::service::versioned_service::VersionedCollection;
use crate::store::{AnyBackend, Backend, CatalogEntry, DocumentBackend, SqliteBackend};
use log::info;
use std::sync::Arc;

/// Per-collection options.
#[derive(Clone, Default)]
pub struct CollectionOptions {
    pub audit: bool,
    /// Overrides the database-wide actor for this collection's audit trail.
    pub actor: Option<Arc<dyn ActorSource>>,
}

impl CollectionOptions {
    pub fn audited() -> Self {
        Self {
            audit: true,
            actor: None,
        }
    }

    pub fn with_actor(mut self, actor: impl ActorSource + 'static) -> Self {
        self.actor = Some(Arc::new(actor));
        self
    }
}

/// Entry point owning one backend.
pub struct Database<B: Backend = AnyBackend> {
    backend: Arc<B>,
    actor: Arc<dyn ActorSource>,
}

impl Database<AnyBackend> {
    /// Opens the backend selected by `url`.
    pub fn open(url: &StoreUrl) -> CoreResult<Self> {
        let backend = match url {
            StoreUrl::SqliteMemory => AnyBackend::Sqlite(SqliteBackend::open_in_memory()?),
            StoreUrl::SqliteFile(path) => AnyBackend::Sqlite(SqliteBackend::open(path)?),
            StoreUrl::Document(name) => AnyBackend::Document(DocumentBackend::named(name)),
        };
        info!(
            "event=database_open module=database status=ok backend={} url={}",
            backend.kind(),
            url
        );
        Ok(Self::new(backend))
    }

    /// Parses `url` and opens it.
    pub fn connect(url: &str) -> CoreResult<Self> {
        Self::open(&url.parse()?)
    }

    /// Starts logging (when configured), opens the backend and applies the
    /// configured actor.
    pub fn from_config(config: &DatabaseConfig) -> CoreResult<Self> {
        config.init_logging()?;
        let database = Self::open(&config.store_url()?)?;
        Ok(match &config.actor {
            Some(actor) => database.with_actor(StaticActor(actor.clone())),
            None => database,
        })
    }
}

impl<B: Backend> Database<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            actor: Arc::new(StaticActor::default()),
        }
    }

    /// Sets the identity recorded in audit entries.
    pub fn with_actor(mut self, actor: impl ActorSource + 'static) -> Self {
        self.actor = Arc::new(actor);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Opens (registering on first use) a versioned collection.
    pub fn versioned(
        &self,
        schema: CollectionSchema,
        options: CollectionOptions,
    ) -> CoreResult<VersionedCollection<B>> {
        VersionedCollection::open(Arc::clone(&self.backend), schema, self.actor_for(options))
    }

    /// Opens (registering on first use) a plain collection.
    pub fn collection(
        &self,
        schema: CollectionSchema,
        options: CollectionOptions,
    ) -> CoreResult<Collection<B>> {
        Collection::open(Arc::clone(&self.backend), schema, self.actor_for(options))
    }

    /// Registered collections, by name.
    pub fn collections(&self) -> CoreResult<Vec<CatalogEntry>> {
        self.backend.catalog()
    }

    fn actor_for(&self, options: CollectionOptions) -> Option<Arc<dyn ActorSource>> {
        if !options.audit {
            return None;
        }
        Some(options.actor.unwrap_or_else(|| Arc::clone(&self.actor)))
    }
}

impl<B: Backend> RevisionSequencer for Database<B> {
    /// Mints a revision outside of any collection mutation.
    fn next_revision(&mut self) -> CoreResult<Revision> {
        self.backend.transaction(|tx| tx.next_revision())
    }

    fn current_revision(&self) -> CoreResult<Revision> {
        last_revision(self.backend.as_ref())
    }
}
