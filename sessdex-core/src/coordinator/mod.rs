//! Index coordination
//!
//! [`IndexService`] is the handle applications hold. It owns a coordinator
//! task (see [`actor`]) that runs catalog passes, schedules parses on the
//! blocking pool and commits results to the [`CacheStore`] in batches.
//!
//! ```rust,no_run
//! use sessdex_core::{Config, IndexService, Scope};
//!
//! # async fn run() -> sessdex_core::Result<()> {
//! let config = Config::load()?;
//! let service = IndexService::start(&config)?;
//! let summary = service.refresh(Scope::All).await?;
//! println!("{} sessions written", summary.records_written);
//! let totals = service.query(&Scope::project("alpha"))?;
//! println!("{} tokens", totals.tokens.total);
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod actor;
mod events;
mod plan;

pub use events::SubscriptionId;

use crate::config::Config;
use crate::db::CacheStore;
use crate::error::{Error, Result};
use crate::types::{AggregateSnapshot, ChangeEvent, ExternalField, IndexState, RefreshSummary, Scope};
use crate::watch::PathWatcher;
use actor::{IndexCoordinator, SharedStates};
use events::Subscribers;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Where a finished refresh reports its summary.
pub(crate) enum Reply {
    Async(oneshot::Sender<RefreshSummary>),
    Blocking(std::sync::mpsc::Sender<RefreshSummary>),
}

impl Reply {
    fn send(self, summary: RefreshSummary) {
        // The caller may have stopped waiting
        match self {
            Reply::Async(tx) => {
                let _ = tx.send(summary);
            }
            Reply::Blocking(tx) => {
                let _ = tx.send(summary);
            }
        }
    }
}

pub(crate) enum Command {
    Refresh {
        scope: Scope,
        reply: Option<Reply>,
    },
    PathsChanged(Vec<PathBuf>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running index.
pub struct IndexService {
    commands: mpsc::UnboundedSender<Command>,
    store: Arc<CacheStore>,
    events: Arc<Subscribers>,
    states: SharedStates,
    roots: Vec<PathBuf>,
    debounce: Duration,
    watcher: Mutex<Option<PathWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IndexService {
    /// Validate `config`, open its store and start the coordinator.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(config: &Config) -> Result<Self> {
        config.validate()?;
        let store = CacheStore::open(&config.store_path())?;
        Self::start_with_store(config, Arc::new(store))
    }

    /// Start the coordinator on an already open store.
    pub fn start_with_store(config: &Config, store: Arc<CacheStore>) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Config("the index must be started inside a tokio runtime".into()))?;

        let fingerprints = store.load_fingerprints()?;
        tracing::debug!(rows = fingerprints.len(), "Loaded cached fingerprints");

        let events = Arc::new(Subscribers::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator =
            IndexCoordinator::new(config, Arc::clone(&store), Arc::clone(&events), rx, fingerprints);
        let states = coordinator.shared_states();
        let task = runtime.spawn(coordinator.run());

        Ok(Self {
            commands: tx,
            store,
            events,
            states,
            roots: config
                .enabled_roots()
                .iter()
                .map(|r| r.resolved_path())
                .collect(),
            debounce: Duration::from_millis(config.index.debounce_ms),
            watcher: Mutex::new(None),
            task: Mutex::new(Some(task)),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ServiceStopped)
    }

    /// Register a change callback. It runs on the coordinator task, so it
    /// must not block.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.events.add(Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.remove(id)
    }

    /// Queue a refresh and return immediately. Completion is reported with
    /// [`ChangeEvent::RefreshCompleted`].
    pub fn request_refresh(&self, scope: Scope) -> Result<()> {
        self.send(Command::Refresh { scope, reply: None })
    }

    /// Refresh `scope` and wait for it to finish.
    ///
    /// A refresh that is superseded by a newer one for the same scope
    /// returns early with [`RefreshSummary::superseded`] set.
    pub async fn refresh(&self, scope: Scope) -> Result<RefreshSummary> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Refresh {
            scope,
            reply: Some(Reply::Async(tx)),
        })?;
        rx.await.map_err(|_| Error::ServiceStopped)
    }

    /// Refresh `scope` from synchronous code. Must not be called from a
    /// runtime worker thread.
    pub fn refresh_blocking(&self, scope: Scope, timeout: Duration) -> Result<RefreshSummary> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.send(Command::Refresh {
            scope,
            reply: Some(Reply::Blocking(tx)),
        })?;
        match rx.recv_timeout(timeout) {
            Ok(summary) => Ok(summary),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Err(Error::Timeout(timeout)),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(Error::ServiceStopped),
        }
    }

    /// Re-examine specific paths, e.g. ones reported by an external watcher.
    pub fn notify_paths_changed(&self, paths: Vec<PathBuf>) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        self.send(Command::PathsChanged(paths))
    }

    /// Start watching all roots. Idempotent.
    pub fn watch(&self) -> Result<()> {
        let mut watcher = self.watcher.lock().unwrap();
        if watcher.is_some() {
            return Ok(());
        }
        let commands = self.commands.clone();
        *watcher = Some(PathWatcher::start(&self.roots, self.debounce, move |paths| {
            let _ = commands.send(Command::PathsChanged(paths));
        })?);
        Ok(())
    }

    pub fn stop_watching(&self) {
        if self.watcher.lock().unwrap().take().is_some() {
            tracing::info!("Stopped watching");
        }
    }

    /// Aggregate totals over the current contents of the store.
    pub fn query(&self, scope: &Scope) -> Result<AggregateSnapshot> {
        self.store.query(scope)
    }

    /// Set a user-owned field on a session and notify subscribers.
    pub fn set_external_field(&self, session_id: &str, field: ExternalField) -> Result<()> {
        self.store.set_external_field(session_id, &field)?;
        let parse_error = self
            .store
            .get_session(session_id)?
            .and_then(|record| record.parse_error);
        self.events.emit(ChangeEvent::Updated {
            session_id: session_id.to_string(),
            parse_error,
        });
        Ok(())
    }

    pub fn root_states(&self) -> Vec<(PathBuf, IndexState)> {
        self.states.lock().unwrap().clone()
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Stop watching, drop queued parses, wait for running work and commit
    /// what is already parsed.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_watching();

        let (tx, rx) = oneshot::channel();
        if self.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }

        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Coordinator task ended abnormally");
            }
        }
        Ok(())
    }
}
