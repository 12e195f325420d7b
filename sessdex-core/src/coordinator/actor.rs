//! The coordinator task
//!
//! A single tokio task owns all mutable indexing state: the fingerprint
//! cache, per-scope generations, per-root states and the parse queues.
//! Catalog passes, parses and store commits run on the blocking pool through
//! a `JoinSet`; their results come back to this task and nowhere else.
//!
//! ## Ordering
//!
//! Every fingerprint observed for a path gets a sequence number. A parse
//! result is dropped when a different fingerprint for the same path was
//! observed after the parse was dispatched, so an older file state can never
//! overwrite a newer one.
//!
//! ## Cancellation
//!
//! A refresh for a scope bumps that scope's generation. Queued parses of the
//! older generation are dropped; parses already running finish and their
//! results are discarded.

use super::events::Subscribers;
use super::plan::{CatalogOutput, CatalogPlan};
use super::{Command, Reply};
use crate::catalog::{CatalogRoot, FileCatalog};
use crate::config::{Config, IndexConfig};
use crate::db::{CacheStore, WriteKind, WriteOutcome};
use crate::detect::ChangeDetector;
use crate::error::{Error, ParseError, Result};
use crate::ingest::RecordParser;
use crate::types::{
    CachedFingerprint, ChangeEvent, FileStat, Fingerprint, IndexState, RefreshSummary, Scope,
    SessionRecord,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

/// Root states readable from outside the coordinator task.
pub(crate) type SharedStates = Arc<Mutex<Vec<(PathBuf, IndexState)>>>;

struct RootSlot {
    path: PathBuf,
    parser: RecordParser,
    heavy: bool,
    state: IndexState,
    cataloging: usize,
    /// Queued plus running parses
    parsing: usize,
    committing: bool,
}

struct Request {
    /// `None` for watcher-driven path refreshes, which are never superseded
    scope: Option<Scope>,
    generation: u64,
    summary: RefreshSummary,
    /// Catalog passes, parse jobs and pending writes not yet resolved
    outstanding: usize,
    replies: Vec<Reply>,
    reported: bool,
}

struct ParseJob {
    request: u64,
    root: usize,
    stat: FileStat,
    session_id: String,
}

enum Write {
    Upsert(SessionRecord),
    Delete { session_id: String, path: PathBuf },
}

struct Pending {
    request: u64,
    root: usize,
    write: Write,
    /// Observation sequence when this write was produced
    observed_at: u64,
}

enum TaskOutput {
    Cataloged {
        request: u64,
        root: usize,
        result: Result<CatalogOutput>,
    },
    Parsed {
        job: ParseJob,
        dispatched_at: u64,
        result: std::result::Result<SessionRecord, ParseError>,
    },
    Committed {
        batch: Vec<Pending>,
        result: Result<Vec<WriteOutcome>>,
    },
}

struct Retry {
    at: Instant,
    scopes: Vec<Scope>,
    /// Files of failed path refreshes, re-stated rather than widened to a scope
    paths: Vec<PathBuf>,
}

pub(crate) struct IndexCoordinator {
    config: IndexConfig,
    store: Arc<CacheStore>,
    catalog: Arc<FileCatalog>,
    detector: ChangeDetector,
    roots: Vec<RootSlot>,
    states: SharedStates,
    events: Arc<Subscribers>,
    commands: mpsc::UnboundedReceiver<Command>,

    cache: HashMap<PathBuf, CachedFingerprint>,
    ids: HashMap<String, PathBuf>,
    observed: HashMap<PathBuf, (Fingerprint, u64)>,
    seq: u64,

    generations: HashMap<Scope, u64>,
    requests: HashMap<u64, Request>,
    next_request: u64,

    queue: VecDeque<ParseJob>,
    queue_heavy: VecDeque<ParseJob>,
    /// Path -> (fingerprint, request) of the queued or running parse
    parsing_paths: HashMap<PathBuf, (Fingerprint, u64)>,
    in_flight: usize,
    in_flight_heavy: usize,

    pending: Vec<Pending>,
    committing: bool,
    retry: Option<Retry>,
    backoff: Option<Duration>,

    tasks: JoinSet<TaskOutput>,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl IndexCoordinator {
    pub(crate) fn new(
        config: &Config,
        store: Arc<CacheStore>,
        events: Arc<Subscribers>,
        commands: mpsc::UnboundedReceiver<Command>,
        fingerprints: Vec<CachedFingerprint>,
    ) -> Self {
        let roots: Vec<RootSlot> = config
            .enabled_roots()
            .into_iter()
            .map(|root| RootSlot {
                path: root.resolved_path(),
                heavy: config.index.is_heavy(root.source),
                parser: RecordParser::new(root, config.parse.clone()),
                state: IndexState::Idle,
                cataloging: 0,
                parsing: 0,
                committing: false,
            })
            .collect();

        let catalog = FileCatalog::new(
            roots
                .iter()
                .map(|slot| CatalogRoot {
                    path: slot.path.clone(),
                    patterns: slot
                        .parser
                        .session_parser()
                        .source_patterns()
                        .into_iter()
                        .map(|p| p.pattern)
                        .collect(),
                })
                .collect(),
        );

        let states = Arc::new(Mutex::new(
            roots
                .iter()
                .map(|slot| (slot.path.clone(), IndexState::Idle))
                .collect(),
        ));

        let ids = fingerprints
            .iter()
            .map(|f| (f.session_id.clone(), f.path.clone()))
            .collect();
        let cache = fingerprints
            .into_iter()
            .map(|f| (f.path.clone(), f))
            .collect();

        Self {
            config: config.index.clone(),
            store,
            catalog: Arc::new(catalog),
            detector: ChangeDetector::new(),
            roots,
            states,
            events,
            commands,
            cache,
            ids,
            observed: HashMap::new(),
            seq: 0,
            generations: HashMap::new(),
            requests: HashMap::new(),
            next_request: 1,
            queue: VecDeque::new(),
            queue_heavy: VecDeque::new(),
            parsing_paths: HashMap::new(),
            in_flight: 0,
            in_flight_heavy: 0,
            pending: Vec::new(),
            committing: false,
            retry: None,
            backoff: None,
            tasks: JoinSet::new(),
            shutting_down: false,
            shutdown_waiters: Vec::new(),
        }
    }

    pub(crate) fn shared_states(&self) -> SharedStates {
        Arc::clone(&self.states)
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(
            roots = self.roots.len(),
            cached = self.cache.len(),
            workers = self.config.worker_count(),
            "Coordinator started"
        );

        loop {
            let retry_at = self.retry.as_ref().map(|r| r.at);

            tokio::select! {
                command = self.commands.recv(), if !self.shutting_down => match command {
                    Some(command) => self.handle_command(command),
                    None => self.begin_shutdown(),
                },
                Some(joined) = self.tasks.join_next() => self.handle_joined(joined),
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                    if retry_at.is_some() && !self.shutting_down => self.fire_retry(),
                else => break,
            }

            self.pump();

            if self.shutting_down && self.tasks.is_empty() && self.pending.is_empty() {
                break;
            }
        }

        let remaining: Vec<u64> = self.requests.keys().copied().collect();
        for id in remaining {
            self.report(id);
        }
        self.requests.clear();

        tracing::info!("Coordinator stopped");
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Refresh { scope, reply } => self.start_refresh(scope, reply),
            Command::PathsChanged(paths) => self.start_path_refresh(paths),
            Command::Shutdown(done) => {
                self.shutdown_waiters.push(done);
                self.begin_shutdown();
            }
        }
    }

    fn handle_joined(&mut self, joined: std::result::Result<TaskOutput, JoinError>) {
        match joined {
            Ok(TaskOutput::Cataloged {
                request,
                root,
                result,
            }) => self.on_cataloged(request, root, result),
            Ok(TaskOutput::Parsed {
                job,
                dispatched_at,
                result,
            }) => self.on_parsed(job, dispatched_at, result),
            Ok(TaskOutput::Committed { batch, result }) => self.on_committed(batch, result),
            Err(e) => tracing::error!(error = %e, "Coordinator task failed"),
        }
    }

    // ============================================
    // Requests
    // ============================================

    fn start_refresh(&mut self, scope: Scope, reply: Option<Reply>) {
        let generation = {
            let counter = self.generations.entry(scope.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let older: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, r)| r.scope.as_ref() == Some(&scope) && !r.reported)
            .map(|(id, _)| *id)
            .collect();
        for id in older {
            self.supersede(id);
        }

        let id = self.add_request(Some(scope.clone()), generation, reply);
        tracing::info!(request = id, scope = %scope, generation, "Refresh requested");

        for idx in 0..self.roots.len() {
            let root_path = self.roots[idx].path.clone();
            let plan = CatalogPlan::for_scope(
                idx,
                root_path.clone(),
                &scope,
                self.cache.values().filter(|c| c.path.starts_with(&root_path)),
            );
            self.spawn_catalog(id, plan);
        }
    }

    fn start_path_refresh(&mut self, paths: Vec<PathBuf>) {
        if self.shutting_down {
            return;
        }

        let mut seen = HashSet::new();
        let mut by_root: BTreeMap<usize, Vec<PathBuf>> = BTreeMap::new();
        for path in paths {
            if !seen.insert(path.clone()) {
                continue;
            }
            let owner = self
                .roots
                .iter()
                .position(|slot| slot.parser.session_parser().owns_path(&slot.path, &path));
            if let Some(idx) = owner {
                by_root.entry(idx).or_default().push(path);
            }
        }
        if by_root.is_empty() {
            return;
        }

        let id = self.add_request(None, 0, None);
        tracing::debug!(
            request = id,
            paths = by_root.values().map(Vec::len).sum::<usize>(),
            "Path refresh"
        );
        for (idx, paths) in by_root {
            let cached: HashSet<PathBuf> = paths
                .iter()
                .filter(|p| self.cache.contains_key(*p))
                .cloned()
                .collect();
            let plan = CatalogPlan::for_paths(idx, self.roots[idx].path.clone(), paths, &cached);
            self.spawn_catalog(id, plan);
        }
    }

    fn add_request(&mut self, scope: Option<Scope>, generation: u64, reply: Option<Reply>) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        self.requests.insert(
            id,
            Request {
                scope,
                generation,
                summary: RefreshSummary::default(),
                outstanding: 0,
                replies: reply.into_iter().collect(),
                reported: false,
            },
        );
        id
    }

    fn is_live(&self, id: u64) -> bool {
        self.requests.get(&id).is_some_and(|r| match &r.scope {
            None => true,
            Some(scope) => self.generations.get(scope) == Some(&r.generation),
        })
    }

    fn summary_mut(&mut self, id: u64) -> Option<&mut RefreshSummary> {
        self.requests.get_mut(&id).map(|r| &mut r.summary)
    }

    fn hold(&mut self, id: u64, n: usize) {
        if let Some(r) = self.requests.get_mut(&id) {
            r.outstanding += n;
        }
    }

    fn release(&mut self, id: u64, n: usize) {
        if let Some(r) = self.requests.get_mut(&id) {
            r.outstanding = r.outstanding.saturating_sub(n);
        }
    }

    fn supersede(&mut self, id: u64) {
        if let Some(summary) = self.summary_mut(id) {
            summary.superseded = true;
        }

        let mut dropped = Vec::new();
        for queue in [&mut self.queue, &mut self.queue_heavy] {
            let (mine, rest): (VecDeque<ParseJob>, VecDeque<ParseJob>) =
                queue.drain(..).partition(|job| job.request == id);
            *queue = rest;
            dropped.extend(mine);
        }
        tracing::debug!(request = id, dropped = dropped.len(), "Request superseded");
        for job in dropped {
            self.drop_job(job);
        }

        self.report(id);
    }

    /// Deliver the summary once: replies, completion event, log line.
    fn report(&mut self, id: u64) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        if request.reported {
            return;
        }
        request.reported = true;

        let summary = request.summary.clone();
        for reply in request.replies.drain(..) {
            reply.send(summary.clone());
        }

        let Some(scope) = request.scope.clone() else {
            tracing::debug!(
                request = id,
                parsed = summary.parsed,
                written = summary.records_written,
                "Path refresh finished"
            );
            return;
        };

        tracing::info!(
            request = id,
            scope = %scope,
            scanned = summary.scanned,
            new = summary.new,
            modified = summary.modified,
            unchanged = summary.unchanged,
            deleted = summary.deleted,
            parsed = summary.parsed,
            parse_failures = summary.parse_failures,
            written = summary.records_written,
            superseded = summary.superseded,
            "Refresh finished"
        );
        self.events
            .emit(ChangeEvent::RefreshCompleted { scope, summary });
    }

    fn complete_requests(&mut self) {
        let done: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, r)| r.outstanding == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in done {
            self.report(id);
            self.requests.remove(&id);
        }
    }

    // ============================================
    // Catalog and classification
    // ============================================

    fn spawn_catalog(&mut self, request: u64, plan: CatalogPlan) {
        let root = plan.root();
        self.roots[root].cataloging += 1;
        self.hold(request, 1);

        let catalog = Arc::clone(&self.catalog);
        let parser = self.roots[root].parser.clone();
        self.tasks.spawn_blocking(move || TaskOutput::Cataloged {
            request,
            root,
            result: plan.run(&catalog, parser.session_parser()),
        });
    }

    fn on_cataloged(&mut self, request: u64, root: usize, result: Result<CatalogOutput>) {
        self.roots[root].cataloging -= 1;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(
                    root = %self.roots[root].path.display(),
                    error = %e,
                    "Catalog pass failed"
                );
                self.transition(root, IndexState::Error);
                self.release(request, 1);
                return;
            }
        };

        if self.shutting_down || !self.is_live(request) {
            self.release(request, 1);
            return;
        }

        self.transition(root, IndexState::Classifying);

        for entry in &output.entries {
            self.observe(&entry.path, entry.fingerprint);
        }

        let responsible: HashMap<PathBuf, CachedFingerprint> = output
            .responsible
            .iter()
            .chain(output.entries.iter().map(|e| &e.path))
            .filter_map(|path| self.cache.get(path).map(|row| (path.clone(), row.clone())))
            .collect();

        let scanned = output.entries.len();
        let classification = self.detector.classify(output.entries, &responsible);

        if let Some(summary) = self.summary_mut(request) {
            summary.scanned += scanned;
            summary.skipped_entries += output.skipped;
            summary.new += classification.new.len();
            summary.modified += classification.modified.len();
            summary.unchanged += classification.unchanged.len();
            summary.deleted += classification.deleted.len();
        }

        let deleted_paths: HashSet<PathBuf> =
            classification.deleted.iter().map(|d| d.path.clone()).collect();
        for row in classification.deleted {
            self.push_pending(
                request,
                root,
                Write::Delete {
                    session_id: row.session_id,
                    path: row.path,
                },
            );
        }

        let mut ids_in_pass = HashSet::new();
        let work = classification
            .new
            .into_iter()
            .map(|stat| (stat, true))
            .chain(classification.modified.into_iter().map(|stat| (stat, false)));
        for (stat, is_new) in work {
            let Some(session_id) = self.roots[root].parser.session_id(&stat.path) else {
                tracing::warn!(path = %stat.path.display(), "No session id for path, skipping");
                self.count_skipped(request);
                continue;
            };

            let claimed_elsewhere = self
                .ids
                .get(&session_id)
                .is_some_and(|p| *p != stat.path && !deleted_paths.contains(p));
            if !ids_in_pass.insert(session_id.clone()) || claimed_elsewhere {
                tracing::warn!(
                    path = %stat.path.display(),
                    session_id = %session_id,
                    "Session id already belongs to another file, skipping"
                );
                self.count_skipped(request);
                continue;
            }

            if is_new && self.config.insert_stubs {
                let stub = self.stub_record(root, &session_id, &stat);
                self.push_pending(request, root, Write::Upsert(stub));
            }
            self.enqueue(ParseJob {
                request,
                root,
                stat,
                session_id,
            });
        }

        self.release(request, 1);
    }

    fn count_skipped(&mut self, request: u64) {
        if let Some(summary) = self.summary_mut(request) {
            summary.skipped_entries += 1;
        }
    }

    fn observe(&mut self, path: &Path, fingerprint: Fingerprint) {
        match self.observed.get(path) {
            Some((seen, _)) if *seen == fingerprint => {}
            _ => {
                self.seq += 1;
                self.observed
                    .insert(path.to_path_buf(), (fingerprint, self.seq));
            }
        }
    }

    /// A different fingerprint for the path was seen after `since`.
    fn superseded_by_observation(&self, path: &Path, fingerprint: &Fingerprint, since: u64) -> bool {
        self.observed
            .get(path)
            .is_some_and(|(seen, seq)| *seq > since && seen != fingerprint)
    }

    fn stub_record(&self, root: usize, session_id: &str, stat: &FileStat) -> SessionRecord {
        let slot = &self.roots[root];
        let mut record = SessionRecord::placeholder(
            session_id,
            slot.parser.source(),
            stat.path.clone(),
            stat.fingerprint,
        );
        record.remote_host = slot.parser.root().remote_host.clone();
        record.project = slot.parser.session_parser().project_hint(&stat.path);
        record
    }

    // ============================================
    // Parsing
    // ============================================

    fn enqueue(&mut self, job: ParseJob) {
        if let Some((fingerprint, owner)) = self.parsing_paths.get(&job.stat.path) {
            if *fingerprint == job.stat.fingerprint && self.is_live(*owner) {
                tracing::trace!(path = %job.stat.path.display(), "Parse already pending");
                return;
            }
        }

        self.parsing_paths
            .insert(job.stat.path.clone(), (job.stat.fingerprint, job.request));
        self.roots[job.root].parsing += 1;
        self.hold(job.request, 1);
        if self.roots[job.root].heavy {
            self.queue_heavy.push_back(job);
        } else {
            self.queue.push_back(job);
        }
    }

    fn drop_job(&mut self, job: ParseJob) {
        self.roots[job.root].parsing -= 1;
        self.clear_parsing_path(&job);
        self.release(job.request, 1);
    }

    fn clear_parsing_path(&mut self, job: &ParseJob) {
        if self
            .parsing_paths
            .get(&job.stat.path)
            .is_some_and(|(_, owner)| *owner == job.request)
        {
            self.parsing_paths.remove(&job.stat.path);
        }
    }

    fn dispatch(&mut self) {
        if self.shutting_down {
            return;
        }
        let workers = self.config.worker_count();
        let heavy_limit = self.config.heavy_source_workers.max(1);

        while self.in_flight < workers {
            let job = if self.in_flight_heavy < heavy_limit {
                self.queue_heavy
                    .pop_front()
                    .or_else(|| self.queue.pop_front())
            } else {
                self.queue.pop_front()
            };
            let Some(job) = job else {
                break;
            };

            // Generation check before dispatch
            if !self.is_live(job.request) {
                self.drop_job(job);
                continue;
            }
            self.spawn_parse(job);
        }
    }

    fn spawn_parse(&mut self, job: ParseJob) {
        if self.roots[job.root].heavy {
            self.in_flight_heavy += 1;
        }
        self.in_flight += 1;

        let parser = self.roots[job.root].parser.clone();
        let dispatched_at = self.seq;
        self.tasks.spawn_blocking(move || {
            let path = job.stat.path.clone();
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| parser.parse(&path)))
                .unwrap_or_else(|_| Err(ParseError::new(path.clone(), "parser panicked")));
            TaskOutput::Parsed {
                job,
                dispatched_at,
                result,
            }
        });
    }

    fn on_parsed(
        &mut self,
        job: ParseJob,
        dispatched_at: u64,
        result: std::result::Result<SessionRecord, ParseError>,
    ) {
        if self.roots[job.root].heavy {
            self.in_flight_heavy -= 1;
        }
        self.in_flight -= 1;
        self.roots[job.root].parsing -= 1;
        self.clear_parsing_path(&job);

        if !self.is_live(job.request) {
            if let Some(summary) = self.summary_mut(job.request) {
                summary.discarded += 1;
            }
            self.release(job.request, 1);
            return;
        }

        let record = match result {
            Ok(record) => {
                tracing::debug!(
                    path = %job.stat.path.display(),
                    session_id = %record.session_id,
                    messages = record.messages.total(),
                    tokens = record.tokens.total,
                    "Parsed session"
                );
                record
            }
            Err(err) => {
                tracing::warn!(path = %err.path.display(), error = %err.cause, "Parse failed");
                if let Some(summary) = self.summary_mut(job.request) {
                    summary.parse_failures += 1;
                }
                self.failed_record(&job, err)
            }
        };

        if let Some(summary) = self.summary_mut(job.request) {
            summary.parsed += 1;
            summary.parsed_paths.push(job.stat.path.clone());
        }

        if self.is_stale(&record, dispatched_at) {
            tracing::debug!(path = %job.stat.path.display(), "Discarding stale parse result");
            if let Some(summary) = self.summary_mut(job.request) {
                summary.discarded += 1;
            }
            self.release(job.request, 1);
            return;
        }

        self.observe(&record.source_path, record.fingerprint);
        // The job's hold moves to the pending write
        self.pending.push(Pending {
            request: job.request,
            root: job.root,
            write: Write::Upsert(record),
            observed_at: self.seq,
        });
    }

    fn is_stale(&self, record: &SessionRecord, dispatched_at: u64) -> bool {
        if self.superseded_by_observation(&record.source_path, &record.fingerprint, dispatched_at) {
            return true;
        }
        // Already committed at this exact state
        record.parse_error.is_none()
            && self.cache.get(&record.source_path).is_some_and(|row| {
                row.fingerprint == record.fingerprint
                    && row.complete
                    && !row.has_error
                    && row.schema_version >= record.schema_version
            })
    }

    fn failed_record(&self, job: &ParseJob, err: ParseError) -> SessionRecord {
        let mut record = self.stub_record(job.root, &job.session_id, &job.stat);
        record.parse_error = Some(err.cause);
        record
    }

    // ============================================
    // Commit
    // ============================================

    fn push_pending(&mut self, request: u64, root: usize, write: Write) {
        self.hold(request, 1);
        self.pending.push(Pending {
            request,
            root,
            write,
            observed_at: self.seq,
        });
    }

    fn pending_is_stale(&self, item: &Pending) -> bool {
        match &item.write {
            Write::Upsert(record) => self.superseded_by_observation(
                &record.source_path,
                &record.fingerprint,
                item.observed_at,
            ),
            // The file came back after it was classified deleted
            Write::Delete { path, .. } => self
                .observed
                .get(path)
                .is_some_and(|(_, seq)| *seq > item.observed_at),
        }
    }

    fn maybe_commit(&mut self) {
        if self.committing || (self.retry.is_some() && !self.shutting_down) {
            return;
        }

        let mut batch = Vec::new();
        while batch.is_empty() && !self.pending.is_empty() {
            let take = self.pending.len().min(self.config.batch_size.max(1));
            let candidates: Vec<Pending> = self.pending.drain(..take).collect();
            for item in candidates {
                // Generation check before commit
                if !self.is_live(item.request) || self.pending_is_stale(&item) {
                    if let Some(summary) = self.summary_mut(item.request) {
                        summary.discarded += 1;
                    }
                    self.release(item.request, 1);
                    continue;
                }
                batch.push(item);
            }
        }
        if batch.is_empty() {
            return;
        }

        let mut records = Vec::new();
        let mut deletes = Vec::new();
        for item in &batch {
            match &item.write {
                Write::Upsert(record) => records.push(record.clone()),
                Write::Delete { session_id, .. } => deletes.push(session_id.clone()),
            }
            self.roots[item.root].committing = true;
        }
        self.committing = true;

        let store = Arc::clone(&self.store);
        self.tasks.spawn_blocking(move || TaskOutput::Committed {
            result: store.apply_batch(&records, &deletes),
            batch,
        });
    }

    fn on_committed(&mut self, batch: Vec<Pending>, result: Result<Vec<WriteOutcome>>) {
        self.committing = false;
        for item in &batch {
            self.roots[item.root].committing = false;
        }

        match result {
            Ok(outcomes) => self.apply_outcomes(batch, outcomes),
            Err(e) => self.commit_failed(batch, e),
        }
    }

    fn apply_outcomes(&mut self, batch: Vec<Pending>, outcomes: Vec<WriteOutcome>) {
        self.backoff = None;

        // Deletions come first, one outcome per removed row; then one
        // outcome per upserted record, in order
        let upserts = batch
            .iter()
            .filter(|p| matches!(p.write, Write::Upsert(_)))
            .count();
        let split = outcomes.len().saturating_sub(upserts);
        let (delete_outcomes, upsert_outcomes) = outcomes.split_at(split);
        let removed: HashSet<&str> = delete_outcomes
            .iter()
            .filter(|o| o.kind == WriteKind::Deleted)
            .map(|o| o.session_id.as_str())
            .collect();
        let mut upsert_kinds = upsert_outcomes.iter().map(|o| o.kind);

        let mut affected: Vec<Scope> = Vec::new();
        let mut touch = |scope: Scope| {
            if !affected.contains(&scope) {
                affected.push(scope);
            }
        };

        for item in batch {
            let request_scope = self
                .requests
                .get(&item.request)
                .and_then(|r| r.scope.clone());

            match item.write {
                Write::Upsert(record) => {
                    let kind = upsert_kinds.next().unwrap_or(WriteKind::Unchanged);
                    match kind {
                        WriteKind::Inserted | WriteKind::Updated => {
                            let previous = self.remember(&record);
                            for project in [previous, record.project.clone()].into_iter().flatten() {
                                touch(Scope::project(project));
                            }
                            touch(Scope::All);
                            if let Some(scope) = request_scope {
                                touch(scope);
                            }
                            if let Some(summary) = self.summary_mut(item.request) {
                                summary.records_written += 1;
                            }

                            let session_id = record.session_id;
                            let parse_error = record.parse_error;
                            self.events.emit(if kind == WriteKind::Inserted {
                                ChangeEvent::Inserted {
                                    session_id,
                                    parse_error,
                                }
                            } else {
                                ChangeEvent::Updated {
                                    session_id,
                                    parse_error,
                                }
                            });
                        }
                        // A stub that found a row already there says nothing new
                        _ if record.complete || record.parse_error.is_some() => {
                            self.remember(&record);
                        }
                        _ => {}
                    }
                }
                Write::Delete { session_id, path } => {
                    let previous = self.forget(&path);
                    if removed.contains(session_id.as_str()) {
                        if let Some(project) = previous.and_then(|p| p.project) {
                            touch(Scope::project(project));
                        }
                        touch(Scope::All);
                        if let Some(scope) = request_scope {
                            touch(scope);
                        }
                        self.events.emit(ChangeEvent::Deleted { session_id });
                    }
                }
            }
            self.release(item.request, 1);
        }

        for scope in affected {
            self.events.emit(ChangeEvent::AggregateUpdated { scope });
        }
    }

    fn commit_failed(&mut self, batch: Vec<Pending>, error: Error) {
        let retry_in = self.next_backoff();
        tracing::error!(
            error = %error,
            records = batch.len(),
            retry_in_ms = retry_in.as_millis() as u64,
            "Store write failed, batch dropped"
        );

        let mut scopes: Vec<Scope> = Vec::new();
        let mut paths: Vec<PathBuf> = Vec::new();
        let mut roots: Vec<usize> = Vec::new();
        for item in &batch {
            match self.requests.get(&item.request).and_then(|r| r.scope.clone()) {
                Some(scope) => {
                    if !scopes.contains(&scope) {
                        scopes.push(scope);
                    }
                }
                None => {
                    let path = match &item.write {
                        Write::Upsert(record) => &record.source_path,
                        Write::Delete { path, .. } => path,
                    };
                    if !paths.contains(path) {
                        paths.push(path.clone());
                    }
                }
            }
            if !roots.contains(&item.root) {
                roots.push(item.root);
            }
        }
        for item in batch {
            if let Some(summary) = self.summary_mut(item.request) {
                summary.store_failed = true;
            }
            self.release(item.request, 1);
        }

        for root in roots {
            self.transition(root, IndexState::Error);
        }
        // Watcher refreshes have no scope of their own
        let path_scope = (!paths.is_empty()).then_some(Scope::All);
        for scope in scopes.iter().chain(path_scope.iter()) {
            self.events.emit(ChangeEvent::StoreFailed {
                scope: scope.clone(),
                message: error.to_string(),
                retry_in,
            });
        }

        if self.shutting_down {
            return;
        }
        let at = Instant::now() + retry_in;
        match &mut self.retry {
            Some(retry) => {
                retry.at = at;
                for scope in scopes {
                    if !retry.scopes.contains(&scope) {
                        retry.scopes.push(scope);
                    }
                }
                for path in paths {
                    if !retry.paths.contains(&path) {
                        retry.paths.push(path);
                    }
                }
            }
            None => self.retry = Some(Retry { at, scopes, paths }),
        }
    }

    fn next_backoff(&mut self) -> Duration {
        let initial = Duration::from_millis(self.config.store_retry_initial_ms.max(1));
        let max = Duration::from_millis(self.config.store_retry_max_ms).max(initial);
        let next = match self.backoff {
            None => initial,
            Some(previous) => previous.saturating_mul(2).min(max),
        };
        self.backoff = Some(next);
        next
    }

    fn fire_retry(&mut self) {
        let Some(retry) = self.retry.take() else {
            return;
        };
        tracing::info!(
            scopes = retry.scopes.len(),
            paths = retry.paths.len(),
            "Retrying after store failure"
        );
        for scope in retry.scopes {
            self.start_refresh(scope, None);
        }
        if !retry.paths.is_empty() {
            self.start_path_refresh(retry.paths);
        }
    }

    /// Update the cache from a written record. Returns the previous project.
    fn remember(&mut self, record: &SessionRecord) -> Option<String> {
        let previous = self.cache.get(&record.source_path).cloned();

        // A failed parse keeps the row's earlier content
        let (project, created_at, updated_at) = match &previous {
            Some(prev) if record.parse_error.is_some() => {
                (prev.project.clone(), prev.created_at, prev.updated_at)
            }
            _ => (record.project.clone(), record.created_at, record.updated_at),
        };

        if let Some(prev) = &previous {
            if prev.session_id != record.session_id {
                self.ids.remove(&prev.session_id);
            }
        }
        if let Some(old_path) = self.ids.get(&record.session_id).cloned() {
            if old_path != record.source_path {
                self.cache.remove(&old_path);
            }
        }

        self.ids
            .insert(record.session_id.clone(), record.source_path.clone());
        self.cache.insert(
            record.source_path.clone(),
            CachedFingerprint {
                session_id: record.session_id.clone(),
                path: record.source_path.clone(),
                fingerprint: record.fingerprint,
                schema_version: record.schema_version,
                complete: record.complete || record.parse_error.is_some(),
                has_error: record.parse_error.is_some(),
                project,
                created_at,
                updated_at,
            },
        );

        previous.and_then(|p| p.project)
    }

    fn forget(&mut self, path: &Path) -> Option<CachedFingerprint> {
        self.observed.remove(path);
        let row = self.cache.remove(path)?;
        if self.ids.get(&row.session_id).is_some_and(|p| p == path) {
            self.ids.remove(&row.session_id);
        }
        Some(row)
    }

    // ============================================
    // Loop plumbing
    // ============================================

    fn pump(&mut self) {
        self.dispatch();
        self.maybe_commit();
        self.complete_requests();
        self.settle_states();
    }

    fn settle_states(&mut self) {
        for idx in 0..self.roots.len() {
            let slot = &self.roots[idx];
            let state = if slot.committing {
                IndexState::Committing
            } else if slot.parsing > 0 {
                IndexState::Parsing
            } else if slot.cataloging > 0 {
                IndexState::Cataloging
            } else {
                IndexState::Idle
            };
            self.transition(idx, state);
        }
    }

    fn transition(&mut self, idx: usize, state: IndexState) {
        let slot = &mut self.roots[idx];
        if slot.state == state {
            return;
        }
        tracing::debug!(
            root = %slot.path.display(),
            from = slot.state.as_str(),
            to = state.as_str(),
            "Root state changed"
        );
        slot.state = state;
        let root = slot.path.clone();

        if let Some(entry) = self.states.lock().unwrap().get_mut(idx) {
            entry.1 = state;
        }
        self.events.emit(ChangeEvent::RootState { root, state });
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        tracing::info!(
            queued = self.queue.len() + self.queue_heavy.len(),
            in_flight = self.in_flight,
            pending = self.pending.len(),
            "Coordinator shutting down"
        );
        self.shutting_down = true;
        self.retry = None;

        let queued: Vec<ParseJob> = self
            .queue
            .drain(..)
            .chain(self.queue_heavy.drain(..))
            .collect();
        for job in queued {
            self.drop_job(job);
        }
    }
}
