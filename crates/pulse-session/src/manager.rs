use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use pulse_core::encoder::{self, FlowMarker};
use pulse_core::{unix_now, AgentConfig, DeviceFacts};
use pulse_store::{EventStore, StoreError};
use pulse_uploader::{UploadOutcome, Uploader};

use crate::SessionError;

/// Session lengths at or above this are assumed to come from clock
/// tampering and are not reported.
const MAX_PLAUSIBLE_SESSION_SECS: i64 = 400_000;

/// Drives the session lifecycle over one [`EventStore`]. All state
/// transitions funnel through this type; the store only sees finished
/// record blobs.
///
/// The fallible public operations log and carry on rather than return
/// errors: a telemetry agent must never take the host application down
/// with it. [`SessionManager::upload`] is the exception, since its
/// caller usually wants to schedule retries off the outcome.
pub struct SessionManager {
    config: AgentConfig,
    store: Arc<EventStore>,
    uploader: Arc<Uploader>,
    install_id: String,
    app_version: String,
    facts: DeviceFacts,

    app_key: String,
    initialized: bool,
    is_open: bool,
    has_been_open: bool,
    session_uuid: String,
    session_number: i64,
    /// Unix seconds of the current session's start.
    session_start: i64,
    /// Unix seconds of the last open or resume.
    resume_time: i64,
    /// Set on close: wall-clock seconds for the record, monotonic mark
    /// for the background-timeout comparison.
    close_time: Option<(i64, Instant)>,
    /// Accumulated foreground seconds across resumes.
    active_duration: i64,
    unstaged_flow: Vec<FlowMarker>,
    staged_flow: Vec<FlowMarker>,
    screens: Vec<String>,
}

impl SessionManager {
    pub fn new(
        config: AgentConfig,
        store: Arc<EventStore>,
        uploader: Arc<Uploader>,
        install_id: String,
        app_version: String,
    ) -> Self {
        Self {
            config,
            store,
            uploader,
            install_id,
            app_version,
            facts: DeviceFacts::collect(),
            app_key: String::new(),
            initialized: false,
            is_open: false,
            has_been_open: false,
            session_uuid: String::new(),
            session_number: 0,
            session_start: 0,
            resume_time: 0,
            close_time: None,
            active_duration: 0,
            unstaged_flow: Vec::new(),
            staged_flow: Vec::new(),
            screens: Vec::new(),
        }
    }

    /// Bind the manager to an application key. Idempotent. Switching to
    /// a different key than the store last saw wipes the analytics data
    /// so old events cannot be attributed to the new key.
    #[instrument(skip(self))]
    pub fn init(&mut self, app_key: &str) {
        if self.initialized {
            debug!("already initialized");
            return;
        }
        if app_key.is_empty() {
            warn!("app key is empty, not initializing");
            return;
        }
        if let Err(e) = self.try_init(app_key) {
            warn!(error = %e, "failed to initialize");
        }
    }

    fn try_init(&mut self, app_key: &str) -> Result<(), StoreError> {
        let previous = self.store.app_key()?;
        if previous != app_key {
            if !previous.is_empty() {
                info!("app key changed, resetting analytics data");
                self.store.reset_analytics_data()?;
                self.store.vacuum_if_oversized()?;
            }
            self.store.set_app_key(app_key)?;
        }
        self.app_key = app_key.to_string();
        self.initialized = true;
        info!(app_key, "session manager initialized");
        Ok(())
    }

    /// Open a new session. No-op unless initialized, closed, opted in,
    /// and the store is under its size cap.
    #[instrument(skip(self))]
    pub fn open(&mut self) {
        if let Err(e) = self.try_open() {
            self.is_open = false;
            warn!(error = %e, "failed to open session");
        }
    }

    fn try_open(&mut self) -> Result<(), StoreError> {
        if !self.initialized || self.is_open {
            debug!("unable to open session");
            return Ok(());
        }
        if self.store.is_opted_out()? {
            debug!("not opening session, user is opted out");
            return Ok(());
        }
        if self.store.database_size()? > self.store.limits().max_size_bytes {
            warn!("event store over its size cap, session not opened");
            return Ok(());
        }

        // The previous session is over for good; make its queued close
        // record permanent before anything else lands in the log.
        self.commit_queued_close()?;

        let now = unix_now();
        self.active_duration = 0;
        self.resume_time = now;
        self.session_start = now;
        self.unstaged_flow.clear();
        self.staged_flow.clear();
        self.screens.clear();

        let uuid = encoder::random_uuid();
        let dims = self.store.custom_dimensions()?;
        let number = self.store.transaction("open_session", |txn| {
            let previous_start = txn.last_session_start()?;
            txn.set_last_session_start(now)?;
            let number = txn.increment_session_number()?;
            let elapsed = previous_start.map(|p| (now - p).max(0)).unwrap_or(0);
            let blob = encoder::session_start(&uuid, now, number, elapsed, &dims);
            txn.append_event(&blob)?;
            Ok(number)
        })?;

        self.session_uuid = uuid;
        self.session_number = number;
        self.is_open = true;
        self.has_been_open = true;
        info!(session = %self.session_uuid, number, "session opened");
        Ok(())
    }

    fn commit_queued_close(&self) -> Result<(), StoreError> {
        let queued = self.store.dequeue_close_event()?;
        if !queued.is_empty() {
            if let Err(e) = self.store.append_close_event(&queued) {
                warn!(error = %e, "failed to commit queued close event, re-queueing");
                self.store.queue_close_event(&queued)?;
            }
        }
        Ok(())
    }

    /// Close the current session. The close record is queued, not
    /// committed, so a prompt [`resume`](Self::resume) can retract it.
    /// The session counts as closed even if the write fails.
    #[instrument(skip(self))]
    pub fn close(&mut self) {
        if !self.is_open {
            debug!("unable to close session, session is not open");
            return;
        }

        let now = unix_now();
        self.close_time = Some((now, Instant::now()));
        self.active_duration += (now - self.resume_time).max(0);
        self.is_open = false;

        let total = now - self.session_start;
        let total = (total > 0 && total < MAX_PLAUSIBLE_SESSION_SECS).then_some(total);

        if let Err(e) = self.write_close_record(now, total) {
            warn!(error = %e, "failed to record session close");
        } else {
            info!(session = %self.session_uuid, "session closed");
        }
    }

    fn write_close_record(&self, now: i64, total: Option<i64>) -> Result<(), StoreError> {
        let dims = self.store.custom_dimensions()?;
        let blob = encoder::session_close(
            &self.session_uuid,
            self.session_start,
            now,
            self.active_duration,
            total,
            &self.screens,
            &dims,
        );
        self.store.queue_close_event(&blob)
    }

    /// Bring the agent back to the foreground. Reopens the previous
    /// session when one exists and it closed within the configured
    /// background timeout (a session interrupted by a phone call should
    /// not split in two); otherwise opens a new one. Returns whether the
    /// previous session was resumed.
    #[instrument(skip(self))]
    pub fn resume(&mut self) -> bool {
        if self.is_open {
            return true;
        }

        // A session that was never closed (e.g. the process was killed)
        // is always resumable.
        let within_timeout = self
            .close_time
            .map(|(_, mark)| mark.elapsed() <= self.config.background_session_timeout)
            .unwrap_or(true);
        let resumable = self.has_been_open && within_timeout;

        if self.is_opted_in() {
            if resumable {
                self.reopen_previous_session();
            } else {
                debug!("background timeout elapsed, opening a new session");
                self.open();
            }
        } else {
            debug!("cannot resume session, user is opted out");
        }

        self.close_time = None;
        resumable
    }

    fn reopen_previous_session(&mut self) {
        self.resume_time = unix_now();
        // Retract the close and flow records so the resumed session
        // uploads as one continuous session.
        if let Err(e) = self.store.remove_last_close_and_flow_events() {
            warn!(error = %e, "failed to retract close and flow events");
        }
        self.is_open = true;
        info!(session = %self.session_uuid, "resumed previous session");
    }

    /// Record the user's collection consent. Opting out closes the
    /// session; opting back in does not reopen it, since a reopened
    /// half-session would upload incomplete.
    #[instrument(skip(self))]
    pub fn set_opt_in(&mut self, opted_in: bool) {
        let now = unix_now();
        let result = self.store.transaction("set_opt", |txn| {
            txn.append_event(&encoder::opt(opted_in, now))?;
            txn.set_opted_out(!opted_in)
        });
        match result {
            Ok(()) => {
                if !opted_in {
                    self.is_open = false;
                }
                info!(opted_in, "opt state updated");
            }
            Err(e) => warn!(error = %e, "failed to update opt state"),
        }
    }

    pub fn is_opted_in(&self) -> bool {
        match self.store.is_opted_out() {
            Ok(opted_out) => !opted_out,
            Err(e) => {
                warn!(error = %e, "failed to read opt state");
                false
            }
        }
    }

    /// Record an application event with optional attributes. No-op when
    /// the session is closed or the name is empty.
    #[instrument(skip(self, attributes, report_attributes))]
    pub fn tag_event(
        &mut self,
        name: &str,
        attributes: &BTreeMap<String, String>,
        report_attributes: &BTreeMap<String, String>,
    ) {
        if !self.is_open {
            debug!("cannot tag an event, session is not open");
            return;
        }
        if name.is_empty() {
            debug!("event tagged without a name, skipping");
            return;
        }
        if let Err(e) = self.try_tag_event(name, attributes, report_attributes) {
            warn!(error = %e, "failed to tag event");
        }
    }

    fn try_tag_event(
        &mut self,
        name: &str,
        attributes: &BTreeMap<String, String>,
        report_attributes: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let dims = self.store.custom_dimensions()?;
        let blob = encoder::app_event(
            &self.app_key,
            &self.session_uuid,
            name,
            unix_now(),
            &dims,
            attributes,
            report_attributes,
        );
        self.store.append_event(&blob)?;
        self.unstaged_flow.push(FlowMarker::event(name));
        debug!(name, "tagged event");
        Ok(())
    }

    /// Record a viewed screen. Screens ride in the session-close record
    /// and the flow blob; nothing is written until then.
    #[instrument(skip(self))]
    pub fn tag_screen(&mut self, name: &str) {
        if !self.is_open || name.is_empty() {
            debug!("cannot tag a screen, session not open or name empty");
            return;
        }
        self.screens.push(name.to_string());
        self.unstaged_flow.push(FlowMarker::screen(name));
        debug!(name, "tagged screen");
    }

    /// Stage everything unstaged under a new upload header and hand the
    /// batch to the pipeline. Staging is one transaction; if it fails
    /// nothing moves and no request is made.
    #[instrument(skip(self))]
    pub async fn upload(&mut self) -> Result<UploadOutcome, SessionError> {
        if self.uploader.is_uploading() {
            debug!("an upload is already in progress");
            return Ok(UploadOutcome::AlreadyRunning);
        }

        let persisted_at = self.store.db_created_at()?;
        let flow_blob = (!self.unstaged_flow.is_empty()).then(|| {
            encoder::flow(self.session_start, &self.unstaged_flow, &self.staged_flow)
        });

        self.store.transaction("stage_upload", |txn| {
            // The flow record belongs to a session still in progress; it
            // is not retraction-flagged, so a later resume keeps it.
            if let Some(blob) = &flow_blob {
                txn.append_event(blob)?;
            }
            if txn.unstaged_event_count()? > 0 {
                let sequence = txn.increment_upload_number()?;
                let header = encoder::upload_header(
                    sequence,
                    persisted_at,
                    &self.app_key,
                    &self.install_id,
                    &self.app_version,
                    &self.facts,
                );
                let header_id = txn.add_header(sequence, &header)?;
                txn.stage_unstaged_events(header_id)?;
            }
            Ok(())
        })?;

        // Markers only move once their flow record is durably staged.
        self.staged_flow.append(&mut self.unstaged_flow);

        let outcome = self
            .uploader
            .upload(&self.store, &self.app_key, &self.install_id)
            .await?;
        Ok(outcome)
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn session_number(&self) -> i64 {
        self.session_number
    }

    pub fn library_version(&self) -> &'static str {
        pulse_core::LIBRARY_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use pulse_core::StorageLimits;
    use pulse_store::Database;

    fn manager_with(config: AgentConfig, limits: StorageLimits) -> SessionManager {
        let store = Arc::new(EventStore::new(Database::in_memory().unwrap(), limits));
        manager_over(config, store)
    }

    fn manager_over(config: AgentConfig, store: Arc<EventStore>) -> SessionManager {
        // Points at a dead port; only the async upload tests talk to it.
        let uploader = Arc::new(
            Uploader::new("http://127.0.0.1:9".to_string(), Duration::from_secs(1)).unwrap(),
        );
        SessionManager::new(
            config,
            store,
            uploader,
            "install-test".to_string(),
            "1.0.0".to_string(),
        )
    }

    fn manager() -> SessionManager {
        manager_with(AgentConfig::default(), StorageLimits::default())
    }

    fn opened() -> SessionManager {
        let mut m = manager();
        m.init("test-key");
        m.open();
        assert!(m.is_open());
        m
    }

    #[test]
    fn open_without_init_does_nothing() {
        let mut m = manager();
        m.open();
        assert!(!m.is_open());
        assert_eq!(m.store.event_count().unwrap(), 0);
    }

    #[test]
    fn init_rejects_empty_key() {
        let mut m = manager();
        m.init("");
        m.open();
        assert!(!m.is_open());
    }

    #[test]
    fn open_writes_session_start_record() {
        let m = opened();
        assert_eq!(m.session_number(), 1);
        assert_eq!(m.store.event_count().unwrap(), 1);
        let blob = m.store.snapshot_upload_blob().unwrap();
        assert_eq!(blob, ""); // nothing staged yet
    }

    #[test]
    fn double_open_is_a_noop() {
        let mut m = opened();
        m.open();
        assert_eq!(m.session_number(), 1);
        assert_eq!(m.store.event_count().unwrap(), 1);
    }

    #[test]
    fn app_key_change_resets_analytics_data() {
        let store = Arc::new(EventStore::new(
            Database::in_memory().unwrap(),
            StorageLimits::default(),
        ));

        let mut first = manager_over(AgentConfig::default(), store.clone());
        first.init("key-one");
        first.open();
        first.tag_event("evt", &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(store.event_count().unwrap(), 2);

        let mut second = manager_over(AgentConfig::default(), store.clone());
        second.init("key-two");
        assert_eq!(store.event_count().unwrap(), 0);
        assert_eq!(store.app_key().unwrap(), "key-two");
    }

    #[test]
    fn same_app_key_does_not_reset() {
        let store = Arc::new(EventStore::new(
            Database::in_memory().unwrap(),
            StorageLimits::default(),
        ));
        let mut first = manager_over(AgentConfig::default(), store.clone());
        first.init("key");
        first.open();
        assert_eq!(store.event_count().unwrap(), 1);

        let mut second = manager_over(AgentConfig::default(), store.clone());
        second.init("key");
        assert_eq!(store.event_count().unwrap(), 1);
    }

    #[test]
    fn close_queues_a_retractable_close_record() {
        let mut m = opened();
        m.close();
        assert!(!m.is_open());
        // The close blob is queued, not in the event log.
        assert_eq!(m.store.event_count().unwrap(), 1);
        let queued = m.store.dequeue_close_event().unwrap();
        assert!(queued.contains("\"dt\":\"c\""));
        assert!(queued.ends_with('\n'));
    }

    #[test]
    fn close_when_not_open_does_nothing() {
        let mut m = manager();
        m.init("key");
        m.close();
        assert_eq!(m.store.dequeue_close_event().unwrap(), "");
    }

    #[test]
    fn resume_within_timeout_reopens_the_same_session() {
        let mut m = opened();
        let number = m.session_number();
        m.close();

        assert!(m.resume());
        assert!(m.is_open());
        assert_eq!(m.session_number(), number);
        // No new session-start record was written.
        assert_eq!(m.store.event_count().unwrap(), 1);
    }

    #[test]
    fn resume_after_timeout_opens_a_new_session() {
        let config = AgentConfig {
            background_session_timeout: Duration::ZERO,
            ..AgentConfig::default()
        };
        let mut m = manager_with(config, StorageLimits::default());
        m.init("key");
        m.open();
        m.close();

        assert!(!m.resume());
        assert!(m.is_open());
        assert_eq!(m.session_number(), 2);
        // Start of session 1, its committed close, start of session 2.
        assert_eq!(m.store.event_count().unwrap(), 3);
        assert_eq!(m.store.dequeue_close_event().unwrap(), "");
    }

    #[test]
    fn resume_while_open_is_true() {
        let mut m = opened();
        assert!(m.resume());
        assert_eq!(m.store.event_count().unwrap(), 1);
    }

    #[test]
    fn resume_without_prior_session_opens_new() {
        let mut m = manager();
        m.init("key");
        assert!(!m.resume());
        assert!(m.is_open());
        assert_eq!(m.session_number(), 1);
    }

    #[test]
    fn opted_out_blocks_open_and_resume() {
        let mut m = manager();
        m.init("key");
        m.set_opt_in(false);

        m.open();
        assert!(!m.is_open());
        m.resume();
        assert!(!m.is_open());
        // Only the opt record landed in the log.
        assert_eq!(m.store.event_count().unwrap(), 1);
    }

    #[test]
    fn opting_out_closes_the_session_and_stays_closed() {
        let mut m = opened();
        m.set_opt_in(false);
        assert!(!m.is_open());
        assert!(!m.is_opted_in());

        // Opting back in never reopens the interrupted session.
        m.set_opt_in(true);
        assert!(!m.is_open());
        assert!(m.is_opted_in());

        // But a fresh open works again.
        m.open();
        assert!(m.is_open());
    }

    #[test]
    fn oversized_store_refuses_new_sessions() {
        let limits = StorageLimits {
            max_size_bytes: 0,
            ..StorageLimits::default()
        };
        let mut m = manager_with(AgentConfig::default(), limits);
        m.init("key");
        m.open();
        assert!(!m.is_open());
    }

    #[test]
    fn tag_event_requires_open_session_and_name() {
        let mut m = manager();
        m.init("key");
        m.tag_event("early", &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(m.store.event_count().unwrap(), 0);

        m.open();
        m.tag_event("", &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(m.store.event_count().unwrap(), 1);
    }

    #[test]
    fn tag_event_appends_record_and_flow_marker() {
        let mut m = opened();
        let mut attrs = BTreeMap::new();
        attrs.insert("color".to_string(), "blue".to_string());
        m.tag_event("button_press", &attrs, &BTreeMap::new());

        assert_eq!(m.store.event_count().unwrap(), 2);
        assert_eq!(m.unstaged_flow, vec![FlowMarker::event("button_press")]);
    }

    #[test]
    fn tag_screen_rides_in_the_close_record() {
        let mut m = opened();
        m.tag_screen("home");
        m.tag_screen("settings");
        // Screens do not write to the event log directly.
        assert_eq!(m.store.event_count().unwrap(), 1);

        m.close();
        let queued = m.store.dequeue_close_event().unwrap();
        assert!(queued.contains("\"fl\":[\"home\",\"settings\"]"));
    }

    #[test]
    fn custom_dimensions_appear_in_records() {
        let mut m = manager();
        m.init("key");
        m.store.set_custom_dimension(0, "variant-a").unwrap();
        m.open();
        m.tag_event("evt", &BTreeMap::new(), &BTreeMap::new());

        m.store.add_header(1, "h\n").unwrap();
        m.store.stage_unstaged_events(1).unwrap();
        let blob = m.store.snapshot_upload_blob().unwrap();
        assert!(blob.contains("\"c0\":\"variant-a\""));
    }

    #[tokio::test]
    async fn upload_stages_flow_header_and_events() {
        // The dead-port uploader makes the POST fail, so everything
        // stays staged and can be inspected.
        let mut m = opened();
        m.tag_event("evt", &BTreeMap::new(), &BTreeMap::new());
        m.tag_screen("home");

        let outcome = m.upload().await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Retained(_)));

        // session start + event + flow record, all staged under one header.
        assert_eq!(m.store.staged_event_count().unwrap(), 3);
        assert_eq!(m.store.header_count().unwrap(), 1);
        assert_eq!(m.store.unstaged_event_count().unwrap(), 0);
        assert!(m.unstaged_flow.is_empty());
        assert_eq!(m.staged_flow.len(), 2);

        let blob = m.store.snapshot_upload_blob().unwrap();
        assert!(blob.contains("\"dt\":\"h\""));
        assert!(blob.contains("\"dt\":\"f\""));
        assert!(blob.contains("\"nw\":[{\"e\":\"evt\"},{\"s\":\"home\"}]"));
    }

    #[tokio::test]
    async fn upload_with_nothing_unstaged_sends_nothing() {
        let mut m = manager();
        m.init("key");
        let outcome = m.upload().await.unwrap();
        assert_eq!(outcome, UploadOutcome::NothingToSend);
        assert_eq!(m.store.header_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn second_upload_moves_flow_markers_to_old() {
        let mut m = opened();
        m.tag_event("first", &BTreeMap::new(), &BTreeMap::new());
        m.upload().await.unwrap();

        m.tag_event("second", &BTreeMap::new(), &BTreeMap::new());
        m.upload().await.unwrap();

        let blob = m.store.snapshot_upload_blob().unwrap();
        assert!(blob.contains("\"nw\":[{\"e\":\"second\"}],\"od\":[{\"e\":\"first\"}]"));
    }
}
