//! VigilEngine - the composition root for hosts.
//!
//! Wires storage, markers, the envelope sink, the enricher, the native event
//! correlator and the reconciler together from one [`VigilConfig`]. Hosts
//! either embed it from Rust (`with_parts`) or through the FFI surface
//! (`new` + `run_startup_reconciliation`).
//!
//! Reconciliation blocks on flush acknowledgements and on the previous
//! session gate, so it always runs on the `vigil-reconcile` worker thread,
//! never on the caller's.
//!
//! ```rust,ignore
//! use vigil_core::VigilEngine;
//!
//! let engine = Arc::new(VigilEngine::new(None)?);
//! let task = engine.clone().run_startup_reconciliation(history_json)?;
//! let reports = task.wait(30_000)?;
//! ```

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use vigil_protocol::ReportCategory;

use crate::config::{load_config, VigilConfig};
use crate::device::{DeviceInfoProvider, SystemDeviceInfo};
use crate::enrich::DeferredEventEnricher;
use crate::error::{Result, VigilError, VigilFfiError};
use crate::markers::MarkerStore;
use crate::native::NativeEventCorrelator;
use crate::reconcile::{
    ExitHistoryReconciler, ExitHistorySource, HangPolicy, NativeFaultPolicy, NoPreviousSession,
    PreviousSessionGate, ReasonPolicy, ReconcileOutcome, SessionFlushGate, StaticExitHistory,
};
use crate::sink::{EnvelopeSink, FlushLatch, ReportSink};
use crate::snapshot::SnapshotWriter;
use crate::storage::StorageConfig;
use crate::watchdog::{HangWatchdog, MainContext, SinkHangListener, WatchdogConfig};

/// Per-category result of a reconciliation run, as seen over FFI.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct CategoryReport {
    pub category: String,
    pub already_ran: bool,
    /// Ids of accepted reports, oldest first.
    pub event_ids: Vec<String>,
    pub suppressed: u32,
    pub unreportable: u32,
}

impl CategoryReport {
    fn from_outcome(category: ReportCategory, outcome: &ReconcileOutcome) -> Self {
        let (event_ids, suppressed) =
            outcome
                .emitted()
                .iter()
                .fold((Vec::new(), 0), |(mut ids, suppressed), report| {
                    if report.accepted() {
                        ids.push(report.event_id.as_str().to_string());
                        (ids, suppressed)
                    } else {
                        (ids, suppressed + 1)
                    }
                });
        let unreportable = match outcome {
            ReconcileOutcome::Processed { unreportable, .. } => *unreportable as u32,
            _ => 0,
        };
        Self {
            category: category.label().to_string(),
            already_ran: matches!(outcome, ReconcileOutcome::AlreadyRan),
            event_ids,
            suppressed,
            unreportable,
        }
    }
}

type CategoryResult = std::result::Result<Vec<CategoryReport>, String>;

pub const RECONCILE_THREAD_NAME: &str = "vigil-reconcile";

/// Handle to a reconciliation running on the worker thread.
#[derive(Default, uniffi::Object)]
pub struct ReconcileTask {
    done: FlushLatch,
    result: Mutex<Option<CategoryResult>>,
}

impl ReconcileTask {
    fn finish(&self, result: CategoryResult) {
        *self
            .result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(result);
        self.done.signal();
    }
}

#[uniffi::export]
impl ReconcileTask {
    pub fn is_finished(&self) -> bool {
        self.done.is_signaled()
    }

    /// Waits up to `timeout_ms` for the worker. `None` while it is still
    /// running.
    pub fn wait(
        &self,
        timeout_ms: u64,
    ) -> std::result::Result<Option<Vec<CategoryReport>>, VigilFfiError> {
        if !self.done.wait(Duration::from_millis(timeout_ms)) {
            return Ok(None);
        }
        let result = self
            .result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match result {
            Some(Ok(reports)) => Ok(Some(reports)),
            Some(Err(message)) => Err(VigilFfiError::from(message)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct MarkerValue {
    pub category: String,
    /// Epoch milliseconds of the newest reported exit, if any.
    pub timestamp_ms: Option<i64>,
}

#[derive(uniffi::Object)]
pub struct VigilEngine {
    storage: StorageConfig,
    config: VigilConfig,
    markers: Arc<MarkerStore>,
    sink: Arc<EnvelopeSink>,
    enricher: Arc<DeferredEventEnricher>,
    correlator: Option<Arc<NativeEventCorrelator>>,
    reconciler: ExitHistoryReconciler,
    // Set when the host signals the previous session through FFI.
    session_gate: Option<Arc<SessionFlushGate>>,
}

impl VigilEngine {
    /// Builds an engine from explicit parts. Not exposed to FFI.
    pub fn with_parts(
        storage: StorageConfig,
        config: VigilConfig,
        device: Arc<dyn DeviceInfoProvider>,
        gate: Arc<dyn PreviousSessionGate>,
    ) -> Self {
        let markers = Arc::new(MarkerStore::new(storage.clone()));
        let sink = Arc::new(EnvelopeSink::new(&storage, Arc::clone(&markers)));
        let enricher = Arc::new(DeferredEventEnricher::new(
            &storage,
            config.app.clone(),
            device,
        ));
        let correlator = config.native.enabled.then(|| {
            Arc::new(NativeEventCorrelator::new(
                storage.outbox_dir(),
                config.native.correlation_tolerance_ms,
            ))
        });
        let reconciler = ExitHistoryReconciler::new(
            Arc::clone(&sink) as Arc<dyn ReportSink>,
            gate,
            &config.reconcile,
        );

        Self {
            storage,
            config,
            markers,
            sink,
            enricher,
            correlator,
            reconciler,
            session_gate: None,
        }
    }

    /// Loads `vigil.toml` from the storage root and uses system probes.
    ///
    /// With `reconcile.await_previous_session` set, reconciliation waits for
    /// [`VigilEngine::mark_previous_session_flushed`] before reporting.
    pub fn with_storage(storage: StorageConfig) -> Result<Self> {
        let config = load_config(&storage.config_file())?;
        if !config.reconcile.await_previous_session {
            return Ok(Self::with_parts(
                storage,
                config,
                Arc::new(SystemDeviceInfo),
                Arc::new(NoPreviousSession),
            ));
        }

        let gate = Arc::new(SessionFlushGate::new(Box::new(|| {
            warn!("Previous session never marked flushed, reconciling without it");
        })));
        let mut engine = Self::with_parts(
            storage,
            config,
            Arc::new(SystemDeviceInfo),
            Arc::clone(&gate) as Arc<dyn PreviousSessionGate>,
        );
        engine.session_gate = Some(gate);
        Ok(engine)
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    pub fn marker_store(&self) -> &Arc<MarkerStore> {
        &self.markers
    }

    pub fn sink(&self) -> Arc<dyn ReportSink> {
        Arc::clone(&self.sink) as Arc<dyn ReportSink>
    }

    /// Writer for the scope/options snapshots a live process persists.
    pub fn snapshot_writer(&self) -> SnapshotWriter {
        SnapshotWriter::new(self.storage.clone())
    }

    fn policy(&self, category: ReportCategory) -> Box<dyn ReasonPolicy> {
        let reconcile = &self.config.reconcile;
        match category {
            ReportCategory::Hang => Box::new(HangPolicy::new(
                Arc::clone(&self.markers),
                Arc::clone(&self.enricher),
                reconcile.report_historical_hangs,
                reconcile.flush_timeout_ms,
            )),
            ReportCategory::NativeFault => Box::new(NativeFaultPolicy::new(
                Arc::clone(&self.markers),
                Arc::clone(&self.enricher),
                self.correlator.clone(),
                reconcile.report_historical_native_faults,
                reconcile.flush_timeout_ms,
            )),
        }
    }

    /// Reconciles every category against `source` as of now.
    pub fn reconcile(
        &self,
        source: &dyn ExitHistorySource,
    ) -> Result<Vec<(ReportCategory, ReconcileOutcome)>> {
        self.reconcile_at(source, Utc::now().timestamp_millis())
    }

    pub fn reconcile_at(
        &self,
        source: &dyn ExitHistorySource,
        now: i64,
    ) -> Result<Vec<(ReportCategory, ReconcileOutcome)>> {
        let records = source.exit_records()?;
        info!(records = records.len(), "Starting exit history reconciliation");

        Ok(ReportCategory::ALL
            .iter()
            .map(|&category| {
                let policy = self.policy(category);
                let outcome = self.reconciler.run_at(&records, policy.as_ref(), now);
                (category, outcome)
            })
            .collect())
    }

    /// Runs `work` against this engine on the `vigil-reconcile` thread.
    fn spawn_worker<F, T>(self: &Arc<Self>, work: F) -> std::io::Result<JoinHandle<T>>
    where
        F: FnOnce(&VigilEngine) -> T + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(self);
        thread::Builder::new()
            .name(RECONCILE_THREAD_NAME.to_string())
            .spawn(move || work(engine.as_ref()))
    }

    /// Reconciles every category against `source` on the worker thread, as
    /// of `now` or the current time.
    pub fn spawn_reconcile(
        self: &Arc<Self>,
        source: Box<dyn ExitHistorySource>,
        now: Option<i64>,
    ) -> std::io::Result<JoinHandle<Result<Vec<(ReportCategory, ReconcileOutcome)>>>> {
        self.spawn_worker(move |engine| {
            let now = now.unwrap_or_else(|| Utc::now().timestamp_millis());
            engine.reconcile_at(source.as_ref(), now)
        })
    }

    /// Builds the live watchdog for `main`, or `None` when disabled. The
    /// caller owns the returned watchdog and starts it.
    pub fn hang_watchdog(&self, main: Arc<dyn MainContext>) -> Option<HangWatchdog> {
        if !self.config.watchdog.enabled {
            info!("Hang watchdog disabled by configuration");
            return None;
        }
        let listener = Arc::new(SinkHangListener::new(self.sink()));
        Some(HangWatchdog::new(
            WatchdogConfig::from(&self.config.watchdog),
            main,
            listener,
        ))
    }
}

#[uniffi::export]
impl VigilEngine {
    /// Creates an engine rooted at `root`, or at the default cache location.
    #[uniffi::constructor]
    pub fn new(root: Option<String>) -> std::result::Result<Self, VigilFfiError> {
        let storage = match root {
            Some(root) => StorageConfig::with_root(root.into()),
            None => StorageConfig::default(),
        };
        Self::with_storage(storage).map_err(VigilFfiError::from)
    }

    /// Starts reconciling an exit history document handed over by the host
    /// (`{"version":1,"records":[...]}`, newest first) and returns at once.
    ///
    /// The document is validated on the calling thread; the reports come
    /// back through the returned task.
    pub fn run_startup_reconciliation(
        self: Arc<Self>,
        history_json: String,
    ) -> std::result::Result<Arc<ReconcileTask>, VigilFfiError> {
        let source = StaticExitHistory::from_json_str(&history_json)?;
        let task = Arc::new(ReconcileTask::default());
        let worker_task = Arc::clone(&task);

        self.spawn_worker(move |engine| {
            let result = engine
                .reconcile(&source)
                .map(|outcomes| {
                    outcomes
                        .iter()
                        .map(|(category, outcome)| CategoryReport::from_outcome(*category, outcome))
                        .collect()
                })
                .map_err(|err| err.to_string());
            worker_task.finish(result);
        })
        .map_err(|err| VigilError::io("spawning reconcile worker", err))?;

        Ok(task)
    }

    /// Tells a waiting reconciliation that the previous session is on disk.
    pub fn mark_previous_session_flushed(&self) {
        match &self.session_gate {
            Some(gate) => gate.mark_flushed(),
            None => debug!("No previous session gate configured"),
        }
    }

    /// Current dedup markers, one per category.
    pub fn markers(&self) -> Vec<MarkerValue> {
        ReportCategory::ALL
            .iter()
            .map(|&category| MarkerValue {
                category: category.label().to_string(),
                timestamp_ms: self.markers.read(category),
            })
            .collect()
    }

    /// Directory the native fault handler writes into.
    pub fn outbox_dir(&self) -> String {
        self.storage.outbox_dir().to_string_lossy().to_string()
    }

    /// Directory holding the reports produced here, for the transport.
    pub fn envelope_cache_dir(&self) -> String {
        self.storage.envelope_cache_dir().to_string_lossy().to_string()
    }
}
