//! Deferred enrichment of events describing a previous process.
//!
//! The failed process is gone, so everything it knew has to come from the
//! scope and options snapshots it left on disk. Every field is filled only
//! when the event does not already carry it: data produced by a diagnostic
//! parser always wins over a snapshot, and a snapshot always wins over a
//! default.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::{debug, warn};
use vigil_protocol::{
    AppContext, DebugImage, EnrichedEvent, EnrichmentPolicy, ReportCategory, User,
    APP_CONTEXT_KEY, DEVICE_CONTEXT_KEY, OS_CONTEXT_KEY, TRACE_CONTEXT_KEY,
};

use crate::config::AppSettings;
use crate::device::DeviceInfoProvider;
use crate::installation::installation_id;
use crate::snapshot::SnapshotReader;
use crate::storage::StorageConfig;

pub mod release;

pub use release::{parse_release, ReleaseParts};

pub const DEFAULT_PLATFORM: &str = "other";
pub const DEFAULT_ENVIRONMENT: &str = "production";
pub const DEFAULT_FINGERPRINT: &str = "{{ default }}";
pub const FOREGROUND_HANG_FINGERPRINT: &str = "foreground-anr";
pub const BACKGROUND_HANG_FINGERPRINT: &str = "background-anr";
pub const SYMBOL_MAP_IMAGE_TYPE: &str = "proguard";

pub struct DeferredEventEnricher {
    snapshots: SnapshotReader,
    device: Arc<dyn DeviceInfoProvider>,
    app: AppSettings,
    installation_file: std::path::PathBuf,
    installation_id: OnceCell<Option<String>>,
}

impl DeferredEventEnricher {
    pub fn new(
        storage: &StorageConfig,
        app: AppSettings,
        device: Arc<dyn DeviceInfoProvider>,
    ) -> Self {
        Self {
            snapshots: SnapshotReader::new(storage.clone()),
            device,
            app,
            installation_file: storage.installation_file(),
            installation_id: OnceCell::new(),
        }
    }

    /// Enriches `event` in place according to `policy`.
    pub fn enrich(&self, event: &mut EnrichedEvent, policy: &EnrichmentPolicy) {
        self.apply_static_descriptors(event);

        if !policy.should_enrich {
            debug!("Reduced enrichment, skipping snapshot backfill");
            return;
        }

        self.backfill_scope(event, policy);
        self.backfill_options(event);
        self.apply_app_identity(event, policy);
        self.apply_default_user(event);
    }

    fn apply_static_descriptors(&self, event: &mut EnrichedEvent) {
        event
            .platform
            .get_or_insert_with(|| DEFAULT_PLATFORM.to_string());

        // A persisted OS descriptor may predate an OS update; keep it under
        // its own key and install the fresh one as the primary.
        if let Some(previous) = event.contexts.remove(OS_CONTEXT_KEY) {
            let key = previous
                .get("name")
                .and_then(Value::as_str)
                .map(|name| format!("os_{}", name.trim().to_lowercase()))
                .unwrap_or_else(|| "os_1".to_string());
            event.contexts.insert(key, previous);
        }
        event.contexts.set_typed(OS_CONTEXT_KEY, &self.device.os());

        if !event.contexts.contains_key(DEVICE_CONTEXT_KEY) {
            event
                .contexts
                .set_typed(DEVICE_CONTEXT_KEY, &self.device.device());
        }
    }

    fn backfill_scope(&self, event: &mut EnrichedEvent, policy: &EnrichmentPolicy) {
        let snapshots = &self.snapshots;

        if event.request.is_none() {
            event.request = snapshots.request();
        }
        if event.user.is_none() {
            event.user = snapshots.user();
        }
        if let Some(tags) = snapshots.tags() {
            let target = event.tags.get_or_insert_with(Default::default);
            for (key, value) in tags {
                target.entry(key).or_insert(value);
            }
        }
        if let Some(breadcrumbs) = snapshots.breadcrumbs() {
            event
                .breadcrumbs
                .get_or_insert_with(Vec::new)
                .extend(breadcrumbs);
        }
        if let Some(extras) = snapshots.extras() {
            let target = event.extra.get_or_insert_with(Default::default);
            for (key, value) in extras {
                target.entry(key).or_insert(value);
            }
        }
        if let Some(contexts) = snapshots.contexts() {
            for (key, value) in contexts.iter() {
                if key == TRACE_CONTEXT_KEY {
                    continue;
                }
                event.contexts.insert_if_absent(key.clone(), value.clone());
            }
        }
        if !event.contexts.contains_key(TRACE_CONTEXT_KEY) {
            if let Some(trace) = snapshots.trace() {
                event.contexts.set_typed(TRACE_CONTEXT_KEY, &trace);
            }
        }
        if event.transaction.is_none() {
            event.transaction = snapshots.transaction();
        }
        if event.fingerprint.is_none() {
            event.fingerprint = snapshots.fingerprint().or_else(|| default_fingerprint(policy));
        }
        if event.level.is_none() {
            event.level = snapshots.level();
        }
    }

    fn backfill_options(&self, event: &mut EnrichedEvent) {
        let snapshots = &self.snapshots;

        if event.release.is_none() {
            event.release = snapshots.release();
        }
        if event.environment.is_none() {
            event.environment =
                Some(snapshots.environment().unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()));
        }
        if event.dist.is_none() {
            event.dist = snapshots.dist().or_else(|| {
                event
                    .release
                    .as_deref()
                    .and_then(parse_release)
                    .and_then(|parts| parts.numeric_build().map(str::to_string))
            });
        }
        if let Some(symbol_map_id) = snapshots.symbol_map_id() {
            event.add_debug_images(std::iter::once(DebugImage {
                ty: SYMBOL_MAP_IMAGE_TYPE.to_string(),
                uuid: Some(symbol_map_id),
                ..DebugImage::default()
            }));
        }
        if event.sdk.is_none() {
            event.sdk = snapshots.sdk();
        }
        if let Some(tags) = snapshots.options_tags() {
            let target = event.tags.get_or_insert_with(Default::default);
            for (key, value) in tags {
                target.entry(key).or_insert(value);
            }
        }
    }

    fn apply_app_identity(&self, event: &mut EnrichedEvent, policy: &EnrichmentPolicy) {
        let mut app: AppContext = event
            .contexts
            .get_typed(APP_CONTEXT_KEY)
            .unwrap_or_default();

        if app.app_name.is_none() {
            app.app_name = self.app.name.clone();
        }
        if app.app_identifier.is_none() {
            app.app_identifier = self.app.package.clone();
        }
        if let Some(release) = event.release.as_deref() {
            match parse_release(release) {
                Some(parts) => {
                    app.app_identifier.get_or_insert(parts.package);
                    app.app_version.get_or_insert(parts.version);
                    app.app_build.get_or_insert(parts.build);
                }
                None => warn!(release, "Release is not package@version+build, app version left unset"),
            }
        }
        if app.in_foreground.is_none() {
            app.in_foreground = Some(!policy.is_background);
        }

        event.contexts.set_typed(APP_CONTEXT_KEY, &app);
    }

    fn apply_default_user(&self, event: &mut EnrichedEvent) {
        let has_id = event
            .user
            .as_ref()
            .map(|user| user.id.is_some())
            .unwrap_or(false);
        if has_id {
            return;
        }
        let Some(id) = self.installation_id() else {
            return;
        };
        event.user.get_or_insert_with(User::default).id = Some(id);
    }

    fn installation_id(&self) -> Option<String> {
        self.installation_id
            .get_or_init(|| match installation_id(&self.installation_file) {
                Ok(id) => Some(id),
                Err(err) => {
                    warn!(error = %err, "Failed to resolve installation id");
                    None
                }
            })
            .clone()
    }
}

fn default_fingerprint(policy: &EnrichmentPolicy) -> Option<Vec<String>> {
    let exit = policy.abnormal_exit?;
    if exit.category != ReportCategory::Hang {
        return None;
    }
    let kind = if policy.is_background {
        BACKGROUND_HANG_FINGERPRINT
    } else {
        FOREGROUND_HANG_FINGERPRINT
    };
    Some(vec![DEFAULT_FINGERPRINT.to_string(), kind.to_string()])
}
