//! The migration engine: applies pending steps in order, atomically,
//! with backups, retries and rollback.

use crate::config::store::{set_version, ConfigStore};
use crate::core::status::{MigrationAudit, StatusSurface, StepOutcome};
use crate::migration::backup::{BackupManager, FileClass};
use crate::migration::registry::EntityRegistry;
use crate::migration::steps::{catalog, MigrationContext, MigrationStep};
use crate::migration::version::MigrationVersion;
use crate::{BridgeError, BridgeResult};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Per-step apply timeout.
pub const MIGRATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Attempts per step before the run fails.
pub const RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Backup artifact name for entity-registry exports.
const REGISTRY_EXPORT_NAME: &str = "entity_registry.json";

pub struct MigrationEngine {
    store: ConfigStore,
    backups: BackupManager,
    status: StatusSurface,
    ctx: MigrationContext,
    retry_attempts: u32,
    retry_delay: Duration,
    step_timeout: Duration,
}

impl MigrationEngine {
    pub fn new(
        store: ConfigStore,
        backups: BackupManager,
        status: StatusSurface,
        ctx: MigrationContext,
    ) -> Self {
        Self {
            store,
            backups,
            status,
            ctx,
            retry_attempts: RETRY_ATTEMPTS,
            retry_delay: RETRY_DELAY,
            step_timeout: MIGRATION_TIMEOUT,
        }
    }

    /// Override the retry budget. Used by tests to avoid real delays.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Bring the document from its stored version to `latest` using the
    /// standard step catalog.
    pub async fn migrate_to(
        &self,
        registry: &mut dyn EntityRegistry,
        latest: MigrationVersion,
    ) -> BridgeResult<MigrationAudit> {
        self.run(registry, &catalog(), latest).await
    }

    /// Run an explicit step list up to `latest`.
    pub async fn run(
        &self,
        registry: &mut dyn EntityRegistry,
        steps: &[Box<dyn MigrationStep>],
        latest: MigrationVersion,
    ) -> BridgeResult<MigrationAudit> {
        let current = self.store.stored_version().await?;
        let mut audit = MigrationAudit {
            from_version: current,
            to_version: latest.as_u32(),
            steps: Vec::new(),
        };

        let pending = MigrationVersion::pending(current, latest);
        if pending.is_empty() {
            tracing::info!(version = current, "Configuration already current, nothing to migrate");
            self.status.record_migration(audit.clone());
            return Ok(audit);
        }

        tracing::info!(
            from = current,
            to = latest.as_u32(),
            steps = pending.len(),
            "Starting configuration migration"
        );
        self.backups.preflight()?;

        for version in pending {
            let step = steps
                .iter()
                .find(|s| s.target() == version)
                .ok_or_else(|| {
                    BridgeError::Internal(format!("No migration step targets version {version}"))
                })?;

            let started = Instant::now();
            let mut backup_paths = Vec::new();
            let mut last_error: Option<BridgeError> = None;
            let mut success = false;

            for attempt in 1..=self.retry_attempts {
                match self.apply_step(step.as_ref(), registry, version).await {
                    Ok(paths) => {
                        backup_paths = paths;
                        success = true;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            step = step.name(),
                            attempt,
                            error = %e,
                            "Migration step attempt failed"
                        );
                        last_error = Some(e);
                        if attempt < self.retry_attempts {
                            tokio::time::sleep(self.retry_delay).await;
                        }
                    }
                }
            }

            audit.steps.push(StepOutcome {
                version: version.as_u32(),
                name: step.name().to_string(),
                success,
                duration_ms: started.elapsed().as_millis() as u64,
                backup_paths: backup_paths.iter().map(|p: &PathBuf| p.display().to_string()).collect(),
                error_kind: last_error.as_ref().map(|e| e.kind_tag().to_string()),
            });

            if !success {
                self.status.record_migration(audit.clone());
                let cause = last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(BridgeError::migration_failed(format!(
                    "Step {} (version {version}) failed after {} attempts: {cause}",
                    step.name(),
                    self.retry_attempts
                )));
            }
            tracing::info!(step = step.name(), %version, "Migration step committed");
        }

        if let Some(name) = self.store.path().file_name().and_then(|n| n.to_str()) {
            if let Err(e) = self.backups.cleanup(name, FileClass::Config) {
                tracing::warn!(error = %e, "Backup cleanup failed");
            }
        }
        if let Err(e) = self.backups.cleanup(REGISTRY_EXPORT_NAME, FileClass::Registry) {
            tracing::warn!(error = %e, "Registry backup cleanup failed");
        }
        self.status.record_migration(audit.clone());
        tracing::info!(version = latest.as_u32(), "Configuration migration complete");
        Ok(audit)
    }

    /// One attempt of one step: preflight, backup, apply under timeout,
    /// validate, commit. Any failure restores the document and the registry
    /// to their pre-step state before returning.
    async fn apply_step(
        &self,
        step: &dyn MigrationStep,
        registry: &mut dyn EntityRegistry,
        version: MigrationVersion,
    ) -> BridgeResult<Vec<PathBuf>> {
        self.backups.preflight()?;
        let backup = self.backups.backup_file(self.store.path())?;
        let registry_snapshot = registry.export();
        let registry_backup = self
            .backups
            .backup_snapshot(REGISTRY_EXPORT_NAME, &serde_json::to_string_pretty(&registry_snapshot)?)?;

        let result = self.transform(step, registry, version).await;
        match result {
            Ok(()) => Ok(vec![backup, registry_backup]),
            Err(e) => {
                if let Err(restore_err) = self.backups.restore(&backup, self.store.path()) {
                    tracing::error!(error = %restore_err, "Rollback restore failed");
                }
                if let Err(import_err) = registry.import(registry_snapshot) {
                    tracing::error!(error = %import_err, "Registry rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn transform(
        &self,
        step: &dyn MigrationStep,
        registry: &mut dyn EntityRegistry,
        version: MigrationVersion,
    ) -> BridgeResult<()> {
        let mut document = self.store.load_document().await?;

        match tokio::time::timeout(
            self.step_timeout,
            step.apply(&mut document, registry, &self.ctx),
        )
        .await
        {
            Err(_) => {
                return Err(BridgeError::timeout(format!(
                    "Migration step {} exceeded {}s",
                    step.name(),
                    self.step_timeout.as_secs()
                )))
            }
            Ok(result) => result?,
        }

        set_version(&mut document, version.as_u32());
        self.store.save_document(&document).await?;

        // Validate by re-reading what actually landed on disk.
        let stored = self.store.stored_version().await?;
        if stored != version.as_u32() {
            return Err(BridgeError::migration_failed(format!(
                "Post-write validation: stored version {stored}, expected {version}"
            )));
        }
        Ok(())
    }
}
