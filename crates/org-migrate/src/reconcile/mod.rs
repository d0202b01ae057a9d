//! Reconciliation engine.
//!
//! After a run, find the target-store ids of records the migration created.
//! Only objects whose operation was a pure create are reconciled. Strategies
//! are tried in order and the first one that finds records wins:
//!
//! 1. external id correlation: values eligible on the source, matched on the target
//! 2. time window + actor: records created during the run by the integration user
//! 3. give up: the object is skipped with an ambiguous identity warning
//!
//! Records present in the pre-migration snapshot are never reported as created.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Timelike, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backup::{manifest_dir, resolve_ref, BackupManifest, BackupObject};
use crate::config::PartialValuePolicy;
use crate::core::identifier::{datetime_literal, quote_literal};
use crate::core::record::record_id;
use crate::core::{Record, RecordStore, ID_FIELD};
use crate::error::{MigrateError, ObjectWarning, Result};
use crate::query::{compose, external_id_filter, leading_field, split_conjuncts, where_clause};
use crate::tabular;

/// Fields that describe when or by whom a record was written.
const TIME_ACTOR_FIELDS: &[&str] = &[
    "CreatedDate",
    "CreatedById",
    "LastModifiedDate",
    "LastModifiedById",
    "SystemModstamp",
    "LastReferencedDate",
    "LastViewedDate",
    "OwnerId",
];

/// Relationships whose traversals name the writing user.
const ACTOR_RELATIONSHIPS: &[&str] = &["CreatedBy.", "LastModifiedBy.", "Owner."];

/// Object type holding store users.
const USER_OBJECT: &str = "User";

/// Start and end of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWindow {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Username the transfer tool wrote records as.
    pub username: Option<String>,
}

/// How an object's created records were identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    ExternalId,
    TimeWindow,
}

/// Reconciliation result for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReconciliation {
    pub object_type: String,
    pub strategy: Strategy,
    pub created_count: u64,
    pub file_ref: String,
    /// The actor was the most recently active user, not an exact match.
    #[serde(default)]
    pub imprecise_actor: bool,
}

/// Result of a reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub manifest: BackupManifest,
    pub reconciled: Vec<ObjectReconciliation>,
    pub warnings: Vec<ObjectWarning>,
}

impl ReconcileOutcome {
    pub fn summary(&self) -> String {
        format!(
            "Reconciled {} objects, completed with {} warnings",
            self.reconciled.len(),
            self.warnings.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Actor {
    id: String,
    imprecise: bool,
}

struct Found {
    strategy: Strategy,
    records: Vec<Record>,
    imprecise_actor: bool,
}

/// Identifies records created by a completed migration.
pub struct Reconciler {
    source: Arc<dyn RecordStore>,
    target: Arc<dyn RecordStore>,
    chunk_size: usize,
    concurrency: usize,
    allow_imprecise_actor: bool,
    policy: PartialValuePolicy,
    actor: OnceCell<Option<Actor>>,
}

impl Reconciler {
    pub fn new(source: Arc<dyn RecordStore>, target: Arc<dyn RecordStore>) -> Self {
        Self {
            source,
            target,
            chunk_size: 200,
            concurrency: 1,
            allow_imprecise_actor: false,
            policy: PartialValuePolicy::default(),
            actor: OnceCell::new(),
        }
    }

    /// External id values per target query.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Allow falling back to the most recently active user.
    pub fn allow_imprecise_actor(mut self, allow: bool) -> Self {
        self.allow_imprecise_actor = allow;
        self
    }

    pub fn with_partial_policy(mut self, policy: PartialValuePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Reconcile every pure-create object of the manifest at `manifest_path`
    /// and save the enriched manifest in place.
    pub async fn run(
        &self,
        manifest_path: &Path,
        window: Option<&RunWindow>,
    ) -> Result<ReconcileOutcome> {
        let mut manifest = BackupManifest::load(manifest_path)?;
        let dir = manifest_dir(manifest_path);

        // Entries are addressed by position; one object type may appear in
        // several phases of the same manifest.
        let candidates: Vec<usize> = manifest
            .objects
            .iter()
            .enumerate()
            .filter(|(_, o)| o.operation.is_pure_create())
            .filter(|(_, o)| {
                if o.is_reconciled() {
                    debug!("{}: already reconciled", o.object_type);
                }
                !o.is_reconciled()
            })
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            info!("No pure-create objects left to reconcile");
            return Ok(ReconcileOutcome {
                manifest,
                reconciled: Vec::new(),
                warnings: Vec::new(),
            });
        }

        let dir = dir.as_path();
        let stems = manifest.file_stems();
        let objects = &manifest.objects;
        let results: Vec<(usize, Result<Option<Found>>, Vec<ObjectWarning>)> =
            stream::iter(candidates.iter().copied())
                .map(|index| async move {
                    let mut warnings = Vec::new();
                    let result = self
                        .reconcile_object(&objects[index], dir, window, &mut warnings)
                        .await;
                    (index, result, warnings)
                })
                .buffered(self.concurrency)
                .collect()
                .await;

        let mut reconciled = Vec::new();
        let mut warnings = Vec::new();
        for (index, result, mut object_warnings) in results {
            warnings.append(&mut object_warnings);
            let entry = &mut manifest.objects[index];
            let object_type = entry.object_type.clone();
            match result {
                Ok(Some(found)) => {
                    let mut fields = vec![ID_FIELD.to_string()];
                    fields.extend(entry.external_id_spec.paths().iter().map(|p| p.to_string()));

                    let file_ref = format!("{}_created.csv", stems[index]);
                    let count =
                        tabular::write_records(&resolve_ref(dir, &file_ref), &found.records, &fields)?
                            as u64;
                    entry.post_migration_file_ref = Some(file_ref.clone());
                    entry.post_migration_record_count = Some(count);
                    info!(
                        "{}: identified {} created records ({:?})",
                        object_type, count, found.strategy
                    );
                    reconciled.push(ObjectReconciliation {
                        object_type,
                        strategy: found.strategy,
                        created_count: count,
                        file_ref,
                        imprecise_actor: found.imprecise_actor,
                    });
                }
                Ok(None) => {
                    let err = MigrateError::ambiguous(
                        &object_type,
                        "no strategy identified the created records; the object is left out of rollback",
                    );
                    warn!("{}", err);
                    warnings.push(ObjectWarning::from_error(&object_type, &err));
                }
                Err(e) => {
                    warn!("{}: reconciliation failed: {}", object_type, e);
                    warnings.push(ObjectWarning::from_error(&object_type, &e));
                }
            }
        }

        if reconciled.is_empty() {
            return Err(MigrateError::NothingProcessed(format!(
                "none of {} pure-create objects could be reconciled",
                candidates.len()
            )));
        }

        manifest.save(manifest_path)?;
        Ok(ReconcileOutcome {
            manifest,
            reconciled,
            warnings,
        })
    }

    async fn reconcile_object(
        &self,
        object: &BackupObject,
        dir: &Path,
        window: Option<&RunWindow>,
        warnings: &mut Vec<ObjectWarning>,
    ) -> Result<Option<Found>> {
        let existing = pre_migration_ids(object, dir)?;
        let filter = where_clause(&object.original_query)?;

        let expected = match self.by_external_id(object, filter.as_deref(), &existing).await {
            Ok((records, _)) if !records.is_empty() => {
                return Ok(Some(Found {
                    strategy: Strategy::ExternalId,
                    records,
                    imprecise_actor: false,
                }));
            }
            Ok((_, expected)) => Some(expected),
            Err(e) => {
                warn!("{}: external id correlation failed: {}", object.object_type, e);
                None
            }
        };

        let Some(window) = window else {
            debug!(
                "{}: no run window recorded, time window strategy unavailable",
                object.object_type
            );
            return Ok(None);
        };
        let Some(actor) = self.actor(window).await? else {
            return Ok(None);
        };
        if actor.imprecise {
            warnings.push(ObjectWarning::new(
                &object.object_type,
                "imprecise_actor",
                format!(
                    "created-by filter uses the most recently active user {}",
                    actor.id
                ),
            ));
        }

        let records = self
            .by_time_window(object, filter.as_deref(), window, &actor, &existing)
            .await?;
        if records.is_empty() {
            return Ok(None);
        }

        let expected = match expected {
            Some(n) => Some(n),
            None => match self.expected_count(object, filter.as_deref()).await {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(
                        "{}: could not count source records, skipping the count check: {}",
                        object.object_type, e
                    );
                    None
                }
            },
        };
        if let Some(expected) = expected.filter(|&n| records.len() as u64 > n) {
            let message = format!(
                "time window found {} records but the source query matches only {}",
                records.len(),
                expected
            );
            warn!("{}: {}", object.object_type, message);
            warnings.push(ObjectWarning::new(&object.object_type, "count_mismatch", message));
        }

        Ok(Some(Found {
            strategy: Strategy::TimeWindow,
            records,
            imprecise_actor: actor.imprecise,
        }))
    }

    /// Strategy 1. Returns the created records and the number of eligible
    /// source records.
    async fn by_external_id(
        &self,
        object: &BackupObject,
        filter: Option<&str>,
        existing: &HashSet<String>,
    ) -> Result<(Vec<Record>, u64)> {
        let spec = &object.external_id_spec;
        let paths = spec.paths();
        let source_query = compose(
            &paths.join(", "),
            &object.object_type,
            &filter.map(|f| format!("WHERE {}", f)).unwrap_or_default(),
        );
        let source_records = self.source.query_all(&source_query).await?;
        let expected = source_records.len() as u64;

        let mut values: Vec<String> = Vec::new();
        for record in &source_records {
            if let Some(value) = spec.value_of(record) {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        debug!(
            "{}: {} eligible external id values on the source",
            object.object_type,
            values.len()
        );

        let mut select = vec![ID_FIELD];
        select.extend(paths.iter().copied().filter(|p| !p.eq_ignore_ascii_case(ID_FIELD)));
        let mut records = Vec::new();
        for chunk in values.chunks(self.chunk_size) {
            let Some(id_filter) = external_id_filter(&object.object_type, spec, chunk, self.policy)
            else {
                continue;
            };
            let query = compose(
                &select.join(", "),
                &object.object_type,
                &format!("WHERE {}", id_filter),
            );
            records.extend(self.target.query_all(&query).await?);
        }
        Ok((new_records(records, existing), expected))
    }

    /// Strategy 2.
    async fn by_time_window(
        &self,
        object: &BackupObject,
        filter: Option<&str>,
        window: &RunWindow,
        actor: &Actor,
        existing: &HashSet<String>,
    ) -> Result<Vec<Record>> {
        let mut conditions = created_within(window).to_vec();
        conditions.push(format!("CreatedById = {}", quote_literal(&actor.id)));
        if let Some(filter) = filter {
            conditions.extend(narrow(filter));
        }

        let mut select = vec![ID_FIELD];
        select.extend(
            object
                .external_id_spec
                .paths()
                .into_iter()
                .filter(|p| !p.eq_ignore_ascii_case(ID_FIELD)),
        );
        let query = compose(
            &select.join(", "),
            &object.object_type,
            &format!("WHERE {}", conditions.join(" AND ")),
        );
        debug!("{}: time window query {}", object.object_type, query);
        let records = self.target.query_all(&query).await?;
        Ok(new_records(records, existing))
    }

    async fn expected_count(&self, object: &BackupObject, filter: Option<&str>) -> Result<u64> {
        let query = compose(
            ID_FIELD,
            &object.object_type,
            &filter.map(|f| format!("WHERE {}", f)).unwrap_or_default(),
        );
        self.source.count(&query).await
    }

    /// The integration user's id on the target, resolved once per run.
    async fn actor(&self, window: &RunWindow) -> Result<Option<Actor>> {
        let actor = self
            .actor
            .get_or_try_init(|| self.resolve_actor(window.username.as_deref()))
            .await?;
        Ok(actor.clone())
    }

    async fn resolve_actor(&self, username: Option<&str>) -> Result<Option<Actor>> {
        if let Some(username) = username {
            let query = format!(
                "SELECT Id, Username FROM {} WHERE Username = {}",
                USER_OBJECT,
                quote_literal(username)
            );
            let users = self.target.query_all(&query).await?;
            if let [user] = users.as_slice() {
                if let Some(id) = record_id(user) {
                    return Ok(Some(Actor {
                        id,
                        imprecise: false,
                    }));
                }
            }
            warn!(
                "Username {} matched {} users on {}",
                username,
                users.len(),
                self.target.store_name()
            );
        }

        if !self.allow_imprecise_actor {
            warn!("No exact actor match and the most-recent-user fallback is disabled");
            return Ok(None);
        }

        let query = format!(
            "SELECT Id, Username FROM {} WHERE IsActive = true ORDER BY LastLoginDate DESC LIMIT 1",
            USER_OBJECT
        );
        let users = self.target.query_all(&query).await?;
        let actor = users.first().and_then(record_id).map(|id| Actor {
            id,
            imprecise: true,
        });
        if let Some(actor) = &actor {
            warn!(
                "Falling back to most recently active user {}; created-record detection is imprecise",
                actor.id
            );
        }
        Ok(actor)
    }
}

/// Conjuncts of the original filter that are safe to reuse in the time
/// window query: nothing time- or actor-scoped, no store-local id lists.
pub fn narrow(filter: &str) -> Vec<String> {
    split_conjuncts(filter)
        .into_iter()
        .filter(|condition| {
            let Some(field) = leading_field(condition) else {
                return true;
            };
            let time_or_actor = TIME_ACTOR_FIELDS
                .iter()
                .any(|f| f.eq_ignore_ascii_case(field) || field.ends_with(&format!(".{}", f)))
                || ACTOR_RELATIONSHIPS.iter().any(|r| field.starts_with(r));
            let id_list = field.ends_with("Id") && condition.to_ascii_uppercase().contains(" IN ");
            !(time_or_actor || id_list)
        })
        .collect()
}

/// `CreatedDate` bounds covering the whole run window.
///
/// Datetime literals carry whole seconds, so a bound with a fractional part
/// is widened to the enclosing second instead of being truncated into the
/// window.
pub fn created_within(window: &RunWindow) -> [String; 2] {
    let start = window.started_at;
    let lower = if start.nanosecond() == 0 {
        format!("CreatedDate > {}", datetime_literal(&start))
    } else {
        format!("CreatedDate >= {}", datetime_literal(&start.trunc_subsecs(0)))
    };

    let finish = window.finished_at;
    let upper_bound = if finish.nanosecond() == 0 {
        finish
    } else {
        finish.trunc_subsecs(0) + Duration::seconds(1)
    };
    [
        lower,
        format!("CreatedDate < {}", datetime_literal(&upper_bound)),
    ]
}

fn pre_migration_ids(object: &BackupObject, dir: &Path) -> Result<HashSet<String>> {
    let Some(file_ref) = &object.backup_file_ref else {
        return Ok(HashSet::new());
    };
    let path = resolve_ref(dir, file_ref);
    if !path.exists() {
        warn!(
            "{}: snapshot {} is missing, pre-existing records cannot be excluded",
            object.object_type,
            path.display()
        );
        return Ok(HashSet::new());
    }
    Ok(tabular::read_table(&path)?
        .column(ID_FIELD)
        .into_iter()
        .collect())
}

fn new_records(records: Vec<Record>, existing: &HashSet<String>) -> Vec<Record> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| match record_id(r) {
            Some(id) => !existing.contains(&id) && seen.insert(id),
            None => false,
        })
        .collect()
}
