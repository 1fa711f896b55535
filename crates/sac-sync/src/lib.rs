use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use sac_core::RawPackageRecord;
use serde::{Deserialize, Serialize};

/// The document store allows 50 writes per 10 seconds.
pub const UPLOAD_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("remote write failed for {item}: {message}")]
    Remote { item: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UploadTest {
    pub test_id: String,
    pub name: String,
}

/// One package entry of an upload document.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UploadSac {
    pub sac_code: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub bottleware: Option<String>,
    #[serde(default)]
    pub tests: Option<Vec<UploadTest>>,
}

/// Natural ids already present remotely, mapped to their store record ids.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct RemoteIndex {
    #[serde(default)]
    pub tests: BTreeMap<String, String>,
    #[serde(default)]
    pub sacs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SacWrite {
    pub sac_code: String,
    pub name: String,
    pub description: String,
    pub bottleware: String,
    /// Natural test ids; resolved to record ids at execution time.
    pub test_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SacUpdate {
    pub record_id: String,
    pub write: SacWrite,
}

/// Payload sent to the store for a package create or update.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SacPayload {
    pub sac_code: String,
    pub name: String,
    pub description: String,
    pub bottleware: String,
    pub tests: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct SyncPlan {
    pub tests_to_create: Vec<UploadTest>,
    pub skipped_tests: Vec<String>,
    pub sacs_to_update: Vec<SacUpdate>,
    pub sacs_to_create: Vec<SacWrite>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SyncSummary {
    pub unique_tests: usize,
    pub tests_to_create: usize,
    pub skipped_tests: usize,
    pub sacs_to_update: usize,
    pub sacs_to_create: usize,
    pub write_count: usize,
    pub estimated_duration_ms: u128,
}

impl SyncPlan {
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.tests_to_create.len() + self.sacs_to_update.len() + self.sacs_to_create.len()
    }

    #[must_use]
    pub fn estimated_duration(&self) -> Duration {
        UPLOAD_DELAY * u32::try_from(self.write_count()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn summary(&self) -> SyncSummary {
        SyncSummary {
            unique_tests: self.tests_to_create.len() + self.skipped_tests.len(),
            tests_to_create: self.tests_to_create.len(),
            skipped_tests: self.skipped_tests.len(),
            sacs_to_update: self.sacs_to_update.len(),
            sacs_to_create: self.sacs_to_create.len(),
            write_count: self.write_count(),
            estimated_duration_ms: self.estimated_duration().as_millis(),
        }
    }
}

/// Diff an upload document against what the store already holds.
///
/// Tests are keyed by `test_id` and packages by `sac_code`. Only the first
/// occurrence of a test id is kept. Packages without a tests array are skipped
/// with a warning.
#[must_use]
pub fn plan_upload(upload: &[UploadSac], remote: &RemoteIndex) -> SyncPlan {
    let mut plan = SyncPlan::default();
    let mut seen_tests = BTreeSet::new();

    for sac in upload {
        let Some(tests) = &sac.tests else {
            let label = if sac.name.trim().is_empty() {
                &sac.sac_code
            } else {
                &sac.name
            };
            tracing::warn!(sac = %label, "upload entry has no tests array, skipping");
            plan.warnings.push(format!(
                "SAC \"{label}\" is missing a 'tests' array. Skipping."
            ));
            continue;
        };

        for test in tests {
            if test.test_id.trim().is_empty() || !seen_tests.insert(test.test_id.clone()) {
                continue;
            }
            if remote.tests.contains_key(&test.test_id) {
                plan.skipped_tests.push(test.test_id.clone());
            } else {
                plan.tests_to_create.push(test.clone());
            }
        }
    }

    for sac in upload {
        let Some(tests) = &sac.tests else {
            continue;
        };

        let mut test_ids = Vec::new();
        for test in tests {
            let known =
                remote.tests.contains_key(&test.test_id) || seen_tests.contains(&test.test_id);
            if known && !test_ids.contains(&test.test_id) {
                test_ids.push(test.test_id.clone());
            }
        }

        let write = SacWrite {
            sac_code: sac.sac_code.clone(),
            name: sac.name.clone(),
            description: sac.description.clone().unwrap_or_default(),
            bottleware: sac.bottleware.clone().unwrap_or_default(),
            test_ids,
        };
        match remote.sacs.get(&sac.sac_code) {
            Some(record_id) => plan.sacs_to_update.push(SacUpdate {
                record_id: record_id.clone(),
                write,
            }),
            None => plan.sacs_to_create.push(write),
        }
    }

    tracing::debug!(
        tests_to_create = plan.tests_to_create.len(),
        sacs_to_update = plan.sacs_to_update.len(),
        sacs_to_create = plan.sacs_to_create.len(),
        "planned upload"
    );
    plan
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConsolidationUpdate {
    pub record_id: String,
    pub sac_code: String,
    pub name: String,
    pub tests: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConsolidationPlan {
    pub old_record_id: String,
    pub new_record_id: String,
    pub updates: Vec<ConsolidationUpdate>,
}

impl ConsolidationPlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Plan replacing one test record with another in every package that uses it.
///
/// # Errors
/// Returns [`SyncError::InvalidRequest`] when either id is blank or both ids
/// are the same.
pub fn plan_consolidation(
    packages: &[RawPackageRecord],
    old_record_id: &str,
    new_record_id: &str,
) -> Result<ConsolidationPlan, SyncError> {
    if old_record_id.trim().is_empty() || new_record_id.trim().is_empty() {
        return Err(SyncError::InvalidRequest(
            "both the test to remove and the test to keep MUST be selected".to_string(),
        ));
    }
    if old_record_id == new_record_id {
        return Err(SyncError::InvalidRequest(
            "the test to remove and the test to keep cannot be the same".to_string(),
        ));
    }

    let updates = packages
        .iter()
        .filter(|package| package.tests.iter().any(|id| id == old_record_id))
        .map(|package| {
            let mut tests = package
                .tests
                .iter()
                .filter(|id| *id != old_record_id)
                .cloned()
                .collect::<Vec<_>>();
            if !tests.iter().any(|id| id == new_record_id) {
                tests.push(new_record_id.to_string());
            }
            ConsolidationUpdate {
                record_id: package.record_id.clone(),
                sac_code: package.sac_code.clone(),
                name: package.name.clone(),
                tests,
            }
        })
        .collect::<Vec<_>>();

    Ok(ConsolidationPlan {
        old_record_id: old_record_id.to_string(),
        new_record_id: new_record_id.to_string(),
        updates,
    })
}

/// Write side of the document store.
pub trait RemoteWriter {
    /// Create a test record and return its store record id.
    ///
    /// # Errors
    /// Returns [`SyncError::Remote`] when the store rejects the write.
    fn create_test(&mut self, test: &UploadTest) -> Result<String, SyncError>;

    /// # Errors
    /// Returns [`SyncError::Remote`] when the store rejects the write.
    fn update_sac(&mut self, record_id: &str, payload: &SacPayload) -> Result<(), SyncError>;

    /// # Errors
    /// Returns [`SyncError::Remote`] when the store rejects the write.
    fn create_sac(&mut self, payload: &SacPayload) -> Result<(), SyncError>;

    /// # Errors
    /// Returns [`SyncError::Remote`] when the store rejects the write.
    fn replace_sac_tests(&mut self, record_id: &str, tests: &[String]) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WriteFailure {
    pub item: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ExecutionReport {
    pub tests_created: usize,
    pub sacs_updated: usize,
    pub sacs_created: usize,
    pub failures: Vec<WriteFailure>,
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

fn payload_for(write: &SacWrite, record_ids: &BTreeMap<String, String>) -> SacPayload {
    SacPayload {
        sac_code: write.sac_code.clone(),
        name: write.name.clone(),
        description: write.description.clone(),
        bottleware: write.bottleware.clone(),
        tests: write
            .test_ids
            .iter()
            .filter_map(|test_id| record_ids.get(test_id))
            .cloned()
            .collect(),
    }
}

/// Apply an upload plan one write at a time, pausing `delay` between writes.
///
/// Test creation happens first and any failure there aborts the run, since
/// packages would otherwise reference missing tests. Package write failures
/// are recorded and the run continues.
///
/// # Errors
/// Returns [`SyncError::Remote`] when a test record cannot be created.
pub fn execute_upload<W: RemoteWriter>(
    plan: &SyncPlan,
    remote: &RemoteIndex,
    writer: &mut W,
    delay: Duration,
) -> Result<ExecutionReport, SyncError> {
    let mut report = ExecutionReport::default();
    let mut record_ids = remote.tests.clone();

    for test in &plan.tests_to_create {
        let record_id = writer.create_test(test).inspect_err(|err| {
            tracing::error!(test_id = %test.test_id, error = %err, "failed to create test");
        })?;
        tracing::info!(test_id = %test.test_id, name = %test.name, "created test");
        record_ids.insert(test.test_id.clone(), record_id);
        report.tests_created += 1;
        pause(delay);
    }

    for update in &plan.sacs_to_update {
        let payload = payload_for(&update.write, &record_ids);
        match writer.update_sac(&update.record_id, &payload) {
            Ok(()) => {
                tracing::info!(sac_code = %payload.sac_code, "updated SAC");
                report.sacs_updated += 1;
            }
            Err(err) => {
                tracing::warn!(
                    sac_code = %payload.sac_code,
                    error = %err,
                    "failed to update SAC"
                );
                report.failures.push(WriteFailure {
                    item: payload.sac_code.clone(),
                    message: err.to_string(),
                });
            }
        }
        pause(delay);
    }

    for write in &plan.sacs_to_create {
        let payload = payload_for(write, &record_ids);
        match writer.create_sac(&payload) {
            Ok(()) => {
                tracing::info!(sac_code = %payload.sac_code, "created SAC");
                report.sacs_created += 1;
            }
            Err(err) => {
                tracing::warn!(
                    sac_code = %payload.sac_code,
                    error = %err,
                    "failed to create SAC"
                );
                report.failures.push(WriteFailure {
                    item: payload.sac_code.clone(),
                    message: err.to_string(),
                });
            }
        }
        pause(delay);
    }

    Ok(report)
}

/// Apply a consolidation plan with the same pacing as uploads.
#[must_use]
pub fn execute_consolidation<W: RemoteWriter>(
    plan: &ConsolidationPlan,
    writer: &mut W,
    delay: Duration,
) -> ExecutionReport {
    let mut report = ExecutionReport::default();
    for update in &plan.updates {
        match writer.replace_sac_tests(&update.record_id, &update.tests) {
            Ok(()) => {
                tracing::info!(sac_code = %update.sac_code, "consolidated SAC tests");
                report.sacs_updated += 1;
            }
            Err(err) => {
                tracing::warn!(
                    sac_code = %update.sac_code,
                    error = %err,
                    "failed to consolidate SAC"
                );
                report.failures.push(WriteFailure {
                    item: update.sac_code.clone(),
                    message: err.to_string(),
                });
            }
        }
        pause(delay);
    }
    report
}
