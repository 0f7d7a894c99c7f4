use crate::address::normalize;
use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRecord {
    #[serde(alias = "school", default)]
    pub organization: String,
    #[serde(default)]
    pub subject: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SendError,
    Bounce,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::SendError => write!(f, "send_error"),
            FailureReason::Bounce => write!(f, "bounce"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub reason: FailureReason,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Failed to read ledger file {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed ledger file {path}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write ledger file {path}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to encode ledger")]
    Encode(#[from] serde_json::Error),
}

/// Durable record of per-address send outcomes.
///
/// Both stores are loaded fully at start and rewritten fully on every
/// `persist`. An address lives in at most one of them.
#[derive(Debug)]
pub struct SendLedger {
    sent_path: PathBuf,
    failed_path: PathBuf,
    sent: BTreeMap<String, SentRecord>,
    failed: BTreeMap<String, FailedRecord>,
    dirty: bool,
}

impl SendLedger {
    /// Load both stores. Missing files start empty.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        sent_path: P,
        failed_path: Q,
    ) -> Result<Self, LedgerError> {
        let sent_path = sent_path.as_ref().to_path_buf();
        let failed_path = failed_path.as_ref().to_path_buf();

        let sent: BTreeMap<String, SentRecord> = read_store(&sent_path)?;
        let mut failed: BTreeMap<String, FailedRecord> = read_store(&failed_path)?;

        let sent: BTreeMap<String, SentRecord> = sent
            .into_iter()
            .map(|(address, record)| (normalize(&address), record))
            .collect();
        let failed_count = failed.len();
        failed = failed
            .into_iter()
            .map(|(address, record)| (normalize(&address), record))
            .filter(|(address, _)| !sent.contains_key(address))
            .collect();
        if failed.len() != failed_count {
            log::warn!(
                "Dropped {} failed entries that were also recorded as sent",
                failed_count - failed.len()
            );
        }

        log::debug!(
            "Loaded ledger: {} sent ({}), {} failed ({})",
            sent.len(),
            sent_path.display(),
            failed.len(),
            failed_path.display()
        );

        Ok(Self {
            sent_path,
            failed_path,
            sent,
            failed,
            dirty: false,
        })
    }

    pub fn is_sent(&self, address: &str) -> bool {
        self.sent.contains_key(&normalize(address))
    }

    pub fn is_failed(&self, address: &str) -> bool {
        self.failed.contains_key(&normalize(address))
    }

    pub fn failed_reason(&self, address: &str) -> Option<FailureReason> {
        self.failed.get(&normalize(address)).map(|r| r.reason)
    }

    pub fn sent_record(&self, address: &str) -> Option<&SentRecord> {
        self.sent.get(&normalize(address))
    }

    pub fn sent(&self) -> &BTreeMap<String, SentRecord> {
        &self.sent
    }

    pub fn failed(&self) -> &BTreeMap<String, FailedRecord> {
        &self.failed
    }

    /// Record a successful send. Clears any failed entry for the address.
    pub fn record_sent(&mut self, address: &str, organization: &str, subject: &str, date: NaiveDate) {
        let key = normalize(address);
        self.failed.remove(&key);
        self.sent.insert(
            key,
            SentRecord {
                organization: organization.to_string(),
                subject: subject.to_string(),
                date,
            },
        );
        self.dirty = true;
    }

    /// Record a failure. Refused for addresses already marked sent.
    pub fn record_failed(&mut self, address: &str, reason: FailureReason) -> bool {
        let key = normalize(address);
        if self.sent.contains_key(&key) {
            log::warn!("Not marking {key} as failed ({reason}): already recorded as sent");
            return false;
        }
        self.failed.insert(key, FailedRecord { reason });
        self.dirty = true;
        true
    }

    /// Delete a sent entry. Absent addresses are a no-op.
    pub fn remove_sent(&mut self, address: &str) -> Option<SentRecord> {
        let removed = self.sent.remove(&normalize(address));
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn remove_failed(&mut self, address: &str) -> Option<FailedRecord> {
        let removed = self.failed.remove(&normalize(address));
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Number of distinct calendar days present among sent records
    pub fn distinct_send_days(&self) -> usize {
        self.sent
            .values()
            .map(|r| r.date)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write both stores in full.
    pub fn persist(&mut self) -> Result<(), LedgerError> {
        write_store(&self.sent_path, &self.sent)?;
        write_store(&self.failed_path, &self.failed)?;
        self.dirty = false;
        Ok(())
    }
}

/// Run-scoped address -> error detail map, written at the end of a run.
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: BTreeMap<String, String>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, address: &str, detail: impl Into<String>) {
        self.entries.insert(normalize(address), detail.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, address: &str) -> Option<&str> {
        self.entries.get(&normalize(address)).map(String::as_str)
    }

    pub fn persist<P: AsRef<Path>>(&self, path: P) -> Result<(), LedgerError> {
        write_store(path.as_ref(), &self.entries)
    }
}

fn read_store<T: DeserializeOwned + Default>(path: &Path) -> Result<T, LedgerError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path).map_err(|source| LedgerError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&content).map_err(|source| LedgerError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// temp file + fsync + rename so a kill mid-write never truncates the store
fn write_store<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    let content = serde_json::to_string_pretty(value)?;
    let write_err = |source: std::io::Error| LedgerError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp_path).map_err(write_err)?;
    file.write_all(content.as_bytes()).map_err(write_err)?;
    file.write_all(b"\n").map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn ledger_in(dir: &Path) -> SendLedger {
        SendLedger::load(dir.join("sent_log.json"), dir.join("failed_log.json")).unwrap()
    }

    #[test]
    fn test_load_missing_files_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(dir.path());
        assert!(ledger.sent().is_empty());
        assert!(ledger.failed().is_empty());
        assert_eq!(ledger.distinct_send_days(), 0);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sent_log.json"), "{ not json").unwrap();
        let result = SendLedger::load(
            dir.path().join("sent_log.json"),
            dir.path().join("failed_log.json"),
        );
        assert!(matches!(result, Err(LedgerError::Parse { .. })));
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = ledger_in(dir.path());
        ledger.record_sent("A@School.org", "Cedar Ridge", "Hello", date("2024-09-03"));
        ledger.record_failed("b@school.org", FailureReason::SendError);
        assert!(ledger.is_dirty());
        ledger.persist().unwrap();
        assert!(!ledger.is_dirty());
        assert!(!dir.path().join("sent_log.json.tmp").exists());

        let reloaded = ledger_in(dir.path());
        assert!(reloaded.is_sent("a@school.org"));
        assert_eq!(
            reloaded.sent_record("a@school.org").unwrap().organization,
            "Cedar Ridge"
        );
        assert_eq!(
            reloaded.failed_reason("B@SCHOOL.ORG"),
            Some(FailureReason::SendError)
        );
    }

    #[test]
    fn test_loads_legacy_sent_format() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("sent_log.json"),
            r#"{"old@school.org": {"school": "Westwood High", "date": "2024-08-30"}}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("failed_log.json"),
            r#"{"gone@school.org": {"reason": "bounce"}}"#,
        )
        .unwrap();

        let ledger = ledger_in(dir.path());
        let record = ledger.sent_record("old@school.org").unwrap();
        assert_eq!(record.organization, "Westwood High");
        assert_eq!(record.subject, "");
        assert_eq!(record.date, date("2024-08-30"));
        assert_eq!(
            ledger.failed_reason("gone@school.org"),
            Some(FailureReason::Bounce)
        );
    }

    #[test]
    fn test_sent_and_failed_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = ledger_in(dir.path());

        ledger.record_failed("x@school.org", FailureReason::SendError);
        ledger.record_sent("x@school.org", "", "", date("2024-09-03"));
        assert!(ledger.is_sent("x@school.org"));
        assert!(!ledger.is_failed("x@school.org"));

        assert!(!ledger.record_failed("x@school.org", FailureReason::SendError));
        assert!(!ledger.is_failed("x@school.org"));
    }

    #[test]
    fn test_remove_sent_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = ledger_in(dir.path());
        ledger.record_sent("x@school.org", "", "", date("2024-09-03"));
        ledger.persist().unwrap();

        assert!(ledger.remove_sent("x@school.org").is_some());
        assert!(ledger.remove_sent("x@school.org").is_none());
        assert!(ledger.remove_sent("never@school.org").is_none());
        assert!(!ledger.is_sent("x@school.org"));
    }

    #[test]
    fn test_remove_failed_returns_reason() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = ledger_in(dir.path());
        ledger.record_failed("x@school.org", FailureReason::Bounce);
        ledger.persist().unwrap();

        let removed = ledger.remove_failed("X@School.org").unwrap();
        assert_eq!(removed.reason, FailureReason::Bounce);
        assert!(ledger.is_dirty());
        assert!(ledger.remove_failed("x@school.org").is_none());
        assert!(!ledger.is_failed("x@school.org"));
    }

    #[test]
    fn test_write_error_reports_cause_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sent_log.json.tmp")).unwrap();
        let mut ledger = ledger_in(dir.path());
        ledger.record_sent("x@school.org", "", "", date("2024-09-03"));

        let err = ledger.persist().unwrap_err();
        assert!(matches!(err, LedgerError::Write { .. }));
        let cause = std::error::Error::source(&err).unwrap().to_string();
        assert!(!err.to_string().contains(&cause));
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(chain.matches(&cause).count(), 1);
    }

    #[test]
    fn test_distinct_send_days() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = ledger_in(dir.path());
        ledger.record_sent("a@s.org", "", "", date("2024-09-02"));
        ledger.record_sent("b@s.org", "", "", date("2024-09-02"));
        ledger.record_sent("c@s.org", "", "", date("2024-09-03"));
        ledger.record_sent("d@s.org", "", "", date("2024-09-05"));
        assert_eq!(ledger.distinct_send_days(), 3);
    }

    #[test]
    fn test_error_log_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error_log.json");
        let mut errors = ErrorLog::new();
        assert!(errors.is_empty());
        errors.record("X@school.org", "550 mailbox unavailable");
        errors.persist(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let parsed: BTreeMap<String, String> = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["x@school.org"], "550 mailbox unavailable");
    }
}
