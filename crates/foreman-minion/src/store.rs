use crate::record::{MinionRecord, MinionSpec};
use crate::transition;
use chrono::{DateTime, Utc};
use foreman_core::fs::{append_jsonl_line, read_jsonl, write_atomic_async};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const STATUS_FILE: &str = "status.json";
const LOCK_FILE: &str = "status.lock";
const TRANSCRIPT_FILE: &str = "transcript.jsonl";
const LOG_FILE: &str = "worker.log";
const ARCHIVE_DIR: &str = "archive";
const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// One line of a minion's `transcript.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinionLogEntry {
    pub at: DateTime<Utc>,
    pub fire_seq: u64,
    pub event: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Exclusive-create lock file guarding one record.
///
/// The file holds a random owner token and only the owner removes it.
/// Stale locks are broken under a second exclusive-create guard, so of
/// several processes racing to break the same lock exactly one succeeds.
struct StatusLock {
    path: PathBuf,
    token: String,
}

impl StatusLock {
    async fn acquire(path: PathBuf, stale: Duration) -> ForemanResult<Self> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let started = Instant::now();
        loop {
            match create_lock(&path, &token).await {
                Ok(()) => return Ok(Self { path, token }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let is_stale = lock_age(&path).await.is_some_and(|age| age > stale);
                    if is_stale && break_stale(&path, stale, &token).await {
                        continue;
                    }
                    if started.elapsed() > LOCK_WAIT {
                        return Err(ForemanError::Minion(format!(
                            "Timed out waiting for {}",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Whether the lock file still carries our token.
    async fn is_held(&self) -> bool {
        tokio::fs::read_to_string(&self.path)
            .await
            .is_ok_and(|owner| owner == self.token)
    }

    /// Fails when another process broke our lock while we held it.
    async fn ensure_held(&self) -> ForemanResult<()> {
        if self.is_held().await {
            Ok(())
        } else {
            Err(ForemanError::Minion(format!(
                "Lost status lock {}",
                self.path.display()
            )))
        }
    }
}

impl Drop for StatusLock {
    fn drop(&mut self) {
        let owned = std::fs::read_to_string(&self.path).is_ok_and(|owner| owner == self.token);
        if owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn create_lock(path: &Path, token: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(token.as_bytes()).await?;
    file.flush().await
}

/// Remove a stale lock while holding `status.lock.break`. The age is checked
/// again under the guard, so a breaker that lost the race finds the winner's
/// fresh lock and leaves it alone. Returns whether the lock was removed.
async fn break_stale(path: &Path, stale: Duration, token: &str) -> bool {
    let guard = path.with_extension("lock.break");
    match create_lock(&guard, token).await {
        Ok(()) => {
            let still_stale = lock_age(path).await.is_some_and(|age| age > stale);
            if still_stale {
                warn!(lock = %path.display(), "Breaking stale status lock");
                let _ = tokio::fs::remove_file(path).await;
            }
            let _ = tokio::fs::remove_file(&guard).await;
            still_stale
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // A breaker that died mid-break.
            if lock_age(&guard).await.is_some_and(|age| age > stale) {
                let _ = tokio::fs::remove_file(&guard).await;
            }
            false
        }
        Err(e) => {
            warn!(lock = %path.display(), error = %e, "Could not break stale status lock");
            false
        }
    }
}

/// Filesystem registry of minions:
///
/// ```text
/// <root>/<id>/status.json
/// <root>/<id>/status.lock
/// <root>/<id>/transcript.jsonl
/// <root>/<id>/sessions/
/// <root>/<id>/artifacts/
/// <root>/<id>/worker.log
/// <root>/archive/<id>/
/// ```
///
/// The status file is only ever replaced whole through a temp file and
/// rename. Writers take `status.lock` and check the status and version they
/// read, so two processes cannot both apply a transition to the same record.
pub struct MinionStore {
    root: PathBuf,
    lock_stale: Duration,
}

impl MinionStore {
    pub async fn new(root: impl Into<PathBuf>) -> ForemanResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            lock_stale: Duration::from_secs(30),
        })
    }

    pub fn with_lock_stale(mut self, stale: Duration) -> Self {
        self.lock_stale = stale;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn minion_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Session history of the minion's runs.
    pub fn sessions_dir(&self, id: &str) -> PathBuf {
        self.minion_dir(id).join("sessions")
    }

    pub fn artifacts_dir(&self, id: &str) -> PathBuf {
        self.minion_dir(id).join("artifacts")
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.minion_dir(id).join(LOG_FILE)
    }

    fn status_path(&self, id: &str) -> PathBuf {
        self.minion_dir(id).join(STATUS_FILE)
    }

    /// Persist a new pending minion.
    pub async fn create(&self, spec: MinionSpec) -> ForemanResult<MinionRecord> {
        let record = MinionRecord::new(spec, Utc::now())?;
        let dir = self.minion_dir(&record.id);
        tokio::fs::create_dir_all(dir.join("sessions")).await?;
        tokio::fs::create_dir_all(dir.join("artifacts")).await?;
        self.write(&record).await?;
        info!(minion = %record.id, schedule = %record.schedule_label(), "Minion created");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> ForemanResult<MinionRecord> {
        match self.read(id).await? {
            Some(record) => Ok(record),
            None => Err(ForemanError::MinionNotFound(id.to_string())),
        }
    }

    async fn read(&self, id: &str) -> ForemanResult<Option<MinionRecord>> {
        match tokio::fs::read_to_string(self.status_path(id)).await {
            Ok(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| ForemanError::Minion(format!("Failed to parse minion {id}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, record: &MinionRecord) -> ForemanResult<()> {
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic_async(&self.status_path(&record.id), json).await
    }

    /// All live minions, oldest first. Unreadable records are skipped.
    pub async fn list(&self) -> ForemanResult<Vec<MinionRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() || entry.file_name() == ARCHIVE_DIR {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.read(&id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(minion = %id, error = %e, "Skipping unreadable minion"),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Replace `expected` with `next` if the stored record still has the
    /// status and version of `expected`. Fails with
    /// [`ForemanError::ClaimConflict`] otherwise.
    pub async fn swap(&self, expected: &MinionRecord, next: &MinionRecord) -> ForemanResult<()> {
        let lock = StatusLock::acquire(self.minion_dir(&expected.id).join(LOCK_FILE), self.lock_stale).await?;
        let current = self.get(&expected.id).await?;
        if current.status != expected.status || current.version != expected.version {
            debug!(
                minion = %expected.id,
                expected = expected.version,
                found = current.version,
                "Compare-and-swap lost"
            );
            return Err(ForemanError::ClaimConflict(expected.id.clone()));
        }
        lock.ensure_held().await?;
        self.write(next).await
    }

    /// Read the record under its lock, apply `change` and write the result.
    /// Returns the stored record, changed or not.
    pub async fn update<F>(&self, id: &str, change: F) -> ForemanResult<MinionRecord>
    where
        F: FnOnce(&MinionRecord) -> ForemanResult<Option<MinionRecord>>,
    {
        let lock = StatusLock::acquire(self.minion_dir(id).join(LOCK_FILE), self.lock_stale).await?;
        let current = self.get(id).await?;
        match change(&current)? {
            Some(next) => {
                lock.ensure_held().await?;
                self.write(&next).await?;
                Ok(next)
            }
            None => Ok(current),
        }
    }

    /// Kill a minion. Killing one that already ended is a no-op.
    pub async fn kill(&self, id: &str) -> ForemanResult<MinionRecord> {
        let record = self.update(id, |r| Ok(transition::kill(r, Utc::now()))).await?;
        info!(minion = %id, status = %record.status, "Kill requested");
        Ok(record)
    }

    /// Last record of a purged minion.
    pub async fn archived(&self, id: &str) -> ForemanResult<MinionRecord> {
        let path = self.root.join(ARCHIVE_DIR).join(id).join(STATUS_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| ForemanError::Minion(format!("Failed to parse archived minion {id}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ForemanError::MinionNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Kill a minion and move its directory under `archive/`.
    pub async fn purge(&self, id: &str) -> ForemanResult<PathBuf> {
        self.kill(id).await?;
        let archive = self.root.join(ARCHIVE_DIR);
        tokio::fs::create_dir_all(&archive).await?;
        let target = archive.join(id);
        if tokio::fs::try_exists(&target).await? {
            tokio::fs::remove_dir_all(&target).await?;
        }
        tokio::fs::rename(self.minion_dir(id), &target).await?;
        info!(minion = %id, archive = %target.display(), "Minion purged");
        Ok(target)
    }

    /// Append to the transcript of a live minion. Fails with
    /// [`ForemanError::MinionNotFound`] once the minion was purged; the
    /// directory is never re-created.
    pub async fn append_log(&self, id: &str, entry: &MinionLogEntry) -> ForemanResult<()> {
        match append_jsonl_line(&self.minion_dir(id).join(TRANSCRIPT_FILE), entry).await {
            Err(ForemanError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ForemanError::MinionNotFound(id.to_string()))
            }
            other => other,
        }
    }

    pub async fn transcript(&self, id: &str) -> ForemanResult<Vec<MinionLogEntry>> {
        read_jsonl(&self.minion_dir(id).join(TRANSCRIPT_FILE)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::{MinionStatus, Recurrence};

    async fn store() -> (tempfile::TempDir, MinionStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = MinionStore::new(tmp.path().join("minions")).await.unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let (_tmp, store) = store().await;
        let a = store
            .create(MinionSpec::new("check email").every(Recurrence::interval("1h").unwrap()))
            .await
            .unwrap();
        let b = store.create(MinionSpec::new("tidy logs")).await.unwrap();

        assert_eq!(store.get(&a.id).await.unwrap(), a);
        assert!(store.sessions_dir(&a.id).is_dir());
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|r| r.id == b.id));
        assert!(matches!(
            store.get("nope").await,
            Err(ForemanError::MinionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_swap_rejects_stale_version() {
        let (_tmp, store) = store().await;
        let m = store.create(MinionSpec::new("t")).await.unwrap();
        let now = Utc::now();
        let fired = transition::fire(&m, now, None).unwrap();
        store.swap(&m, &fired).await.unwrap();

        let again = transition::fire(&m, now, None).unwrap();
        assert!(matches!(
            store.swap(&m, &again).await,
            Err(ForemanError::ClaimConflict(_))
        ));
        assert_eq!(store.get(&m.id).await.unwrap().fire_seq, 1);
        assert!(!store.minion_dir(&m.id).join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let (_tmp, store) = store().await;
        let store = store.with_lock_stale(Duration::from_millis(1));
        let m = store.create(MinionSpec::new("t")).await.unwrap();
        std::fs::write(store.minion_dir(&m.id).join(LOCK_FILE), b"").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let killed = store.kill(&m.id).await.unwrap();
        assert_eq!(killed.status, MinionStatus::Killed);
    }

    fn age_lock(path: &Path, by: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(std::time::SystemTime::now() - by).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_breakers_share_one_stale_lock() {
        let (_tmp, store) = store().await;
        let m = store.create(MinionSpec::new("t")).await.unwrap();
        let lock_path = store.minion_dir(&m.id).join(LOCK_FILE);
        std::fs::write(&lock_path, b"crashed-owner").unwrap();
        age_lock(&lock_path, Duration::from_secs(3600));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = MinionStore::new(store.root()).await.unwrap();
            let id = m.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(&id, |r| {
                        let mut next = r.clone();
                        next.version += 1;
                        Ok(Some(next))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Every increment landed, so no two writers held the lock at once.
        assert_eq!(store.get(&m.id).await.unwrap().version, m.version + 8);
        assert!(!lock_path.exists());
        let leftovers = std::fs::read_dir(store.minion_dir(&m.id))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().contains("break"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_dropped_lock_spares_a_successor() {
        let (_tmp, store) = store().await;
        let m = store.create(MinionSpec::new("t")).await.unwrap();
        let lock_path = store.minion_dir(&m.id).join(LOCK_FILE);

        let lock = StatusLock::acquire(lock_path.clone(), Duration::from_secs(30)).await.unwrap();
        assert!(lock.is_held().await);
        std::fs::write(&lock_path, b"successor").unwrap();
        assert!(lock.ensure_held().await.is_err());
        drop(lock);

        assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), "successor");
    }

    #[tokio::test]
    async fn test_fresh_lock_is_not_broken() {
        let (_tmp, store) = store().await;
        let m = store.create(MinionSpec::new("t")).await.unwrap();
        let lock_path = store.minion_dir(&m.id).join(LOCK_FILE);
        std::fs::write(&lock_path, b"live-owner").unwrap();

        assert!(!break_stale(&lock_path, Duration::from_secs(30), "breaker").await);
        assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), "live-owner");
    }

    #[tokio::test]
    async fn test_purged_minion_rejects_log_entries() {
        let (_tmp, store) = store().await;
        let m = store.create(MinionSpec::new("t")).await.unwrap();
        store.purge(&m.id).await.unwrap();
        let entry = MinionLogEntry {
            at: Utc::now(),
            fire_seq: 1,
            event: "late".into(),
            detail: None,
        };
        assert!(matches!(
            store.append_log(&m.id, &entry).await,
            Err(ForemanError::MinionNotFound(_))
        ));
        assert!(!store.minion_dir(&m.id).exists());
    }

    #[tokio::test]
    async fn test_kill_twice_and_purge() {
        let (_tmp, store) = store().await;
        let m = store
            .create(MinionSpec::new("t").every(Recurrence::interval("5m").unwrap()))
            .await
            .unwrap();
        let first = store.kill(&m.id).await.unwrap();
        let second = store.kill(&m.id).await.unwrap();
        assert_eq!(first.version, second.version);

        let archived = store.purge(&m.id).await.unwrap();
        assert!(archived.join(STATUS_FILE).is_file());
        assert_eq!(store.archived(&m.id).await.unwrap().status, MinionStatus::Killed);
        assert!(matches!(store.get(&m.id).await, Err(ForemanError::MinionNotFound(_))));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transcript_roundtrip() {
        let (_tmp, store) = store().await;
        let m = store.create(MinionSpec::new("t")).await.unwrap();
        let entry = MinionLogEntry {
            at: Utc::now(),
            fire_seq: 1,
            event: "started".into(),
            detail: None,
        };
        store.append_log(&m.id, &entry).await.unwrap();
        assert_eq!(store.transcript(&m.id).await.unwrap(), vec![entry]);
    }
}
