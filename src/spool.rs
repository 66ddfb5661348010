//! Directory-spool broker connector.
//!
//! Each queue is a directory under the spool root with three areas:
//!
//! - `pending/`: messages waiting for a consumer
//! - `inflight/<instance>/`: messages claimed by one broker instance, not yet
//!   settled
//! - `dead/`: messages rejected without requeue
//!
//! A message is one JSON file. Consumers claim a message by renaming it from
//! `pending/` into their own in-flight directory, so several processes may
//! share a spool. Files are taken in name order; names start with a
//! millisecond timestamp.
//!
//! Every connected instance keeps a lease under `.leases/` fresh. `connect`
//! returns this instance's earlier claims to `pending/`, along with the
//! claims of any instance whose lease is missing or older than the lease
//! timeout. Claims of live peers are left alone.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskr_config::{BrokerSection, ConfigLoader};
use taskr_engine::{BrokerError, DeadLetter, DeadLetterSink, JobOutcome, Message, MessageBroker};

const LEASE_DIR: &str = ".leases";

/// Default age after which a peer's lease counts as abandoned.
const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// One of the three directories of a spool queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Area {
    Pending,
    InFlight,
    Dead,
}

impl Area {
    fn dir_name(self) -> &'static str {
        match self {
            Area::Pending => "pending",
            Area::InFlight => "inflight",
            Area::Dead => "dead",
        }
    }
}

/// On-disk form of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(default)]
    routing_key: Option<String>,

    /// Deliveries so far.
    #[serde(default)]
    delivery_count: u32,

    payload: String,
}

#[derive(Debug, Clone)]
struct Claim {
    queue: String,
    file: String,
}

/// Broker backed by a spool directory.
pub(crate) struct SpoolBroker {
    root: PathBuf,
    poll_interval: Duration,
    lease_timeout: Duration,
    instance: String,
    claims: DashMap<u64, Claim>,
    next_tag: AtomicU64,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl SpoolBroker {
    pub(crate) fn new(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            root: root.into(),
            poll_interval,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            instance: Uuid::new_v4().simple().to_string(),
            claims: DashMap::new(),
            next_tag: AtomicU64::new(0),
            heartbeat: Mutex::new(None),
        }
    }

    pub(crate) fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    /// Broker for `[broker]`; `None` when no spool directory is set.
    pub(crate) fn from_section(section: &BrokerSection) -> Option<Self> {
        section.spool_dir.as_deref().map(|dir| {
            Self::new(
                ConfigLoader::expand_path(dir),
                Duration::from_millis(section.poll_interval_ms),
            )
        })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn instance(&self) -> &str {
        &self.instance
    }

    fn area(&self, queue: &str, area: Area) -> Result<PathBuf, BrokerError> {
        validate_queue_name(queue)?;
        Ok(self.root.join(queue).join(area.dir_name()))
    }

    /// This instance's claim directory for `queue`.
    fn own_inflight(&self, queue: &str) -> Result<PathBuf, BrokerError> {
        Ok(self.area(queue, Area::InFlight)?.join(&self.instance))
    }

    fn lease_path(&self, instance: &str) -> PathBuf {
        self.root.join(LEASE_DIR).join(instance)
    }

    /// Whether `instance` still holds a lease younger than the timeout.
    async fn lease_is_live(&self, instance: &str) -> bool {
        if instance == self.instance {
            return false;
        }
        let Ok(body) = fs::read_to_string(self.lease_path(instance)).await else {
            return false;
        };
        let Ok(renewed_at) = body.trim().parse::<i64>() else {
            return false;
        };
        let age_ms = Utc::now().timestamp_millis().saturating_sub(renewed_at);
        u128::try_from(age_ms).map_or(true, |age| age < self.lease_timeout.as_millis())
    }

    /// Renew the lease now and keep renewing it in the background.
    async fn start_heartbeat(&self) -> Result<(), BrokerError> {
        let path = self.lease_path(&self.instance);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        renew_lease(&path).await?;

        let every = (self.lease_timeout / 3).max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = renew_lease(&path).await {
                    warn!(file = %path.display(), "Spool lease renewal failed: {}", e);
                }
            }
        });
        if let Some(previous) = self.heartbeat.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Write a new message into `queue`'s pending area.
    pub(crate) async fn enqueue(
        &self,
        queue: &str,
        routing_key: Option<&str>,
        payload: &str,
    ) -> Result<PathBuf, BrokerError> {
        let pending = self.area(queue, Area::Pending)?;
        fs::create_dir_all(&pending).await?;

        let envelope = Envelope {
            routing_key: routing_key.map(str::to_string),
            delivery_count: 0,
            payload: payload.to_string(),
        };
        let path = pending.join(message_file_name(Utc::now()));
        write_atomic(&path, &serde_json::to_vec(&envelope).map_err(io::Error::from)?).await?;
        debug!(queue, file = %path.display(), "Message spooled");
        Ok(path)
    }

    /// Move abandoned in-flight messages back to `pending/`.
    ///
    /// Abandoned means claimed by this instance or by an instance without a
    /// live lease. Claims held by this instance are forgotten, so this must
    /// only run while no consumer is active.
    pub(crate) async fn recover(&self) -> Result<usize, BrokerError> {
        self.claims.clear();

        let mut recovered = 0;
        let mut queues = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = queues.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Ok(queue) = entry.file_name().into_string() else {
                continue;
            };
            if validate_queue_name(&queue).is_err() {
                continue;
            }

            let pending = self.area(&queue, Area::Pending)?;
            for owner in claim_dirs(&self.area(&queue, Area::InFlight)?).await? {
                let Some(instance) = owner.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if self.lease_is_live(instance).await {
                    debug!(queue = %queue, instance, "Leaving claims of live peer");
                    continue;
                }
                let names = list_messages(&owner).await?;
                if !names.is_empty() {
                    fs::create_dir_all(&pending).await?;
                }
                for name in names {
                    match fs::rename(owner.join(&name), pending.join(&name)).await {
                        Ok(()) => recovered += 1,
                        // Recovered by another instance first.
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                if instance != self.instance {
                    let _ = fs::remove_dir(&owner).await;
                }
            }
        }

        if recovered > 0 {
            info!("Recovered {} unsettled spool message(s)", recovered);
        }
        Ok(recovered)
    }

    /// Number of files in one area; missing directories count as empty.
    ///
    /// The in-flight count covers every instance.
    pub(crate) async fn count(&self, queue: &str, area: Area) -> Result<usize, BrokerError> {
        let dir = self.area(queue, area)?;
        if area != Area::InFlight {
            return Ok(list_messages_or_empty(&dir).await?.len());
        }
        let mut total = 0;
        for owner in claim_dirs(&dir).await? {
            total += list_messages(&owner).await?.len();
        }
        Ok(total)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Message>, BrokerError> {
        let pending = self.area(queue, Area::Pending)?;
        let mut names = match list_messages(&pending).await {
            Ok(names) => names,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if names.is_empty() {
            return Ok(None);
        }
        names.sort();

        let inflight = self.own_inflight(queue)?;
        fs::create_dir_all(&inflight).await?;

        for name in names {
            let claimed = inflight.join(&name);
            match fs::rename(pending.join(&name), &claimed).await {
                Ok(()) => {}
                // Taken by another consumer.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            // Tracked from the rename on; a file stranded by a dropped
            // receive stays in this instance's directory until `connect`.
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            self.claims.insert(
                tag,
                Claim {
                    queue: queue.to_string(),
                    file: name.clone(),
                },
            );

            let mut envelope = match read_envelope(&claimed).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.claims.remove(&tag);
                    warn!(queue, file = %name, "Unreadable spool message moved to dead: {}", e);
                    let dead = self.area(queue, Area::Dead)?;
                    fs::create_dir_all(&dead).await?;
                    fs::rename(&claimed, dead.join(&name)).await?;
                    continue;
                }
            };
            envelope.delivery_count += 1;
            let body = serde_json::to_vec(&envelope).map_err(io::Error::from)?;
            if let Err(e) = write_atomic(&claimed, &body).await {
                self.claims.remove(&tag);
                return Err(e.into());
            }

            return Ok(Some(Message {
                payload: Bytes::from(envelope.payload),
                delivery_tag: tag,
                redelivered: envelope.delivery_count > 1,
                delivery_count: envelope.delivery_count,
                queue: queue.to_string(),
                routing_key: envelope.routing_key,
            }));
        }
        Ok(None)
    }

    fn take_claim(&self, tag: u64) -> Result<Claim, BrokerError> {
        self.claims
            .remove(&tag)
            .map(|(_, claim)| claim)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))
    }
}

#[async_trait]
impl MessageBroker for SpoolBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            BrokerError::Connection(format!("spool {}: {}", self.root.display(), e))
        })?;
        self.start_heartbeat().await?;
        self.recover().await?;
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Message, BrokerError> {
        loop {
            if let Some(message) = self.claim_next(queue).await? {
                return Ok(message);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let claim = self.take_claim(delivery_tag)?;
        let path = self.own_inflight(&claim.queue)?.join(&claim.file);
        fs::remove_file(path).await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let claim = self.take_claim(delivery_tag)?;
        let from = self.own_inflight(&claim.queue)?.join(&claim.file);
        let to_dir = self.area(
            &claim.queue,
            if requeue { Area::Pending } else { Area::Dead },
        )?;
        fs::create_dir_all(&to_dir).await?;
        fs::rename(from, to_dir.join(&claim.file)).await?;
        Ok(())
    }
}

impl Drop for SpoolBroker {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            heartbeat.abort();
            // Peers may take over the remaining claims right away.
            let _ = std::fs::remove_file(self.lease_path(&self.instance));
        }
    }
}

/// What a dead-letter file holds.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DeadLetterRecord {
    pub job_id: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub delivery_count: Option<u32>,
    pub payload: Option<String>,
    pub outcome: Option<JobOutcome>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl From<DeadLetter> for DeadLetterRecord {
    fn from(letter: DeadLetter) -> Self {
        let (queue, routing_key, delivery_count, payload) = match letter.message {
            Some(m) => (
                Some(m.queue),
                m.routing_key,
                Some(m.delivery_count),
                Some(String::from_utf8_lossy(&m.payload).into_owned()),
            ),
            None => (None, None, None, None),
        };
        Self {
            job_id: letter.job_id,
            queue,
            routing_key,
            delivery_count,
            payload,
            outcome: letter.outcome,
            reason: letter.reason,
            failed_at: letter.failed_at,
        }
    }
}

/// Dead-letter sink writing one JSON file per letter.
pub(crate) struct SpoolDeadLetterSink {
    dir: PathBuf,
}

impl SpoolDeadLetterSink {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DeadLetterSink for SpoolDeadLetterSink {
    async fn publish(&self, letter: DeadLetter) -> Result<(), BrokerError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(message_file_name(letter.failed_at));
        let record = DeadLetterRecord::from(letter);
        let body = serde_json::to_vec_pretty(&record).map_err(io::Error::from)?;
        write_atomic(&path, &body).await?;
        info!(job_id = ?record.job_id, file = %path.display(), "Dead letter written");
        Ok(())
    }
}

fn validate_queue_name(queue: &str) -> Result<(), BrokerError> {
    let valid = !queue.is_empty()
        && !queue.starts_with('.')
        && queue
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(BrokerError::Custom(format!(
            "invalid spool queue name '{}'",
            queue
        )))
    }
}

fn message_file_name(at: DateTime<Utc>) -> String {
    format!(
        "{:013}-{}.json",
        at.timestamp_millis().max(0),
        Uuid::new_v4().simple()
    )
}

/// Message file names in `dir`, skipping temporary files.
async fn list_messages(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Ok(name) = entry.file_name().into_string() {
            if !name.starts_with('.') && name.ends_with(".json") {
                names.push(name);
            }
        }
    }
    Ok(names)
}

async fn list_messages_or_empty(dir: &Path) -> io::Result<Vec<String>> {
    match list_messages(dir).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        other => other,
    }
}

/// Per-instance directories under a queue's `inflight/`.
async fn claim_dirs(inflight: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = match fs::read_dir(inflight).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

async fn renew_lease(path: &Path) -> io::Result<()> {
    write_atomic(path, Utc::now().timestamp_millis().to_string().as_bytes()).await
}

async fn read_envelope(path: &Path) -> io::Result<Envelope> {
    let body = fs::read(path).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Write through a dot-prefixed temporary file and rename into place.
async fn write_atomic(path: &Path, body: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "spool path has no file name"))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, path).await
}

#[cfg(test)]
#[path = "spool_tests.rs"]
mod tests;
