// State store - tracks all sandbox VM records with SQLite persistence
//
// In-memory DashMap for fast lookups, SQLite as the durable copy, plus an
// append-only lifecycle event journal. The transactional primitive the rest
// of the system leans on is `begin`: marker acquisition, legality check and
// transient-state write happen under a single record write lock.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::{Error, StoreError};
use crate::state_machine::{self, Disposition, TransitionPlan};
use crate::types::{
    Actor, EventOutcome, InstanceId, LifecycleAction, LifecycleEvent, OpId, VmId, VmRecord,
    VmStatus,
};

/// Result of acquiring the exclusivity marker for an operation.
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// Marker acquired; the record now sits in the plan's transient state.
    Started {
        op: OpId,
        plan: TransitionPlan,
        record: VmRecord,
    },
    /// The requested end state already holds; nothing to do.
    Noop(VmRecord),
}

pub struct VmStore {
    vms: DashMap<VmId, Arc<RwLock<VmRecord>>>,
    db_path: PathBuf,
}

impl VmStore {
    /// Open (or create) the store under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Corrupt {
            vm_id: String::new(),
            reason: format!("cannot create data dir {}: {e}", data_dir.display()),
        })?;
        let db_path = data_dir.join("sandboxes.db");
        Self::init_schema(&db_path)?;
        Ok(Self {
            vms: DashMap::new(),
            db_path,
        })
    }

    fn init_schema(db_path: &Path) -> Result<(), StoreError> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS vms (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                instance_id TEXT,
                status TEXT NOT NULL,
                spec TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_activity INTEGER NOT NULL,
                last_state_change INTEGER NOT NULL,
                pending_op TEXT,
                prior_status TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS lifecycle_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vm_id TEXT NOT NULL,
                action TEXT NOT NULL,
                outcome TEXT NOT NULL,
                actor TEXT NOT NULL,
                at INTEGER NOT NULL,
                detail TEXT
            )",
            [],
        )?;

        conn.execute("CREATE INDEX IF NOT EXISTS idx_vms_status ON vms(status)", [])?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_vm_id ON lifecycle_events(vm_id)",
            [],
        )?;

        Ok(())
    }

    /// Insert a newly created record. The record may already carry its
    /// creation marker (a create acquires exclusivity at birth).
    pub async fn insert(&self, record: VmRecord) -> Result<(), Error> {
        if self.vms.contains_key(&record.id) {
            return Err(Error::Validation(format!(
                "vm {} already exists",
                record.id
            )));
        }
        self.persist(&record)?;
        let vm_id = record.id;
        let status = record.status;
        self.vms.insert(vm_id, Arc::new(RwLock::new(record)));
        tracing::info!(vm_id = %vm_id, status = %status, "VM record inserted");
        Ok(())
    }

    fn cell(&self, id: VmId) -> Option<Arc<RwLock<VmRecord>>> {
        self.vms.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of a record.
    pub async fn get(&self, id: VmId) -> Option<VmRecord> {
        match self.cell(id) {
            Some(cell) => Some(cell.read().await.clone()),
            None => None,
        }
    }

    pub async fn list(&self) -> Vec<VmRecord> {
        let cells: Vec<_> = self
            .vms
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut records = Vec::with_capacity(cells.len());
        for cell in cells {
            records.push(cell.read().await.clone());
        }
        records
    }

    pub async fn list_by_status(&self, status: VmStatus) -> Vec<VmRecord> {
        let mut records = self.list().await;
        records.retain(|r| r.status == status);
        records
    }

    /// Records parked in a transient state, i.e. reconciliation candidates.
    pub async fn list_transient(&self) -> Vec<VmRecord> {
        let mut records = self.list().await;
        records.retain(|r| r.status.is_transient());
        records
    }

    /// Acquire the exclusivity marker and enter the transient state for
    /// `action`, atomically with respect to concurrent callers.
    ///
    /// The current status is re-read under the write lock, which closes the
    /// check-then-act race for sweepers acting on enumeration snapshots.
    /// Fails closed with `Conflict` when a marker is already held.
    pub async fn begin(
        &self,
        id: VmId,
        action: LifecycleAction,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, Error> {
        let cell = self.cell(id).ok_or(Error::NotFound(id))?;
        let mut record = cell.write().await;

        if record.pending_op.is_some() {
            return Err(Error::Conflict { vm_id: id });
        }

        let plan = match state_machine::plan(action, record.status) {
            Ok(Disposition::Proceed(plan)) => plan,
            Ok(Disposition::Noop) => return Ok(BeginOutcome::Noop(record.clone())),
            Err(illegal) => {
                return Err(Error::InvalidState {
                    vm_id: id,
                    current: illegal.from,
                    requested: action.as_str().to_string(),
                })
            }
        };

        let op = OpId::new();
        let prior = record.status;
        record.prior_status = Some(prior);
        record.pending_op = Some(op);
        record.status = plan.transient;
        record.last_state_change = now;
        self.persist(&record)?;

        tracing::debug!(
            vm_id = %id,
            action = %action,
            transient = %plan.transient,
            op = %op,
            "operation marker acquired"
        );

        Ok(BeginOutcome::Started {
            op,
            plan,
            record: record.clone(),
        })
    }

    /// Commit the terminal state of operation `op` and release the marker.
    ///
    /// Refuses with `Conflict` when `op` no longer holds the marker, which
    /// means the operation was already resolved elsewhere (typically by the
    /// reconciliation sweep after the original caller timed out).
    pub async fn commit(
        &self,
        id: VmId,
        op: OpId,
        status: VmStatus,
        now: DateTime<Utc>,
    ) -> Result<VmRecord, Error> {
        let cell = self.cell(id).ok_or(Error::NotFound(id))?;
        let mut record = cell.write().await;

        if record.pending_op != Some(op) {
            return Err(Error::Conflict { vm_id: id });
        }

        record.status = status;
        record.pending_op = None;
        record.prior_status = None;
        record.last_state_change = now;
        self.persist(&record)?;
        Ok(record.clone())
    }

    /// Return the record to its pre-operation stable state and release the
    /// marker. Same staleness guard as `commit`.
    pub async fn roll_back(&self, id: VmId, op: OpId, now: DateTime<Utc>) -> Result<VmRecord, Error> {
        let cell = self.cell(id).ok_or(Error::NotFound(id))?;
        let mut record = cell.write().await;

        if record.pending_op != Some(op) {
            return Err(Error::Conflict { vm_id: id });
        }

        let prior = record.prior_status.take().unwrap_or(VmStatus::Error);
        record.status = prior;
        record.pending_op = None;
        record.last_state_change = now;
        self.persist(&record)?;
        Ok(record.clone())
    }

    /// Attach the provider instance identifier. Write-once: a record's
    /// instance id never changes once set.
    pub async fn set_instance_id(&self, id: VmId, instance: InstanceId) -> Result<(), Error> {
        let cell = self.cell(id).ok_or(Error::NotFound(id))?;
        let mut record = cell.write().await;

        match &record.instance_id {
            Some(existing) if *existing != instance => {
                return Err(Error::Store(StoreError::Corrupt {
                    vm_id: id.to_string(),
                    reason: format!(
                        "instance id rewrite attempted: {existing} -> {instance}"
                    ),
                }))
            }
            Some(_) => return Ok(()),
            None => {}
        }

        record.instance_id = Some(instance);
        self.persist(&record)?;
        Ok(())
    }

    /// Move `last_activity` forward. Never moves it backwards.
    pub async fn record_activity(&self, id: VmId, at: DateTime<Utc>) -> Result<(), Error> {
        let cell = self.cell(id).ok_or(Error::NotFound(id))?;
        let mut record = cell.write().await;
        if at > record.last_activity {
            record.last_activity = at;
            self.persist(&record)?;
        }
        Ok(())
    }

    /// Append an audit entry. The journal is append-only; nothing updates
    /// or deletes rows.
    pub fn append_event(&self, event: &LifecycleEvent) -> Result<(), StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO lifecycle_events (vm_id, action, outcome, actor, at, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.vm_id.to_string(),
                event.action,
                event.outcome.as_str(),
                event.actor.as_str(),
                event.at.timestamp(),
                event.detail,
            ],
        )?;
        Ok(())
    }

    /// Audit entries for one VM, oldest first.
    pub fn events_for(&self, id: VmId) -> Result<Vec<LifecycleEvent>, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT vm_id, action, outcome, actor, at, detail
             FROM lifecycle_events WHERE vm_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![id.to_string()], |row| {
            let vm_id: String = row.get(0)?;
            let action: String = row.get(1)?;
            let outcome: String = row.get(2)?;
            let actor: String = row.get(3)?;
            let at: i64 = row.get(4)?;
            let detail: Option<String> = row.get(5)?;
            Ok((vm_id, action, outcome, actor, at, detail))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (vm_id, action, outcome, actor, at, detail) = row?;
            events.push(LifecycleEvent {
                vm_id: VmId::parse(&vm_id).ok_or_else(|| corrupt(&vm_id, "bad vm id"))?,
                action,
                outcome: EventOutcome::parse(&outcome)
                    .ok_or_else(|| corrupt(&vm_id, "bad event outcome"))?,
                actor: Actor::parse(&actor).ok_or_else(|| corrupt(&vm_id, "bad event actor"))?,
                at: timestamp(&vm_id, at)?,
                detail,
            });
        }
        Ok(events)
    }

    /// Reload every persisted record into memory. Called once at startup;
    /// records left in transient states are picked up by the next
    /// reconciliation sweep.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, owner, instance_id, status, spec, created_at,
                    last_activity, last_state_change, pending_op, prior_status
             FROM vms",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })?;

        let mut count = 0;
        for row in rows {
            let (id, owner, instance_id, status, spec, created_at, last_activity, last_state_change, pending_op, prior_status) =
                row?;

            let record = VmRecord {
                id: VmId::parse(&id).ok_or_else(|| corrupt(&id, "bad vm id"))?,
                owner: crate::types::OwnerRef::new(owner),
                instance_id: instance_id.map(InstanceId::new),
                status: VmStatus::parse(&status).ok_or_else(|| corrupt(&id, "bad status"))?,
                spec: serde_json::from_str(&spec)
                    .map_err(|e| corrupt(&id, &format!("bad spec: {e}")))?,
                created_at: timestamp(&id, created_at)?,
                last_activity: timestamp(&id, last_activity)?,
                last_state_change: timestamp(&id, last_state_change)?,
                pending_op: match pending_op {
                    Some(raw) => Some(OpId::parse(&raw).ok_or_else(|| corrupt(&id, "bad op id"))?),
                    None => None,
                },
                prior_status: match prior_status {
                    Some(raw) => {
                        Some(VmStatus::parse(&raw).ok_or_else(|| corrupt(&id, "bad prior status"))?)
                    }
                    None => None,
                },
            };

            self.vms
                .insert(record.id, Arc::new(RwLock::new(record)));
            count += 1;
        }

        tracing::info!(count, "recovered VM records from persistence");
        Ok(count)
    }

    fn persist(&self, record: &VmRecord) -> Result<(), StoreError> {
        let conn = Connection::open(&self.db_path)?;
        let spec = serde_json::to_string(&record.spec).map_err(|e| StoreError::Corrupt {
            vm_id: record.id.to_string(),
            reason: format!("unserializable spec: {e}"),
        })?;
        conn.execute(
            "INSERT OR REPLACE INTO vms (
                id, owner, instance_id, status, spec, created_at,
                last_activity, last_state_change, pending_op, prior_status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id.to_string(),
                record.owner.as_str(),
                record.instance_id.as_ref().map(|i| i.as_str()),
                record.status.as_str(),
                spec,
                record.created_at.timestamp(),
                record.last_activity.timestamp(),
                record.last_state_change.timestamp(),
                record.pending_op.map(|op| op.to_string()),
                record.prior_status.map(|s| s.as_str()),
            ],
        )?;
        Ok(())
    }
}

fn corrupt(vm_id: &str, reason: &str) -> StoreError {
    StoreError::Corrupt {
        vm_id: vm_id.to_string(),
        reason: reason.to_string(),
    }
}

fn timestamp(vm_id: &str, secs: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| corrupt(vm_id, &format!("bad timestamp {secs}")))
}
