//! Multi-instance coordination: session registry, read/write leases with TTL,
//! stale-session reclamation and context handoff.
//!
//! All state lives in the memory store. Every decision and the write it
//! implies run in one immediate transaction, so two processes sharing the
//! database file see a single serial order of grants.
pub mod sweeper;

pub use sweeper::spawn_sweeper;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{Edge, Lease, LeaseMode, Metadata, Node, NodeType, Session, SessionState};
use crate::memory_db::{coordination_store as rows, edge_store, node_store, MemoryStore};

pub const RELATION_HANDED_OFF_TO: &str = "handed_off_to";
const MAX_INSTANCE_ID_LEN: usize = 200;
const MAX_RESOURCE_KEY_LEN: usize = 1024;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub lease_ttl: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: std::time::Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::seconds(60),
            heartbeat_timeout: Duration::seconds(60),
            sweep_interval: std::time::Duration::from_secs(10),
        }
    }
}

/// How a lease request resolves against the leases already on the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantDecision {
    Grant,
    Renew,
    /// Sole reader asking for write.
    Upgrade,
    /// Writer asking for read keeps (and renews) its write lease.
    KeepWrite,
    Deny { held_by: String },
}

/// Decide a request given the unexpired leases on one key.
pub fn decide_grant(existing: &[Lease], requester: &str, mode: LeaseMode) -> GrantDecision {
    let own = existing.iter().find(|l| l.holder_instance_id == requester);
    let others: Vec<&Lease> = existing.iter().filter(|l| l.holder_instance_id != requester).collect();
    let other_writer = others.iter().find(|l| l.mode == LeaseMode::Write);

    match mode {
        LeaseMode::Write => {
            if let Some(blocker) = other_writer.or_else(|| others.first()) {
                return GrantDecision::Deny { held_by: blocker.holder_instance_id.clone() };
            }
            match own.map(|l| l.mode) {
                Some(LeaseMode::Write) => GrantDecision::Renew,
                Some(LeaseMode::Read) => GrantDecision::Upgrade,
                None => GrantDecision::Grant,
            }
        }
        LeaseMode::Read => {
            if let Some(writer) = other_writer {
                return GrantDecision::Deny { held_by: writer.holder_instance_id.clone() };
            }
            match own.map(|l| l.mode) {
                Some(LeaseMode::Write) => GrantDecision::KeepWrite,
                Some(LeaseMode::Read) => GrantDecision::Renew,
                None => GrantDecision::Grant,
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReclaimedSession {
    pub instance_id: String,
    pub released_leases: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReclaimReport {
    pub marked_stale: Vec<String>,
    pub reclaimed: Vec<ReclaimedSession>,
}

impl ReclaimReport {
    pub fn released_count(&self) -> usize {
        self.reclaimed.iter().map(|s| s.released_leases.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HandoffReceipt {
    pub edge: Edge,
    pub transferred: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct InstanceCoordinator {
    store: Arc<MemoryStore>,
    config: CoordinatorConfig,
}

/// Metric label for one acquire attempt.
fn lease_outcome(result: &Result<(Lease, GrantDecision)>) -> &'static str {
    match result {
        Ok((_, GrantDecision::Grant)) => "granted",
        Ok((_, GrantDecision::Upgrade)) => "upgraded",
        Ok(_) => "renewed",
        Err(MemoryError::Denied { .. }) => "denied",
        Err(MemoryError::Conflict(_)) => "conflict",
        Err(_) => "error",
    }
}

fn validate_instance_id(instance_id: &str) -> Result<()> {
    if instance_id.trim().is_empty() || instance_id.len() > MAX_INSTANCE_ID_LEN || instance_id.contains('\0') {
        return Err(MemoryError::invalid(format!(
            "instance id must be 1..={} bytes without NUL",
            MAX_INSTANCE_ID_LEN
        )));
    }
    Ok(())
}

fn validate_resource_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_RESOURCE_KEY_LEN {
        return Err(MemoryError::invalid(format!("resource key must be 1..={} bytes", MAX_RESOURCE_KEY_LEN)));
    }
    Ok(())
}

impl InstanceCoordinator {
    pub fn new(store: Arc<MemoryStore>, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn is_overdue(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now - session.last_heartbeat > self.config.heartbeat_timeout
    }

    fn is_active(&self, session: &Session, now: DateTime<Utc>) -> bool {
        session.state == SessionState::Active && !self.is_overdue(session, now)
    }

    fn require_active(&self, conn: &rusqlite::Connection, instance_id: &str, now: DateTime<Utc>) -> Result<Session> {
        match rows::get_session(conn, instance_id, &now)? {
            Some(session) if self.is_active(&session, now) => Ok(session),
            _ => Err(MemoryError::not_found(format!("active session '{}'", instance_id))),
        }
    }

    /// Record a status change on the session's graph node, if it exists.
    fn mark_session_node(
        &self,
        conn: &rusqlite::Connection,
        instance_id: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let node_id = Session::node_id(instance_id);
        if !node_store::node_exists(conn, &node_id)? {
            return Ok(());
        }
        let mut patch = Metadata::new();
        patch.insert("status".into(), json!(status));
        if status != "active" {
            patch.insert("ended_at".into(), json!(now.to_rfc3339()));
        }
        node_store::patch_metadata(conn, &node_id, patch, now)?;
        Ok(())
    }

    pub fn register(&self, instance_id: &str, role: &str, workspace_path: &str) -> Result<Session> {
        self.register_at(instance_id, role, workspace_path, Utc::now())
    }

    /// Create an active session and its `session:<id>` node. A stale session
    /// with the same id is reclaimed first.
    pub fn register_at(&self, instance_id: &str, role: &str, workspace_path: &str, now: DateTime<Utc>) -> Result<Session> {
        validate_instance_id(instance_id)?;
        let now = now.trunc_subsecs(6);
        let dim = self.store.embedding_dim();

        let session = self.store.write(|tx| {
            if let Some(existing) = rows::get_session(tx, instance_id, &now)? {
                if self.is_active(&existing, now) {
                    return Err(MemoryError::Conflict(format!("instance '{}' is already active", instance_id)));
                }
                let released = rows::release_all(tx, instance_id)?;
                rows::delete_session(tx, instance_id)?;
                self.mark_session_node(tx, instance_id, "reclaimed", now)?;
                info!(instance_id, released, "Reclaimed stale session on re-register");
            }

            rows::insert_session(tx, instance_id, role, workspace_path, &now)?;
            let node = Node::new(Session::node_id(instance_id), NodeType::Session, format!("{} session", role))
                .with_metadata("instance_id", instance_id)
                .with_metadata("role", role)
                .with_metadata("workspace_path", workspace_path)
                .with_metadata("status", "active")
                .with_metadata("started_at", now.to_rfc3339());
            node_store::upsert_node(tx, node, None, dim, now)?;

            rows::get_session(tx, instance_id, &now)?
                .ok_or_else(|| MemoryError::internal("session vanished inside its own transaction"))
        })?;

        info!(instance_id, role, workspace_path, "Instance registered");
        Ok(session)
    }

    pub fn heartbeat(&self, instance_id: &str) -> Result<bool> {
        self.heartbeat_at(instance_id, Utc::now())
    }

    /// Refresh liveness and renew every lease the instance holds.
    /// Returns `false` when the session does not exist.
    pub fn heartbeat_at(&self, instance_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let now = now.trunc_subsecs(6);
        let expires_at = now + self.config.lease_ttl;
        self.store.write(|tx| {
            let Some(session) = rows::get_session(tx, instance_id, &now)? else {
                return Ok(false);
            };
            rows::touch_session(tx, instance_id, &now)?;
            let renewed = rows::renew_all(tx, instance_id, &now, &expires_at)?;
            if session.state == SessionState::Stale {
                self.mark_session_node(tx, instance_id, "active", now)?;
                info!(instance_id, "Stale session revived by heartbeat");
            }
            debug!(instance_id, renewed, "Heartbeat");
            Ok(true)
        })
    }

    pub fn acquire_lease(&self, instance_id: &str, resource_key: &str, mode: LeaseMode) -> Result<Lease> {
        self.acquire_lease_at(instance_id, resource_key, mode, Utc::now())
    }

    pub fn acquire_lease_at(
        &self,
        instance_id: &str,
        resource_key: &str,
        mode: LeaseMode,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        validate_resource_key(resource_key)?;
        let now = now.trunc_subsecs(6);

        let result = self.store.write(|tx| {
            self.require_active(tx, instance_id, now)?;
            rows::purge_expired(tx, Some(resource_key), &now)?;
            let existing = rows::leases_for(tx, resource_key, &now)?;
            let (lease, decision) = self.plan_grant(&existing, instance_id, resource_key, mode, now)?;
            rows::put_lease(tx, &lease)?;
            Ok((lease, decision))
        });

        crate::metrics::record_lease_decision(lease_outcome(&result));
        match result {
            Ok((lease, decision)) => {
                debug!(instance_id, resource_key, mode = lease.mode.as_str(), ?decision, "Lease granted");
                Ok(lease)
            }
            Err(e) => {
                if let MemoryError::Denied { held_by, .. } = &e {
                    debug!(instance_id, resource_key, held_by = %held_by, "Lease denied");
                }
                Err(e)
            }
        }
    }

    /// The lease `instance_id` would hold after a request against `existing`.
    /// Pure; the single-writer index still guards the insert.
    fn plan_grant(
        &self,
        existing: &[Lease],
        instance_id: &str,
        resource_key: &str,
        mode: LeaseMode,
        now: DateTime<Utc>,
    ) -> Result<(Lease, GrantDecision)> {
        let own = existing.iter().find(|l| l.holder_instance_id == instance_id);
        let decision = decide_grant(existing, instance_id, mode);
        let (granted_mode, acquired_at) = match &decision {
            GrantDecision::Deny { held_by } => {
                return Err(MemoryError::Denied {
                    resource_key: resource_key.to_string(),
                    held_by: held_by.clone(),
                })
            }
            GrantDecision::Grant | GrantDecision::Upgrade => (mode, now),
            GrantDecision::Renew => (mode, own.map_or(now, |l| l.acquired_at)),
            GrantDecision::KeepWrite => (LeaseMode::Write, own.map_or(now, |l| l.acquired_at)),
        };
        let lease = Lease {
            resource_key: resource_key.to_string(),
            holder_instance_id: instance_id.to_string(),
            mode: granted_mode,
            acquired_at,
            expires_at: now + self.config.lease_ttl,
        };
        Ok((lease, decision))
    }

    /// Idempotent: releasing a lease that is not held returns `false`.
    pub fn release_lease(&self, instance_id: &str, resource_key: &str) -> Result<bool> {
        self.store.write(|tx| rows::delete_lease(tx, resource_key, instance_id))
    }

    /// Release all leases, delete the session and mark its node `deregistered`.
    pub fn deregister(&self, instance_id: &str) -> Result<bool> {
        let now = Utc::now();
        let existed = self.store.write(|tx| {
            let released = rows::release_all(tx, instance_id)?;
            let existed = rows::delete_session(tx, instance_id)?;
            if existed {
                self.mark_session_node(tx, instance_id, "deregistered", now)?;
            }
            debug!(instance_id, released, existed, "Deregister");
            Ok(existed)
        })?;
        if existed {
            info!(instance_id, "Instance deregistered");
        }
        Ok(existed)
    }

    pub fn reclaim_stale(&self) -> Result<ReclaimReport> {
        self.reclaim_stale_at(Utc::now())
    }

    /// Two-phase sweep. Phase 1 marks overdue sessions stale; phase 2, in a
    /// single transaction, releases their leases acquired up to the moment
    /// they went stale and deletes them. Sessions revived in between are kept.
    pub fn reclaim_stale_at(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        let now = now.trunc_subsecs(6);
        let marked_stale = self.mark_stale(now)?;
        let reclaimed = self.reclaim_marked(now)?;
        Ok(ReclaimReport { marked_stale, reclaimed })
    }

    fn mark_stale(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = now - self.config.heartbeat_timeout;
        let marked = self.store.write(|tx| rows::mark_overdue_stale(tx, &cutoff, &now))?;
        for instance_id in &marked {
            warn!(instance_id = %instance_id, "Session missed its heartbeat, marked stale");
        }
        Ok(marked)
    }

    fn reclaim_marked(&self, now: DateTime<Utc>) -> Result<Vec<ReclaimedSession>> {
        let cutoff = now - self.config.heartbeat_timeout;
        let reclaimed = self.store.write(|tx| {
            let mut reclaimed = Vec::new();
            for (instance_id, stale_since) in rows::overdue_stale_sessions(tx, &cutoff)? {
                let released_leases = rows::release_acquired_before(tx, &instance_id, &stale_since)?;
                rows::delete_session(tx, &instance_id)?;
                self.mark_session_node(tx, &instance_id, "reclaimed", now)?;
                reclaimed.push(ReclaimedSession { instance_id, released_leases });
            }
            Ok(reclaimed)
        })?;

        for session in &reclaimed {
            crate::metrics::record_session_reclaimed();
            info!(
                instance_id = %session.instance_id,
                released = session.released_leases.len(),
                "Reclaimed stale session"
            );
        }
        Ok(reclaimed)
    }

    /// Hand a context node and a set of leases from one active instance to another.
    pub fn handoff(
        &self,
        from_instance: &str,
        to_instance: &str,
        context_node_id: &str,
        leases: &[String],
    ) -> Result<HandoffReceipt> {
        let now = Utc::now().trunc_subsecs(6);
        if from_instance == to_instance {
            return Err(MemoryError::invalid("cannot hand off to the same instance"));
        }
        let expires_at = now + self.config.lease_ttl;

        let receipt = self.store.write(|tx| {
            self.require_active(tx, from_instance, now)?;
            self.require_active(tx, to_instance, now)?;
            node_store::require_node(tx, context_node_id)?;

            let edge = edge_store::link(
                tx,
                context_node_id,
                &Session::node_id(to_instance),
                RELATION_HANDED_OFF_TO,
                Some(json!({ "from_instance": from_instance, "to_instance": to_instance, "leases": leases })),
                now,
            )?;

            let mut transferred = Vec::new();
            let mut skipped = Vec::new();
            for key in leases {
                let Some(held) = rows::get_lease(tx, key, from_instance, &now)? else {
                    skipped.push(key.clone());
                    continue;
                };
                let receiver_mode = rows::get_lease(tx, key, to_instance, &now)?.map(|l| l.mode);
                let mode = match (held.mode, receiver_mode) {
                    (LeaseMode::Write, _) | (_, Some(LeaseMode::Write)) => LeaseMode::Write,
                    _ => LeaseMode::Read,
                };
                rows::delete_lease(tx, key, from_instance)?;
                rows::put_lease(
                    tx,
                    &Lease {
                        resource_key: key.clone(),
                        holder_instance_id: to_instance.to_string(),
                        mode,
                        acquired_at: now,
                        expires_at,
                    },
                )?;
                transferred.push(key.clone());
            }
            Ok(HandoffReceipt { edge, transferred, skipped })
        })?;

        info!(
            from_instance,
            to_instance,
            context_node_id,
            transferred = receipt.transferred.len(),
            skipped = receipt.skipped.len(),
            "Context handed off"
        );
        Ok(receipt)
    }

    pub fn session(&self, instance_id: &str) -> Result<Session> {
        let now = Utc::now();
        self.store
            .read(|tx| rows::get_session(tx, instance_id, &now))?
            .ok_or_else(|| MemoryError::not_found(format!("session '{}'", instance_id)))
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let now = Utc::now();
        self.store.read(|tx| rows::list_sessions(tx, &now))
    }

    /// Unexpired leases on a key.
    pub fn leases_for(&self, resource_key: &str) -> Result<Vec<Lease>> {
        let now = Utc::now();
        self.store.read(|tx| rows::leases_for(tx, resource_key, &now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::StoreOptions;
    use proptest::prelude::*;

    fn coordinator() -> (Arc<MemoryStore>, InstanceCoordinator) {
        let store = Arc::new(MemoryStore::open_in_memory(&StoreOptions { embedding_dim: 2, ..Default::default() }).unwrap());
        let coordinator = InstanceCoordinator::new(store.clone(), CoordinatorConfig::default());
        (store, coordinator)
    }

    fn lease(holder: &str, mode: LeaseMode) -> Lease {
        let now = Utc::now();
        Lease {
            resource_key: "k".into(),
            holder_instance_id: holder.into(),
            mode,
            acquired_at: now,
            expires_at: now + Duration::seconds(60),
        }
    }

    #[test]
    fn test_decide_grant_table() {
        use GrantDecision::*;
        assert_eq!(decide_grant(&[], "a", LeaseMode::Write), Grant);
        assert_eq!(decide_grant(&[lease("b", LeaseMode::Read)], "a", LeaseMode::Read), Grant);
        assert_eq!(
            decide_grant(&[lease("b", LeaseMode::Read)], "a", LeaseMode::Write),
            Deny { held_by: "b".into() }
        );
        assert_eq!(
            decide_grant(&[lease("b", LeaseMode::Write)], "a", LeaseMode::Read),
            Deny { held_by: "b".into() }
        );
        assert_eq!(decide_grant(&[lease("a", LeaseMode::Read)], "a", LeaseMode::Write), Upgrade);
        assert_eq!(decide_grant(&[lease("a", LeaseMode::Write)], "a", LeaseMode::Read), KeepWrite);
        assert_eq!(
            decide_grant(&[lease("a", LeaseMode::Read), lease("b", LeaseMode::Read)], "a", LeaseMode::Write),
            Deny { held_by: "b".into() }
        );
    }

    proptest! {
        #[test]
        fn prop_granted_leases_stay_compatible(requests in prop::collection::vec((0usize..4, any::<bool>()), 1..40)) {
            let mut held: Vec<Lease> = Vec::new();
            for (holder, write) in requests {
                let holder = format!("i{}", holder);
                let mode = if write { LeaseMode::Write } else { LeaseMode::Read };
                match decide_grant(&held, &holder, mode) {
                    GrantDecision::Grant => held.push(lease(&holder, mode)),
                    GrantDecision::Upgrade => {
                        held.retain(|l| l.holder_instance_id != holder);
                        held.push(lease(&holder, LeaseMode::Write));
                    }
                    GrantDecision::Renew | GrantDecision::KeepWrite | GrantDecision::Deny { .. } => {}
                }
                let writers = held.iter().filter(|l| l.mode == LeaseMode::Write).count();
                prop_assert!(writers <= 1);
                if writers == 1 {
                    prop_assert_eq!(held.len(), 1);
                }
            }
        }
    }

    #[test]
    fn test_register_twice_is_conflict_and_creates_session_node() {
        let (store, coord) = coordinator();
        coord.register("a", "builder", "/ws").unwrap();
        let err = coord.register("a", "builder", "/ws").unwrap_err();
        assert!(matches!(err, MemoryError::Conflict(_)));
        let node = store.get_node("session:a").unwrap();
        assert_eq!(node.node_type, NodeType::Session);
        assert_eq!(node.metadata_str("status"), Some("active"));
    }

    #[test]
    fn test_writers_planning_on_one_snapshot_meet_the_unique_index() {
        let (store, coord) = coordinator();
        let now = Utc::now().trunc_subsecs(6);
        let (first, second) = store
            .read(|tx| {
                let snapshot = rows::leases_for(tx, "file.py", &now)?;
                let (first, _) = coord.plan_grant(&snapshot, "a", "file.py", LeaseMode::Write, now)?;
                let (second, _) = coord.plan_grant(&snapshot, "b", "file.py", LeaseMode::Write, now)?;
                Ok((first, second))
            })
            .unwrap();

        store.write(|tx| rows::put_lease(tx, &first)).unwrap();
        let result = store.write(|tx| rows::put_lease(tx, &second).map(|_| (second.clone(), GrantDecision::Grant)));
        assert!(matches!(result, Err(MemoryError::Conflict(_))));
        assert_eq!(lease_outcome(&result), "conflict");

        let leases = coord.leases_for("file.py").unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].holder_instance_id, "a");
    }

    #[test]
    fn test_lease_outcome_labels() {
        let denied: Result<(Lease, GrantDecision)> =
            Err(MemoryError::Denied { resource_key: "k".into(), held_by: "a".into() });
        assert_eq!(lease_outcome(&denied), "denied");
        assert_eq!(lease_outcome(&Ok((lease("a", LeaseMode::Write), GrantDecision::Grant))), "granted");
        assert_eq!(lease_outcome(&Ok((lease("a", LeaseMode::Write), GrantDecision::Upgrade))), "upgraded");
        assert_eq!(lease_outcome(&Ok((lease("a", LeaseMode::Write), GrantDecision::KeepWrite))), "renewed");
        assert_eq!(lease_outcome(&Err(MemoryError::internal("disk"))), "error");
    }

    #[test]
    fn test_unregistered_instance_cannot_acquire() {
        let (_, coord) = coordinator();
        let err = coord.acquire_lease("ghost", "file.py", LeaseMode::Read).unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[test]
    fn test_expired_lease_does_not_block() {
        let (_, coord) = coordinator();
        let t0 = Utc::now();
        coord.register_at("a", "r", "/ws", t0).unwrap();
        coord.register_at("b", "r", "/ws", t0).unwrap();
        coord.acquire_lease_at("a", "file.py", LeaseMode::Write, t0).unwrap();

        let later = t0 + Duration::seconds(61);
        coord.heartbeat_at("b", later).unwrap();
        let lease = coord.acquire_lease_at("b", "file.py", LeaseMode::Write, later).unwrap();
        assert_eq!(lease.holder_instance_id, "b");
    }

    #[test]
    fn test_heartbeat_renews_leases_and_reports_missing() {
        let (_, coord) = coordinator();
        let t0 = Utc::now().trunc_subsecs(6);
        coord.register_at("a", "r", "/ws", t0).unwrap();
        coord.acquire_lease_at("a", "file.py", LeaseMode::Read, t0).unwrap();
        assert!(coord.heartbeat_at("a", t0 + Duration::seconds(30)).unwrap());
        let leases = coord.leases_for("file.py").unwrap();
        assert_eq!(leases[0].expires_at, t0 + Duration::seconds(90));
        assert!(!coord.heartbeat("nobody").unwrap());
    }

    #[test]
    fn test_reclaim_releases_once() {
        let (store, coord) = coordinator();
        let t0 = Utc::now() - Duration::seconds(600);
        coord.register_at("a", "r", "/ws", t0).unwrap();
        coord.acquire_lease_at("a", "x.rs", LeaseMode::Write, t0).unwrap();
        coord.acquire_lease_at("a", "y.rs", LeaseMode::Read, t0).unwrap();

        let now = Utc::now();
        let first = coord.reclaim_stale_at(now).unwrap();
        assert_eq!(first.marked_stale, vec!["a".to_string()]);
        assert_eq!(first.released_count(), 2);

        let second = coord.reclaim_stale_at(now).unwrap();
        assert_eq!(second, ReclaimReport::default());

        assert!(matches!(coord.session("a"), Err(MemoryError::NotFound(_))));
        assert_eq!(store.get_node("session:a").unwrap().metadata_str("status"), Some("reclaimed"));
    }

    #[test]
    fn test_lease_granted_after_stale_snapshot_survives_reclaim() {
        let (store, coord) = coordinator();
        let t0 = Utc::now().trunc_subsecs(6) - Duration::seconds(600);
        coord.register_at("a", "r", "/ws", t0).unwrap();
        coord.acquire_lease_at("a", "old.rs", LeaseMode::Write, t0).unwrap();

        let now = Utc::now().trunc_subsecs(6);
        assert_eq!(coord.mark_stale(now).unwrap(), vec!["a".to_string()]);

        // committed by another coordinator between the two phases
        let late = Lease {
            resource_key: "late.rs".into(),
            holder_instance_id: "a".into(),
            mode: LeaseMode::Write,
            acquired_at: now + Duration::seconds(1),
            expires_at: now + Duration::seconds(61),
        };
        store.write(|tx| rows::put_lease(tx, &late)).unwrap();

        let reclaimed = coord.reclaim_marked(now + Duration::seconds(2)).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].released_leases, vec!["old.rs".to_string()]);
        assert!(coord.leases_for("old.rs").unwrap().is_empty());
        let kept = coord.leases_for("late.rs").unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].acquired_at, now + Duration::seconds(1));
    }

    #[test]
    fn test_register_over_stale_session() {
        let (_, coord) = coordinator();
        let t0 = Utc::now() - Duration::seconds(600);
        coord.register_at("a", "r", "/ws", t0).unwrap();
        coord.acquire_lease_at("a", "x.rs", LeaseMode::Write, t0).unwrap();

        let session = coord.register("a", "r2", "/ws2").unwrap();
        assert_eq!(session.role, "r2");
        assert!(session.active_leases.is_empty());
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let (store, coord) = coordinator();
        coord.register("a", "r", "/ws").unwrap();
        coord.acquire_lease("a", "x.rs", LeaseMode::Write).unwrap();
        assert!(coord.deregister("a").unwrap());
        assert!(!coord.deregister("a").unwrap());
        assert!(coord.leases_for("x.rs").unwrap().is_empty());
        assert_eq!(store.get_node("session:a").unwrap().metadata_str("status"), Some("deregistered"));
    }

    #[test]
    fn test_handoff_transfers_held_leases_only() {
        let (store, coord) = coordinator();
        coord.register("a", "r", "/ws").unwrap();
        coord.register("b", "r", "/ws").unwrap();
        store.upsert(Node::new("ctx", NodeType::Task, "refactor parser")).unwrap();
        coord.acquire_lease("a", "parser.rs", LeaseMode::Write).unwrap();

        let receipt = coord
            .handoff("a", "b", "ctx", &["parser.rs".to_string(), "lexer.rs".to_string()])
            .unwrap();
        assert_eq!(receipt.transferred, vec!["parser.rs".to_string()]);
        assert_eq!(receipt.skipped, vec!["lexer.rs".to_string()]);
        assert_eq!(receipt.edge.to_id, "session:b");
        assert_eq!(receipt.edge.relation, RELATION_HANDED_OFF_TO);

        let leases = coord.leases_for("parser.rs").unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].holder_instance_id, "b");
        assert_eq!(leases[0].mode, LeaseMode::Write);
    }

    #[test]
    fn test_handoff_requires_active_receiver() {
        let (store, coord) = coordinator();
        coord.register("a", "r", "/ws").unwrap();
        store.upsert(Node::new("ctx", NodeType::Task, "x")).unwrap();
        assert!(matches!(coord.handoff("a", "ghost", "ctx", &[]), Err(MemoryError::NotFound(_))));
        assert!(store.edges_of("ctx").unwrap().is_empty());
    }
}
