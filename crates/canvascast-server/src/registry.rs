//! Live sessions subscribed to the outbound whiteboard track.
//!
//! The registry observes membership only; sessions own their connections
//! and remove themselves on teardown. Broadcasts snapshot the membership,
//! then write to each member with the lock released, re-checking membership
//! before every write so a member removed mid-broadcast gets nothing more.

use std::future::Future;
use std::sync::Arc;

use canvascast_common::Result;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::engine::PeerLink;
use crate::session::{PeerRole, RoleSlot, SessionId};

struct Member {
    id: SessionId,
    link: Arc<dyn PeerLink>,
    role: Arc<RoleSlot>,
}

/// Outcome of one [`PeerRegistry::for_each`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// Members that left between the snapshot and their turn.
    pub skipped: usize,
}

#[derive(Default)]
pub struct PeerRegistry {
    members: Mutex<Vec<Member>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, id: SessionId, link: Arc<dyn PeerLink>, role: Arc<RoleSlot>) {
        let mut members = self.members.lock().await;
        if members.iter().any(|member| member.id == id) {
            return;
        }
        members.push(Member { id, link, role });
        debug!(session = %id, total = members.len(), "registered session");
    }

    /// Removes `id`; returns whether it was present.
    pub async fn remove(&self, id: SessionId) -> bool {
        let mut members = self.members.lock().await;
        let before = members.len();
        members.retain(|member| member.id != id);
        let removed = members.len() != before;
        if removed {
            debug!(session = %id, total = members.len(), "unregistered session");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }

    pub async fn count_role(&self, role: PeerRole) -> usize {
        self.members
            .lock()
            .await
            .iter()
            .filter(|member| member.role.get() == role)
            .count()
    }

    /// Runs `write` against every member. A failing member is logged and
    /// skipped; delivery to the rest continues.
    pub async fn for_each<F, Fut>(&self, write: F) -> BroadcastReport
    where
        F: FnMut(SessionId, Arc<dyn PeerLink>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.broadcast(None, write).await
    }

    /// Like [`for_each`](Self::for_each), restricted to members holding `role`
    /// when the broadcast starts.
    pub async fn for_each_in_role<F, Fut>(&self, role: PeerRole, write: F) -> BroadcastReport
    where
        F: FnMut(SessionId, Arc<dyn PeerLink>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.broadcast(Some(role), write).await
    }

    async fn broadcast<F, Fut>(&self, role: Option<PeerRole>, mut write: F) -> BroadcastReport
    where
        F: FnMut(SessionId, Arc<dyn PeerLink>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let snapshot: Vec<SessionId> = {
            let members = self.members.lock().await;
            members
                .iter()
                .filter(|member| role.map_or(true, |role| member.role.get() == role))
                .map(|member| member.id)
                .collect()
        };

        let mut report = BroadcastReport::default();
        for id in snapshot {
            let link = {
                let members = self.members.lock().await;
                members
                    .iter()
                    .find(|member| member.id == id)
                    .map(|member| member.link.clone())
            };
            let Some(link) = link else {
                report.skipped += 1;
                continue;
            };
            match write(id, link).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(session = %id, "broadcast write failed: {}", err);
                    report.failed += 1;
                }
            }
        }
        report
    }
}
