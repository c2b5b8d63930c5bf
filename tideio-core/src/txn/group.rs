use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Barrier;

/// Capability standing in for the application's process group. The calling
/// conventions in the API docs ("called collectively", "leader starts and
/// finishes") are expressed against this seam so leader-driven consistency
/// can be exercised without a real multi-process transport.
#[async_trait]
pub trait ParticipantGroup: Send + Sync {
    /// Number of ranks participating in the group.
    fn rank_count(&self) -> u32;

    /// Block until every rank has arrived.
    async fn barrier(&self);
}

/// In-process group backed by a tokio barrier. One instance is shared by all
/// rank tasks of a test or a co-located application.
pub struct LocalGroup {
    ranks: u32,
    barrier: Arc<Barrier>,
}

impl LocalGroup {
    pub fn new(ranks: u32) -> Self {
        Self {
            ranks,
            barrier: Arc::new(Barrier::new(ranks.max(1) as usize)),
        }
    }
}

#[async_trait]
impl ParticipantGroup for LocalGroup {
    fn rank_count(&self) -> u32 {
        self.ranks
    }

    async fn barrier(&self) {
        self.barrier.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_group_barrier_releases_all_ranks() {
        let group = Arc::new(LocalGroup::new(3));
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let g = group.clone();
            tasks.push(tokio::spawn(async move {
                g.barrier().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(group.rank_count(), 3);
    }
}
