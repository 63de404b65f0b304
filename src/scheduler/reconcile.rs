//! Completion reconciler: poll the marketplace and credit finished work.
//!
//! A pass lists every task, credits each new creditable assignment on the
//! tasks still open locally, retires exhausted tasks that fell short of
//! coverage and finally grants the wave's eligibility token to every
//! credited worker who does not have it yet. Every step is idempotent, so
//! an interrupted pass is finished by the next one.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{Result, WaveError};
use crate::marketplace::{Marketplace, TaskSummary};
use crate::scheduler::retry::{RetryMode, RetryPolicy};
use crate::scheduler::rotation::EligibilityPool;
use crate::store::{CreditOutcome, StateStore, TaskRecord, WaveProgress};

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub tasks_seen: usize,
    pub credited: usize,
    pub already_credited: usize,
    pub task_closed: usize,
    /// Marketplace tasks this store never published
    pub unknown_tasks: usize,
    pub rejected: usize,
    pub retired: usize,
    pub waves_closed: usize,
    pub awards_granted: usize,
    pub award_failures: usize,
}

impl ReconcileReport {
    /// Records that were looked at and deliberately left alone
    pub fn skipped(&self) -> usize {
        self.already_credited + self.task_closed + self.unknown_tasks + self.rejected
    }

    fn note_progress(&mut self, progress: &WaveProgress) {
        if progress.closed {
            self.waves_closed += 1;
            info!(
                wave = %progress.wave,
                completed = progress.completed_count,
                sent = progress.sent_count,
                "Wave closed"
            );
        }
    }
}

pub struct CompletionReconciler<'a> {
    store: &'a StateStore,
    marketplace: Arc<dyn Marketplace>,
    pool: Option<EligibilityPool>,
    retry: RetryPolicy,
    notify_workers: bool,
}

impl<'a> CompletionReconciler<'a> {
    /// Without a provisioned pool, credits still happen and awards wait
    /// until the pool exists.
    pub fn new(store: &'a StateStore, marketplace: Arc<dyn Marketplace>, pool: Option<EligibilityPool>) -> Self {
        Self {
            store,
            marketplace,
            pool,
            retry: RetryPolicy::default(),
            notify_workers: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_notifications(mut self, notify_workers: bool) -> Self {
        self.notify_workers = notify_workers;
        self
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let marketplace = self.marketplace.as_ref();
        let summaries = self
            .retry
            .run(RetryMode::Idempotent, "list_tasks", move || marketplace.list_tasks())
            .await?;
        report.tasks_seen = summaries.len();

        for summary in &summaries {
            let Some(task) = self.store.get_task(&summary.task_id)? else {
                debug!(task_id = %summary.task_id, "Skipping task not published by this store");
                report.unknown_tasks += 1;
                continue;
            };
            if !task.is_open() {
                continue;
            }
            self.credit_task(&task, &mut report).await?;
            self.retire_if_exhausted(summary, &mut report)?;
        }

        self.grant_awards(&mut report).await?;

        if report.credited > 0 || report.retired > 0 {
            self.store.log_event(
                "reconcile",
                &format!(
                    "credited {} retired {} waves closed {}",
                    report.credited, report.retired, report.waves_closed
                ),
            )?;
        }
        info!(
            tasks = report.tasks_seen,
            credited = report.credited,
            skipped = report.skipped(),
            retired = report.retired,
            waves_closed = report.waves_closed,
            awards = report.awards_granted,
            award_failures = report.award_failures,
            "Reconciled"
        );
        Ok(report)
    }

    async fn credit_task(&self, task: &TaskRecord, report: &mut ReconcileReport) -> Result<()> {
        let marketplace = self.marketplace.as_ref();
        let task_id = task.external_task_id.as_str();
        let assignments = self
            .retry
            .run(RetryMode::Idempotent, "list_assignments_for_task", move || {
                marketplace.list_assignments_for_task(task_id)
            })
            .await?;

        for assignment in &assignments {
            if !assignment.status.is_creditable() {
                report.rejected += 1;
                continue;
            }
            match self
                .store
                .credit_assignment(task_id, &assignment.assignment_id, &assignment.worker_id)?
            {
                CreditOutcome::UnknownTask => report.unknown_tasks += 1,
                CreditOutcome::AlreadyCredited => report.already_credited += 1,
                CreditOutcome::TaskClosed => {
                    debug!(task_id, assignment_id = %assignment.assignment_id, "Task already closed");
                    report.task_closed += 1;
                }
                CreditOutcome::Credited(receipt) => {
                    report.credited += 1;
                    info!(
                        task_id,
                        pair = %receipt.pair_name,
                        worker = %assignment.worker_id,
                        annotation_index = receipt.annotation_index,
                        "Credited assignment"
                    );
                    if let Some(progress) = &receipt.wave_progress {
                        report.note_progress(progress);
                    }
                }
            }
        }
        Ok(())
    }

    fn retire_if_exhausted(&self, summary: &TaskSummary, report: &mut ReconcileReport) -> Result<()> {
        if !summary.is_exhausted(Utc::now()) {
            return Ok(());
        }
        if let Some(progress) = self.store.retire_task(&summary.task_id)? {
            report.retired += 1;
            info!(task_id = %summary.task_id, wave = %progress.wave, "Retired expired task short of coverage");
            report.note_progress(&progress);
        }
        Ok(())
    }

    /// Grant each credited worker its wave's token. Failures stay pending
    /// and are retried by the next pass.
    async fn grant_awards(&self, report: &mut ReconcileReport) -> Result<()> {
        let pending = self.store.pending_awards()?;
        if pending.is_empty() {
            return Ok(());
        }
        let Some(pool) = &self.pool else {
            warn!(pending = pending.len(), "Eligibility tokens not provisioned; awards deferred");
            return Ok(());
        };

        let marketplace = self.marketplace.as_ref();
        let notify = self.notify_workers;
        for award in &pending {
            let qualification_id = pool.qualification_id(award.token_index).ok_or_else(|| {
                WaveError::InvariantViolation(format!(
                    "task {} references eligibility token {}",
                    award.external_task_id, award.token_index
                ))
            })?;
            let worker_id = award.worker_id.as_str();
            let granted = self
                .retry
                .run(RetryMode::Idempotent, "assign_qualification", move || {
                    marketplace.assign_qualification(qualification_id, worker_id, notify)
                })
                .await;
            match granted {
                Ok(()) => {
                    self.store.mark_qualification_awarded(&award.assignment_id)?;
                    report.awards_granted += 1;
                    debug!(worker = worker_id, wave = %award.wave, qualification_id, "Granted eligibility token");
                }
                Err(e) => {
                    report.award_failures += 1;
                    warn!(worker = worker_id, wave = %award.wave, error = %e, "Token grant failed; will retry next pass");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{Corpus, DocumentGroup, DocumentStats, observe_corpus};
    use crate::marketplace::{InMemoryMarketplace, MarketplaceError};
    use crate::scheduler::{Allocation, PublisherConfig, RewardSchedule, RoundAllocator, TaskPublisher};
    use crate::template::TaskLayout;
    use tempfile::TempDir;

    fn pool() -> EligibilityPool {
        EligibilityPool::new(["Q0".to_string(), "Q1".to_string(), "Q2".to_string()])
    }

    /// Seed one group of two documents (one pair) and publish the first wave
    async fn published(temp: &TempDir, market: &Arc<InMemoryMarketplace>) -> (StateStore, String) {
        let store = StateStore::open(&temp.path().join("s.db")).unwrap();
        let corpus = Corpus::from_documents(vec![
            DocumentStats {
                doc_id: "a".to_string(),
                sentence_count: 10,
                event_mentions: vec![],
            },
            DocumentStats {
                doc_id: "b".to_string(),
                sentence_count: 10,
                event_mentions: vec![],
            },
        ]);
        observe_corpus(&store, &corpus, &[DocumentGroup::new(["a", "b"])], &RewardSchedule::default(), 3).unwrap();
        let Allocation::Planned(plan) = RoundAllocator::new(&store).plan().unwrap() else {
            panic!("expected a plan");
        };
        let config = PublisherConfig {
            blocked_qualification_id: Some("BLOCKED".to_string()),
            ..Default::default()
        };
        let publisher = TaskPublisher::new(&store, market.clone(), pool(), TaskLayout::default(), config).unwrap();
        let report = publisher.publish_wave(&plan).await.unwrap();
        let task_id = report.published[0].external_task_id.clone();
        (store, task_id)
    }

    fn reconciler<'a>(store: &'a StateStore, market: &Arc<InMemoryMarketplace>) -> CompletionReconciler<'a> {
        CompletionReconciler::new(store, market.clone(), Some(pool())).with_retry(RetryPolicy::no_retry())
    }

    #[tokio::test]
    async fn test_credit_and_close_wave() {
        let temp = TempDir::new().unwrap();
        let market = Arc::new(InMemoryMarketplace::new());
        let (store, task_id) = published(&temp, &market).await;

        market.submit_assignment(&task_id, "W1").unwrap();
        let report = reconciler(&store, &market).reconcile().await.unwrap();
        assert_eq!(report.credited, 1);
        assert_eq!(report.waves_closed, 0);
        assert_eq!(store.get_pair("pair_a_and_b").unwrap().unwrap().annotation_index, 1);

        market.submit_assignment(&task_id, "W2").unwrap();
        market.submit_assignment(&task_id, "W3").unwrap();
        let report = reconciler(&store, &market).reconcile().await.unwrap();
        assert_eq!(report.credited, 2);
        assert_eq!(report.waves_closed, 1);
        assert_eq!(report.awards_granted, 2);

        let wave = store.latest_wave().unwrap().unwrap();
        assert!(wave.closed);
        assert_eq!(wave.workers, vec!["W1", "W2", "W3"]);
        // First wave selects token 1
        assert_eq!(market.qualifications_of("W3"), vec!["Q1"]);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let market = Arc::new(InMemoryMarketplace::new());
        let (store, task_id) = published(&temp, &market).await;

        market.submit_assignment(&task_id, "W1").unwrap();
        reconciler(&store, &market).reconcile().await.unwrap();
        let again = reconciler(&store, &market).reconcile().await.unwrap();
        assert_eq!(again.credited, 0);
        assert_eq!(again.already_credited, 1);
        assert_eq!(again.awards_granted, 0);
        assert_eq!(store.credited_assignment_count().unwrap(), 1);
        assert_eq!(store.get_pair("pair_a_and_b").unwrap().unwrap().annotation_index, 1);
    }

    #[tokio::test]
    async fn test_rejected_and_foreign_tasks_are_skipped() {
        let temp = TempDir::new().unwrap();
        let market = Arc::new(InMemoryMarketplace::new());
        let (store, task_id) = published(&temp, &market).await;

        market.reject_assignment(&task_id, "W1").unwrap();
        let foreign = crate::marketplace::TaskRequest {
            max_assignments: 1,
            ..market.created_requests()[0].1.clone()
        };
        market.create_task(&foreign).await.unwrap();

        let report = reconciler(&store, &market).reconcile().await.unwrap();
        assert_eq!(report.credited, 0);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.unknown_tasks, 1);
        assert_eq!(report.skipped(), 2);
    }

    #[tokio::test]
    async fn test_expired_task_is_retired_and_closes_wave() {
        let temp = TempDir::new().unwrap();
        let market = Arc::new(InMemoryMarketplace::new());
        let (store, task_id) = published(&temp, &market).await;

        market.submit_assignment(&task_id, "W1").unwrap();
        market.expire_task(&task_id).unwrap();
        let report = reconciler(&store, &market).reconcile().await.unwrap();
        assert_eq!(report.credited, 1);
        assert_eq!(report.retired, 1);
        assert_eq!(report.waves_closed, 1);

        let task = store.get_task(&task_id).unwrap().unwrap();
        assert!(task.retired);
        let candidates = store.continuation_candidates().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].remaining(), 2);
    }

    #[tokio::test]
    async fn test_failed_award_is_retried_next_pass() {
        let temp = TempDir::new().unwrap();
        let market = Arc::new(InMemoryMarketplace::new());
        let (store, task_id) = published(&temp, &market).await;

        market.submit_assignment(&task_id, "W1").unwrap();
        market.fail_next_assign(MarketplaceError::Unreachable("down".to_string()));
        let first = reconciler(&store, &market).reconcile().await.unwrap();
        assert_eq!(first.credited, 1);
        assert_eq!(first.award_failures, 1);
        assert!(market.qualifications_of("W1").is_empty());

        let second = reconciler(&store, &market).reconcile().await.unwrap();
        assert_eq!(second.awards_granted, 1);
        assert_eq!(market.qualifications_of("W1"), vec!["Q1"]);
    }

    #[tokio::test]
    async fn test_awards_wait_for_provisioning() {
        let temp = TempDir::new().unwrap();
        let market = Arc::new(InMemoryMarketplace::new());
        let (store, task_id) = published(&temp, &market).await;

        market.submit_assignment(&task_id, "W1").unwrap();
        let report = CompletionReconciler::new(&store, market.clone(), None)
            .with_retry(RetryPolicy::no_retry())
            .reconcile()
            .await
            .unwrap();
        assert_eq!(report.credited, 1);
        assert_eq!(report.awards_granted, 0);
        assert_eq!(store.pending_awards().unwrap().len(), 1);
    }
}
