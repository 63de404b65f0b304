//! Task publisher: turn a wave plan into marketplace tasks.
//!
//! Each task is created on the marketplace first and recorded locally only
//! after the marketplace returned its id, so a failed call leaves no local
//! trace. The wave is sealed when the pass ends, successfully or not.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{Result, WaveError};
use crate::marketplace::{Marketplace, QualificationRequirement, TaskRequest, Visibility};
use crate::scheduler::retry::{RetryMode, RetryPolicy};
use crate::scheduler::rotation::{EligibilityPool, WaveNumber};
use crate::scheduler::select::{PlannedTask, WavePlan};
use crate::store::{Publication, StateStore, WaveProgress};
use crate::template::TaskLayout;

/// Built-in marketplace qualification: worker locale
pub const LOCALE_QUALIFICATION: &str = "00000000000000000071";
/// Built-in marketplace qualification: number of approved tasks
pub const APPROVED_COUNT_QUALIFICATION: &str = "00000000000000000040";
/// Built-in marketplace qualification: approval percentage
pub const APPROVAL_RATE_QUALIFICATION: &str = "000000000000000000L0";

const HOUR: u64 = 3600;

/// Task metadata and worker gates shared by every published task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub title: String,
    pub description: String,
    pub keywords: String,
    pub lifetime_secs: u64,
    pub assignment_duration_secs: u64,
    pub auto_approval_delay_secs: u64,
    pub allowed_countries: Vec<String>,
    pub min_approved_tasks: i64,
    pub min_approval_rate: i64,
    /// Temporary-block qualification; workers holding it see nothing
    pub blocked_qualification_id: Option<String>,
    /// Screening-test qualification; unset disables the gate
    pub screening_qualification_id: Option<String>,
    pub min_screening_score: i64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            title: "Annotating Event Coreferences in News Articles".to_string(),
            description: "You will be asked to read a pair of news articles and identify the texts that refer to the same events.".to_string(),
            keywords: "annotation,event,news,coreference".to_string(),
            lifetime_secs: 24 * HOUR,
            assignment_duration_secs: 24 * HOUR,
            auto_approval_delay_secs: 72 * HOUR,
            allowed_countries: vec!["US".to_string(), "CA".to_string()],
            min_approved_tasks: 1000,
            min_approval_rate: 95,
            blocked_qualification_id: None,
            screening_qualification_id: None,
            min_screening_score: 70,
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(WaveError::Config("publisher.title is empty".to_string()));
        }
        if self.allowed_countries.is_empty() {
            return Err(WaveError::Config("publisher.allowed_countries is empty".to_string()));
        }
        if self.lifetime_secs == 0 || self.assignment_duration_secs == 0 {
            return Err(WaveError::Config(
                "publisher lifetime and assignment duration must be positive".to_string(),
            ));
        }
        if !(0..=100).contains(&self.min_approval_rate) {
            return Err(WaveError::Config(format!(
                "publisher.min_approval_rate {} is not a percentage",
                self.min_approval_rate
            )));
        }
        match self.blocked_qualification_id.as_deref() {
            Some(id) if !id.trim().is_empty() => {}
            _ => {
                return Err(WaveError::Config(
                    "publisher.blocked_qualification_id must be set".to_string(),
                ));
            }
        }
        if let Some(id) = &self.screening_qualification_id
            && id.trim().is_empty()
        {
            return Err(WaveError::Config("publisher.screening_qualification_id is empty".to_string()));
        }
        Ok(())
    }

    /// Gates every task carries regardless of wave
    pub fn base_requirements(&self) -> Vec<QualificationRequirement> {
        let mut requirements = vec![
            QualificationRequirement::locale_in(LOCALE_QUALIFICATION, &self.allowed_countries, Visibility::PreviewAndAccept),
            QualificationRequirement::at_least(
                APPROVED_COUNT_QUALIFICATION,
                self.min_approved_tasks,
                Visibility::PreviewAndAccept,
            ),
            QualificationRequirement::at_least(
                APPROVAL_RATE_QUALIFICATION,
                self.min_approval_rate,
                Visibility::PreviewAndAccept,
            ),
        ];
        if let Some(blocked) = &self.blocked_qualification_id {
            requirements.push(QualificationRequirement::does_not_exist(
                blocked.clone(),
                Visibility::PreviewAndAccept,
            ));
        }
        if let Some(screening) = &self.screening_qualification_id {
            requirements.push(QualificationRequirement::at_least(
                screening.clone(),
                self.min_screening_score,
                Visibility::PreviewAndAccept,
            ));
        }
        requirements
    }
}

/// One task that reached the marketplace and the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedTask {
    pub pair_name: String,
    pub external_task_id: String,
    pub requested_assignments: u32,
    pub continuation: bool,
}

#[derive(Debug, Clone)]
pub struct PublishReport {
    pub wave: WaveNumber,
    pub published: Vec<PublishedTask>,
    /// Progress after sealing; None when nothing was published
    pub progress: Option<WaveProgress>,
}

pub struct TaskPublisher<'a> {
    store: &'a StateStore,
    marketplace: Arc<dyn Marketplace>,
    pool: EligibilityPool,
    layout: TaskLayout,
    config: PublisherConfig,
    retry: RetryPolicy,
}

impl<'a> TaskPublisher<'a> {
    pub fn new(
        store: &'a StateStore,
        marketplace: Arc<dyn Marketplace>,
        pool: EligibilityPool,
        layout: TaskLayout,
        config: PublisherConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            marketplace,
            pool,
            layout,
            config,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the creation request for one planned task
    pub fn build_request(&self, task: &PlannedTask, wave: WaveNumber) -> Result<TaskRequest> {
        let mut requirements = self.config.base_requirements();
        requirements.extend(self.pool.exclusion_requirements(wave));
        Ok(TaskRequest {
            title: self.config.title.clone(),
            description: self.config.description.clone(),
            keywords: self.config.keywords.clone(),
            reward: task.pair.reward.to_string(),
            max_assignments: task.requested_assignments,
            lifetime_in_seconds: self.config.lifetime_secs,
            assignment_duration_in_seconds: self.config.assignment_duration_secs,
            auto_approval_delay_in_seconds: self.config.auto_approval_delay_secs,
            question: self.layout.render(&task.pair.hash)?,
            qualification_requirements: requirements,
        })
    }

    /// Publish every task of the plan, in order, then seal the wave.
    ///
    /// Stops at the first failure; tasks already published stay recorded
    /// and the wave is sealed with what it has.
    pub async fn publish_wave(&self, plan: &WavePlan) -> Result<PublishReport> {
        let mut published = Vec::with_capacity(plan.tasks.len());
        let outcome = self.publish_tasks(plan, &mut published).await;

        let progress = self.store.seal_wave(plan.wave)?;
        if let Err(e) = outcome {
            error!(
                wave = %plan.wave,
                published = published.len(),
                planned = plan.tasks.len(),
                error = %e,
                "Publication stopped; wave sealed with partial contents"
            );
            return Err(e);
        }

        info!(
            wave = %plan.wave,
            published = published.len(),
            continuation = plan.continuation_count(),
            fresh = plan.fresh_count(),
            backend = self.marketplace.name(),
            "Published wave"
        );
        Ok(PublishReport {
            wave: plan.wave,
            published,
            progress,
        })
    }

    async fn publish_tasks(&self, plan: &WavePlan, published: &mut Vec<PublishedTask>) -> Result<()> {
        for task in &plan.tasks {
            let request = self.build_request(task, plan.wave)?;
            let request_ref = &request;
            let marketplace = self.marketplace.as_ref();
            let external_task_id = self
                .retry
                .run(RetryMode::CreateOnce, "create_task", move || marketplace.create_task(request_ref))
                .await?;

            let publication = Publication {
                external_task_id: external_task_id.clone(),
                pair_name: task.pair.pair_name.clone(),
                hash: task.pair.hash.clone(),
                wave: plan.wave,
                token_index: plan.token_index,
                exclusive: plan.exclusive,
                requested_assignments: task.requested_assignments,
            };
            if let Err(e) = self.store.record_publication(&publication) {
                warn!(
                    task_id = %external_task_id,
                    pair = %task.pair.pair_name,
                    error = %e,
                    "Marketplace accepted a task the store refused to record"
                );
                return Err(e);
            }

            info!(
                wave = %plan.wave,
                pair = %task.pair.pair_name,
                task_id = %external_task_id,
                requested = task.requested_assignments,
                reward = %task.pair.reward,
                "Published task"
            );
            published.push(PublishedTask {
                pair_name: task.pair.pair_name.clone(),
                external_task_id,
                requested_assignments: task.requested_assignments,
                continuation: task.continuation,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{Corpus, DocumentGroup, DocumentStats, observe_corpus};
    use crate::marketplace::{Comparator, InMemoryMarketplace, MarketplaceError};
    use crate::scheduler::{Allocation, RewardSchedule, RoundAllocator};
    use tempfile::TempDir;

    fn config() -> PublisherConfig {
        PublisherConfig {
            blocked_qualification_id: Some("BLOCKED".to_string()),
            ..Default::default()
        }
    }

    fn pool() -> EligibilityPool {
        EligibilityPool::new(["Q0".to_string(), "Q1".to_string(), "Q2".to_string()])
    }

    fn seeded_store(temp: &TempDir) -> StateStore {
        let store = StateStore::open(&temp.path().join("s.db")).unwrap();
        let docs: Vec<DocumentStats> = ["a", "b", "c"]
            .iter()
            .map(|id| DocumentStats {
                doc_id: id.to_string(),
                sentence_count: 10,
                event_mentions: vec![format!("event-{}", id)],
            })
            .collect();
        let corpus = Corpus::from_documents(docs);
        observe_corpus(
            &store,
            &corpus,
            &[DocumentGroup::new(["a", "b", "c"])],
            &RewardSchedule::default(),
            3,
        )
        .unwrap();
        store
    }

    fn plan(store: &StateStore) -> WavePlan {
        match RoundAllocator::new(store).plan().unwrap() {
            Allocation::Planned(plan) => plan,
            other => panic!("expected a plan, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_requires_block_qualification() {
        let err = PublisherConfig::default().validate().unwrap_err();
        assert!(matches!(err, WaveError::Config(_)));
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_rate_and_countries() {
        let mut c = config();
        c.min_approval_rate = 101;
        assert!(c.validate().is_err());
        let mut c = config();
        c.allowed_countries.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_base_requirements_include_gates() {
        let mut c = config();
        c.screening_qualification_id = Some("SCREEN".to_string());
        let reqs = c.base_requirements();
        assert_eq!(reqs.len(), 5);
        assert!(reqs.iter().all(|r| r.actions_guarded == Visibility::PreviewAndAccept));
        assert_eq!(reqs[0].comparator, Comparator::In);
        assert_eq!(reqs[0].locale_values.len(), 2);
        assert_eq!(reqs[1].integer_values, vec![1000]);
        assert_eq!(reqs[2].integer_values, vec![95]);
        assert_eq!(reqs[3].qualification_type_id, "BLOCKED");
        assert_eq!(reqs[3].comparator, Comparator::DoesNotExist);
        assert_eq!(reqs[4].integer_values, vec![70]);
    }

    #[tokio::test]
    async fn test_publish_first_wave() {
        let temp = TempDir::new().unwrap();
        let store = seeded_store(&temp);
        let market = Arc::new(InMemoryMarketplace::new());
        let publisher =
            TaskPublisher::new(&store, market.clone(), pool(), TaskLayout::default(), config()).unwrap();

        let plan = plan(&store);
        let report = publisher.publish_wave(&plan).await.unwrap();
        assert_eq!(report.published.len(), 3);
        let progress = report.progress.unwrap();
        assert_eq!(progress.sent_count, 3);
        assert!(!progress.closed);
        assert!(store.is_sealed(plan.wave).unwrap());

        let requests = market.created_requests();
        assert_eq!(requests.len(), 3);
        for (task_id, request) in &requests {
            let task = store.get_task(task_id).unwrap().unwrap();
            assert!(request.question.contains(&task.hash));
            assert!(!request.question.contains(&task.pair_name));
            assert_eq!(request.max_assignments, 3);
            assert_eq!(request.reward, "2.30");
            // First wave carries no exclusivity constraints
            assert_eq!(request.qualification_requirements.len(), 4);
        }
    }

    #[tokio::test]
    async fn test_exclusive_wave_adds_discover_exclusions() {
        let temp = TempDir::new().unwrap();
        let store = seeded_store(&temp);
        let market = Arc::new(InMemoryMarketplace::new());
        let publisher =
            TaskPublisher::new(&store, market.clone(), pool(), TaskLayout::default(), config()).unwrap();

        let mut plan = plan(&store);
        plan.wave = WaveNumber::next(Some(WaveNumber::first()));
        let request = publisher.build_request(&plan.tasks[0], plan.wave).unwrap();
        let exclusions: Vec<&QualificationRequirement> = request
            .qualification_requirements
            .iter()
            .filter(|r| r.actions_guarded == Visibility::DiscoverPreviewAndAccept)
            .collect();
        assert_eq!(exclusions.len(), 2);
        let ids: Vec<&str> = exclusions.iter().map(|r| r.qualification_type_id.as_str()).collect();
        assert_eq!(ids, vec!["Q0", "Q1"]);
    }

    #[tokio::test]
    async fn test_failed_creation_leaves_no_local_row_and_seals() {
        let temp = TempDir::new().unwrap();
        let store = seeded_store(&temp);
        let market = Arc::new(InMemoryMarketplace::new());
        let publisher = TaskPublisher::new(&store, market.clone(), pool(), TaskLayout::default(), config())
            .unwrap()
            .with_retry(RetryPolicy::no_retry());

        let plan = plan(&store);
        market.fail_next_create(MarketplaceError::Api {
            status: 500,
            message: "boom".to_string(),
        });
        let err = publisher.publish_wave(&plan).await.unwrap_err();
        assert!(matches!(err, WaveError::Marketplace(_)));
        assert_eq!(market.task_count(), 0);
        assert!(store.list_tasks().unwrap().is_empty());
        assert!(store.get_wave(plan.wave).unwrap().is_none());
        assert_eq!(store.pair_counts().unwrap().unassigned, 3);
    }

    #[tokio::test]
    async fn test_unreachable_creation_is_retried() {
        let temp = TempDir::new().unwrap();
        let store = seeded_store(&temp);
        let market = Arc::new(InMemoryMarketplace::new());
        let retry = RetryPolicy::new(3, std::time::Duration::ZERO, std::time::Duration::ZERO);
        let publisher = TaskPublisher::new(&store, market.clone(), pool(), TaskLayout::default(), config())
            .unwrap()
            .with_retry(retry);

        market.fail_next_create(MarketplaceError::Unreachable("refused".to_string()));
        let report = publisher.publish_wave(&plan(&store)).await.unwrap();
        assert_eq!(report.published.len(), 3);
        assert_eq!(market.task_count(), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_not_resent() {
        let temp = TempDir::new().unwrap();
        let store = seeded_store(&temp);
        let market = Arc::new(InMemoryMarketplace::new());
        let retry = RetryPolicy::new(3, std::time::Duration::ZERO, std::time::Duration::ZERO);
        let publisher = TaskPublisher::new(&store, market.clone(), pool(), TaskLayout::default(), config())
            .unwrap()
            .with_retry(retry);

        market.fail_next_create(MarketplaceError::Timeout("no answer".to_string()));
        assert!(publisher.publish_wave(&plan(&store)).await.is_err());
        assert_eq!(market.task_count(), 0);
    }
}
