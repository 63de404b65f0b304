//! In-process marketplace
//!
//! Keeps tasks, assignments and qualifications in memory. Used for trial
//! runs without credentials and as the test double for the scheduler.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::marketplace::client::{
    Assignment, AssignmentStatus, Marketplace, MarketplaceError, TaskRequest, TaskStatus, TaskSummary,
};

#[derive(Debug)]
struct HostedTask {
    summary: TaskSummary,
    request: TaskRequest,
    assignments: Vec<Assignment>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: Vec<HostedTask>,
    qualification_types: Vec<(String, String)>,
    grants: Vec<(String, String)>,
    create_failures: VecDeque<MarketplaceError>,
    assign_failures: VecDeque<MarketplaceError>,
    next_id: u64,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:08}", prefix, self.next_id)
    }

    fn task_mut(&mut self, task_id: &str) -> Option<&mut HostedTask> {
        self.tasks.iter_mut().find(|t| t.summary.task_id == task_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMarketplace {
    state: Mutex<MemoryState>,
}

impl InMemoryMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `create_task` call fail with `error`
    pub fn fail_next_create(&self, error: MarketplaceError) {
        self.lock().create_failures.push_back(error);
    }

    /// Make the next `assign_qualification` call fail with `error`
    pub fn fail_next_assign(&self, error: MarketplaceError) {
        self.lock().assign_failures.push_back(error);
    }

    /// Record a worker accepting the task (pending until submitted)
    pub fn accept_task(&self, task_id: &str) -> Result<(), MarketplaceError> {
        let mut state = self.lock();
        let task = state
            .task_mut(task_id)
            .ok_or_else(|| not_found(task_id))?;
        if task.summary.assignments_available == 0 {
            return Err(MarketplaceError::Api {
                status: 400,
                message: format!("Task {} has no available assignments", task_id),
            });
        }
        task.summary.assignments_available -= 1;
        task.summary.assignments_pending += 1;
        Ok(())
    }

    /// Record a worker submitting work; returns the assignment id.
    ///
    /// Consumes a pending slot when one exists, otherwise an available one.
    pub fn submit_assignment(&self, task_id: &str, worker_id: &str) -> Result<String, MarketplaceError> {
        self.push_assignment(task_id, worker_id, AssignmentStatus::Submitted)
    }

    /// Record a submission the requester rejected
    pub fn reject_assignment(&self, task_id: &str, worker_id: &str) -> Result<String, MarketplaceError> {
        self.push_assignment(task_id, worker_id, AssignmentStatus::Rejected)
    }

    fn push_assignment(
        &self,
        task_id: &str,
        worker_id: &str,
        status: AssignmentStatus,
    ) -> Result<String, MarketplaceError> {
        let mut state = self.lock();
        let assignment_id = state.next_id("A");
        let task = state
            .task_mut(task_id)
            .ok_or_else(|| not_found(task_id))?;

        if task.summary.assignments_pending > 0 {
            task.summary.assignments_pending -= 1;
        } else if task.summary.assignments_available > 0 {
            task.summary.assignments_available -= 1;
        } else {
            return Err(MarketplaceError::Api {
                status: 400,
                message: format!("Task {} has no open assignments", task_id),
            });
        }
        task.summary.assignments_completed += 1;
        if task.summary.assignments_available == 0 && task.summary.assignments_pending == 0 {
            task.summary.status = TaskStatus::Reviewable;
        }

        task.assignments.push(Assignment {
            assignment_id: assignment_id.clone(),
            worker_id: worker_id.to_string(),
            task_id: task_id.to_string(),
            status,
            submit_time: Some(Utc::now()),
        });
        Ok(assignment_id)
    }

    /// Force a task past its lifetime
    pub fn expire_task(&self, task_id: &str) -> Result<(), MarketplaceError> {
        let mut state = self.lock();
        let task = state
            .task_mut(task_id)
            .ok_or_else(|| not_found(task_id))?;
        task.summary.expiration = Utc::now() - Duration::seconds(1);
        task.summary.assignments_available = 0;
        if task.summary.assignments_pending == 0 {
            task.summary.status = TaskStatus::Reviewable;
        } else {
            task.summary.status = TaskStatus::Unassignable;
        }
        Ok(())
    }

    /// Every creation request accepted so far, in order
    pub fn created_requests(&self) -> Vec<(String, TaskRequest)> {
        self.lock()
            .tasks
            .iter()
            .map(|t| (t.summary.task_id.clone(), t.request.clone()))
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Qualification type ids granted to a worker
    pub fn qualifications_of(&self, worker_id: &str) -> Vec<String> {
        self.lock()
            .grants
            .iter()
            .filter(|(_, w)| w == worker_id)
            .map(|(q, _)| q.clone())
            .collect()
    }

    /// Names of every qualification type created
    pub fn qualification_type_names(&self) -> Vec<String> {
        self.lock()
            .qualification_types
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }
}

fn not_found(task_id: &str) -> MarketplaceError {
    MarketplaceError::Api {
        status: 404,
        message: format!("Task {} does not exist", task_id),
    }
}

#[async_trait]
impl Marketplace for InMemoryMarketplace {
    async fn create_task(&self, request: &TaskRequest) -> Result<String, MarketplaceError> {
        let mut state = self.lock();
        if let Some(error) = state.create_failures.pop_front() {
            return Err(error);
        }

        let task_id = state.next_id("T");
        let lifetime = i64::try_from(request.lifetime_in_seconds).unwrap_or(i64::MAX / 1000);
        state.tasks.push(HostedTask {
            summary: TaskSummary {
                task_id: task_id.clone(),
                status: TaskStatus::Assignable,
                max_assignments: request.max_assignments,
                expiration: Utc::now() + Duration::seconds(lifetime),
                assignments_pending: 0,
                assignments_available: request.max_assignments,
                assignments_completed: 0,
            },
            request: request.clone(),
            assignments: Vec::new(),
        });
        Ok(task_id)
    }

    async fn list_tasks(&self) -> Result<Vec<TaskSummary>, MarketplaceError> {
        Ok(self.lock().tasks.iter().map(|t| t.summary.clone()).collect())
    }

    async fn list_assignments_for_task(&self, task_id: &str) -> Result<Vec<Assignment>, MarketplaceError> {
        let mut state = self.lock();
        let task = state
            .task_mut(task_id)
            .ok_or_else(|| not_found(task_id))?;
        Ok(task.assignments.clone())
    }

    async fn create_qualification_type(&self, name: &str, _description: &str) -> Result<String, MarketplaceError> {
        let mut state = self.lock();
        if state.qualification_types.iter().any(|(_, n)| n == name) {
            return Err(MarketplaceError::Api {
                status: 400,
                message: format!("Qualification type {} already exists", name),
            });
        }
        let id = state.next_id("Q");
        state.qualification_types.push((id.clone(), name.to_string()));
        Ok(id)
    }

    async fn assign_qualification(
        &self,
        qualification_id: &str,
        worker_id: &str,
        _notify_worker: bool,
    ) -> Result<(), MarketplaceError> {
        let mut state = self.lock();
        if let Some(error) = state.assign_failures.pop_front() {
            return Err(error);
        }
        let grant = (qualification_id.to_string(), worker_id.to_string());
        if !state.grants.contains(&grant) {
            state.grants.push(grant);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(max_assignments: u32) -> TaskRequest {
        TaskRequest {
            title: "t".to_string(),
            description: "d".to_string(),
            keywords: "k".to_string(),
            reward: "2.30".to_string(),
            max_assignments,
            lifetime_in_seconds: 3600,
            assignment_duration_in_seconds: 600,
            auto_approval_delay_in_seconds: 600,
            question: "<q/>".to_string(),
            qualification_requirements: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let market = InMemoryMarketplace::new();
        let id = market.create_task(&request(3)).await.unwrap();
        let tasks = market.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, id);
        assert_eq!(tasks[0].assignments_available, 3);
        assert_eq!(tasks[0].status, TaskStatus::Assignable);
    }

    #[tokio::test]
    async fn test_injected_create_failure() {
        let market = InMemoryMarketplace::new();
        market.fail_next_create(MarketplaceError::Unreachable("down".to_string()));
        assert!(market.create_task(&request(3)).await.is_err());
        assert!(market.create_task(&request(3)).await.is_ok());
        assert_eq!(market.task_count(), 1);
    }

    #[tokio::test]
    async fn test_submit_consumes_slots() {
        let market = InMemoryMarketplace::new();
        let id = market.create_task(&request(2)).await.unwrap();
        market.accept_task(&id).unwrap();
        market.submit_assignment(&id, "W1").unwrap();
        market.submit_assignment(&id, "W2").unwrap();
        assert!(market.submit_assignment(&id, "W3").is_err());

        let assignments = market.list_assignments_for_task(&id).await.unwrap();
        assert_eq!(assignments.len(), 2);
        let tasks = market.list_tasks().await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Reviewable);
        assert_eq!(tasks[0].assignments_completed, 2);
    }

    #[tokio::test]
    async fn test_expire_task() {
        let market = InMemoryMarketplace::new();
        let id = market.create_task(&request(3)).await.unwrap();
        market.expire_task(&id).unwrap();
        let tasks = market.list_tasks().await.unwrap();
        assert!(tasks[0].is_exhausted(Utc::now()));
    }

    #[tokio::test]
    async fn test_qualification_grants() {
        let market = InMemoryMarketplace::new();
        let q = market.create_qualification_type("AnnotatorGroup_00", "first").await.unwrap();
        assert!(market.create_qualification_type("AnnotatorGroup_00", "dup").await.is_err());
        market.assign_qualification(&q, "W1", false).await.unwrap();
        market.assign_qualification(&q, "W1", false).await.unwrap();
        assert_eq!(market.qualifications_of("W1"), vec![q]);
        assert!(market.qualifications_of("W2").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let market = InMemoryMarketplace::new();
        assert!(market.list_assignments_for_task("nope").await.is_err());
        assert!(market.expire_task("nope").is_err());
    }
}
