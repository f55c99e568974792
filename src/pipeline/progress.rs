// # Job event dispatch
//
// Every job event goes through one channel; a background task fans it out to
// subscribers and folds it into the status snapshots.

use crate::pipeline::types::{JobEvent, JobId, JobStatus};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, RwLock,
};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::debug;

type SubscriptionId = u64;

/// Filter criteria for event subscriptions
#[derive(Debug, Clone)]
enum SubscriptionFilter {
    Job { job_id: JobId },
    All,
}

impl SubscriptionFilter {
    fn matches(&self, event: &JobEvent) -> bool {
        match self {
            SubscriptionFilter::Job { job_id } => event.job_id() == job_id,
            SubscriptionFilter::All => true,
        }
    }
}

struct Subscription {
    filter: SubscriptionFilter,
    tx: tokio_mpsc::UnboundedSender<JobEvent>,
}

pub(crate) type StatusMap = Arc<RwLock<HashMap<JobId, JobStatus>>>;

/// Subscriptions and status snapshots for all jobs
#[derive(Clone)]
pub struct JobEventHandle {
    subscriptions: Arc<Mutex<HashMap<SubscriptionId, Subscription>>>,
    statuses: StatusMap,
    next_id: Arc<AtomicU64>,
}

impl JobEventHandle {
    /// Spawn the dispatch task for `event_rx`
    pub fn new(mut event_rx: tokio_mpsc::UnboundedReceiver<JobEvent>) -> Self {
        let subscriptions: Arc<Mutex<HashMap<SubscriptionId, Subscription>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let statuses: StatusMap = Arc::new(RwLock::new(HashMap::new()));

        let subscriptions_clone = subscriptions.clone();
        let statuses_clone = statuses.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                {
                    let mut statuses = statuses_clone.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(status) = statuses.get_mut(event.job_id()) {
                        status.apply(&event);
                    }
                }

                let mut subs = subscriptions_clone.lock().unwrap_or_else(|e| e.into_inner());
                // Receivers that were dropped
                let mut to_remove = Vec::new();
                for (id, subscription) in subs.iter() {
                    if subscription.filter.matches(&event)
                        && subscription.tx.send(event.clone()).is_err()
                    {
                        to_remove.push(*id);
                    }
                }
                for id in to_remove {
                    subs.remove(&id);
                }
            }
            debug!("Job event channel closed");
        });

        Self {
            subscriptions,
            statuses,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn subscribe(&self, filter: SubscriptionFilter) -> tokio_mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Subscription { filter, tx });
        rx
    }

    /// Events of one job. Dropping the receiver ends the subscription.
    pub fn subscribe_job(&self, job_id: &str) -> tokio_mpsc::UnboundedReceiver<JobEvent> {
        self.subscribe(SubscriptionFilter::Job {
            job_id: job_id.to_string(),
        })
    }

    pub fn subscribe_all(&self) -> tokio_mpsc::UnboundedReceiver<JobEvent> {
        self.subscribe(SubscriptionFilter::All)
    }

    /// Start tracking a job's status; events for unknown jobs only reach subscribers
    pub fn track(&self, status: JobStatus) {
        self.statuses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(status.job_id.clone(), status);
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format_detector::InputVariant;
    use crate::pipeline::types::JobStage;

    fn variant() -> InputVariant {
        InputVariant::SingleContainerFile {
            file: "/a.mkv".into(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_only_see_their_job() {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let handle = JobEventHandle::new(rx);
        let mut job_a = handle.subscribe_job("a");
        let mut all = handle.subscribe_all();

        tx.send(JobEvent::Cancelled { job_id: "b".into() }).unwrap();
        tx.send(JobEvent::Cancelled { job_id: "a".into() }).unwrap();

        assert_eq!(job_a.recv().await.unwrap().job_id(), "a");
        assert_eq!(all.recv().await.unwrap().job_id(), "b");
        assert_eq!(all.recv().await.unwrap().job_id(), "a");
    }

    #[tokio::test]
    async fn test_status_follows_events() {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let handle = JobEventHandle::new(rx);
        handle.track(JobStatus::new("a", "/a.mkv", variant()));
        let mut events = handle.subscribe_job("a");

        tx.send(JobEvent::StageChanged {
            job_id: "a".into(),
            stage: JobStage::Extracting,
        })
        .unwrap();
        tx.send(JobEvent::Progress {
            job_id: "a".into(),
            percent: 42.0,
            detail: None,
        })
        .unwrap();
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        let status = handle.status("a").unwrap();
        assert_eq!(status.stage, JobStage::Extracting);
        assert_eq!(status.percent, Some(42.0));
        assert!(handle.status("zzz").is_none());
    }
}
