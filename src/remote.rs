use std::sync::Arc;

use crate::client::{QueryClient, QueryError, QueryOptions, QueryResponse};
use crate::query::GremlinQuery;
use crate::retry::{RetryPolicy, RetryTracker};
use crate::throttle::Throttle;

/// Everything a loader or uploader needs to talk to the store: the client,
/// the shared throttler, the retry policy and the run-wide retry counters.
#[derive(Clone)]
pub struct Remote {
    pub client: Arc<dyn QueryClient>,
    pub throttle: Arc<dyn Throttle>,
    pub policy: RetryPolicy,
    pub tracker: Arc<RetryTracker>,
    /// Charged to the throttler for an attempt that failed without reporting a cost.
    pub failed_attempt_cost: f64,
}

impl Remote {
    pub fn new(
        client: Arc<dyn QueryClient>,
        throttle: Arc<dyn Throttle>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            throttle,
            policy,
            tracker: Arc::new(RetryTracker::default()),
            failed_attempt_cost: 0.0,
        }
    }

    pub fn with_failed_attempt_cost(mut self, cost: f64) -> Self {
        self.failed_attempt_cost = cost;
        self
    }

    /// One attempt, with its cost reported to the throttler either way.
    pub async fn call(
        &self,
        query: &GremlinQuery,
        options: &QueryOptions,
    ) -> Result<QueryResponse, QueryError> {
        match self.client.submit(query, options).await {
            Ok(response) => {
                self.throttle.throttle(response.cost).await;
                Ok(response)
            }
            Err(err) => {
                if self.failed_attempt_cost > 0.0 {
                    self.throttle.throttle(self.failed_attempt_cost).await;
                }
                Err(err)
            }
        }
    }
}
