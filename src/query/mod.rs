//! The query side: fans one series request out to every relevant endpoint,
//! merges the label-sorted answer streams and deduplicates replicas.

pub mod dedup;
pub mod fanout;
pub mod merge;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{QuerySettings, DEFAULT_QUERY_DEADLINE};
use crate::error::{VaultError, VaultResult};
use crate::store::SeriesRequest;

pub use dedup::{ContinuityPreference, ReplicaPreference, SegmentCandidate};
pub use fanout::EndpointFeed;
pub use merge::{MergedSeries, MergedStream, QueryOutcome};
pub use registry::{EndpointEntry, EndpointRegistry, StaticRegistry};

use merge::MergeParams;

/// Per-call knobs. The deadline is a total wall-clock budget; the token lets
/// the caller abort early, and cancelling it reaches every in-flight
/// endpoint call.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub deadline: Duration,
    pub cancel: Option<CancellationToken>,
}

impl Default for QueryOptions {
    fn default() -> QueryOptions {
        QueryOptions {
            deadline: DEFAULT_QUERY_DEADLINE,
            cancel: None,
        }
    }
}

/// Front door of a query node. Holds the registry of known endpoints and
/// turns one [`SeriesRequest`] into a deduplicated [`MergedStream`].
pub struct QueryEngine<R> {
    registry: Arc<R>,
    settings: QuerySettings,
    preference: Arc<dyn ReplicaPreference>,
}

impl<R: EndpointRegistry> QueryEngine<R> {
    pub fn new(registry: Arc<R>, settings: QuerySettings) -> VaultResult<QueryEngine<R>> {
        settings.validate()?;
        Ok(QueryEngine {
            registry,
            settings,
            preference: Arc::new(ContinuityPreference),
        })
    }

    /// Swaps the replica selection policy used during dedup.
    pub fn with_preference(mut self, preference: Arc<dyn ReplicaPreference>) -> QueryEngine<R> {
        self.preference = preference;
        self
    }

    /// Starts one federated series query: prunes endpoints by their
    /// advertisements, dispatches the survivors concurrently and returns the
    /// merged stream. Pulling the stream drives the merge; dropping it
    /// cancels whatever is still running.
    pub fn query(
        &self,
        request: SeriesRequest,
        options: QueryOptions,
    ) -> VaultResult<MergedStream> {
        request.validate()?;
        if options.deadline.is_zero() {
            return Err(VaultError::InvalidConfiguration(
                "query deadline must be positive".to_string(),
            ));
        }

        let cancel = match &options.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        let known = self.registry.endpoints();
        let total = known.len();
        let survivors = fanout::prune(known, &request);
        tracing::debug!(
            "dispatching {} to {} of {} endpoints",
            request.matchers,
            survivors.len(),
            total
        );

        let deadline = Instant::now() + options.deadline;
        let skip_chunks = request.skip_chunks;
        let feeds = fanout::dispatch(survivors, &request, &self.settings, deadline, &cancel);

        Ok(MergedStream::new(
            feeds,
            MergeParams {
                replica_label: self.settings.replica_label.clone(),
                require_all: self.settings.require_all,
                skip_chunks,
                preference: self.preference.clone(),
                deadline,
                budget: options.deadline,
                cancel,
            },
        ))
    }
}
