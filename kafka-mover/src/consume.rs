use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::error::MoverError;
use crate::kafka::client::BrokerClient;
use crate::kafka::groups::GroupAdmin;
use crate::kafka::source::RecordSource;
use crate::key_filter::KeyFilter;
use crate::pump::{Assignment, MessagePump, OffsetReset, PumpSession};
use crate::types::Record;

/// Records in arrival order.
///
/// The stream closes its pump when it ends, after a read error or once the
/// cancellation token fires. A caller that wants to know cleanup finished
/// cancels the token and keeps reading until the stream is exhausted.
/// Dropping the stream early hands the close to a background task on the
/// current runtime instead.
pub type RecordStream = BoxStream<'static, Result<Record, MoverError>>;

/// Owns the pump behind a [`RecordStream`] and closes it however the stream goes away.
struct ClosingPump<S, G>
where
    S: RecordSource + 'static,
    G: GroupAdmin + 'static,
{
    pump: Option<MessagePump<S, G>>,
}

impl<S, G> ClosingPump<S, G>
where
    S: RecordSource + 'static,
    G: GroupAdmin + 'static,
{
    fn new(pump: MessagePump<S, G>) -> Self {
        Self { pump: Some(pump) }
    }

    async fn next(&mut self) -> Option<Result<Record, MoverError>> {
        let pump = self.pump.as_mut()?;
        match pump.next().await {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.close().await;
                None
            }
            Err(e) => {
                self.close().await;
                Some(Err(e))
            }
        }
    }

    async fn close(&mut self) {
        // Still owned while closing, so a drop mid-close finishes it in the background
        if let Some(pump) = self.pump.as_mut() {
            pump.close().await;
        }
        self.pump = None;
    }
}

impl<S, G> Drop for ClosingPump<S, G>
where
    S: RecordSource + 'static,
    G: GroupAdmin + 'static,
{
    fn drop(&mut self) {
        let Some(mut pump) = self.pump.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pump.close().await });
            }
            Err(_) => warn!(
                group = pump.session().group_id(),
                "Record stream dropped outside a runtime, consumer not closed"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeRequest {
    pub topics: Vec<String>,
    /// Generated (and deleted afterwards) when absent
    pub group: Option<String>,
    pub from_beginning: bool,
    pub from_latest: bool,
    pub limit: Option<u64>,
    pub key_filter: Option<String>,
}

impl ConsumeRequest {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            topics,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), MoverError> {
        if self.topics.is_empty() || self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(MoverError::InvalidArgument(
                "at least one non-empty topic is required".to_string(),
            ));
        }
        if self.from_beginning && self.from_latest {
            return Err(MoverError::InvalidArgument(
                "--from-beginning and --from-latest are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// Consumers start from the earliest offset unless asked otherwise.
    pub fn offset_reset(&self) -> OffsetReset {
        if self.from_latest {
            OffsetReset::Latest
        } else {
            OffsetReset::Earliest
        }
    }
}

pub async fn run_consume<C: BrokerClient>(
    client: &C,
    config: &Config,
    request: &ConsumeRequest,
    cancel: CancellationToken,
) -> Result<RecordStream, MoverError> {
    request.validate()?;

    let key_filter = request
        .key_filter
        .as_deref()
        .filter(|pattern| !pattern.is_empty())
        .map(KeyFilter::parse);

    let session = PumpSession::new(
        config,
        "consume",
        request.group.clone(),
        Assignment::Subscribe(request.topics.clone()),
        request.offset_reset(),
    )?
    .with_limit(request.limit)
    .with_key_filter(key_filter)
    .with_cancellation(cancel);

    let source = client.create_source(&session).await?;
    let pump = MessagePump::start(session, source, client.clone()).await?;

    let records = stream::unfold(ClosingPump::new(pump), |mut pump| async move {
        let next = pump.next().await?;
        Some((next, pump))
    });
    Ok(records.boxed())
}

/// Follow `topic` from its current end with a throwaway group.
pub async fn run_tail<C: BrokerClient>(
    client: &C,
    config: &Config,
    topic: &str,
    key_filter: Option<String>,
    cancel: CancellationToken,
) -> Result<RecordStream, MoverError> {
    let request = ConsumeRequest {
        topics: vec![topic.to_string()],
        from_latest: true,
        key_filter,
        ..Default::default()
    };
    run_consume(client, config, &request, cancel).await
}
