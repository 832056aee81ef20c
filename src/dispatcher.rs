//! Batch dispatch: format every event, deliver once, complete every event

use crate::config::{Config, FailurePolicy};
use crate::errors::{Result, SinkError};
use crate::event::LogEvent;
use crate::formatter::PayloadFormatter;
use crate::ingest;
use crate::transport::{DeliveryClient, build_client};
use std::io::BufRead;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// Outcome reported for every event of a batch.
pub type Outcome = std::result::Result<(), Arc<SinkError>>;

/// Completion callback invoked exactly once per event.
pub type Completion = Box<dyn FnOnce(Outcome) + Send>;

/// An event handed over by the host framework, with its completion callback.
pub struct PendingEvent {
    pub event: LogEvent,
    pub completion: Completion,
}

impl PendingEvent {
    pub fn new(event: LogEvent, completion: impl FnOnce(Outcome) + Send + 'static) -> Self {
        Self {
            event,
            completion: Box::new(completion),
        }
    }

    /// An event nobody waits on.
    pub fn detached(event: LogEvent) -> Self {
        Self::new(event, |_| {})
    }
}

/// Formats batches and hands them to a delivery client.
pub struct BatchDispatcher {
    formatter: PayloadFormatter,
    client: Arc<dyn DeliveryClient>,
    failure_policy: FailurePolicy,
}

impl BatchDispatcher {
    pub fn new(formatter: PayloadFormatter, client: Arc<dyn DeliveryClient>) -> Self {
        Self {
            formatter,
            client,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Create a dispatcher, formatter and client from the sink configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let formatter = PayloadFormatter::from_config(config)?;
        let client = build_client(config)?;

        Ok(Self::new(formatter, client).with_failure_policy(config.failure_policy))
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn formatter(&self) -> &PayloadFormatter {
        &self.formatter
    }

    /// Deliver a batch and complete each of its events in order.
    #[instrument(skip(self, batch), fields(batch_id = %Uuid::new_v4(), size = batch.len()))]
    pub async fn dispatch(&self, batch: Vec<PendingEvent>) -> Outcome {
        if batch.is_empty() {
            return Ok(());
        }

        let (events, completions): (Vec<LogEvent>, Vec<Completion>) = batch
            .into_iter()
            .map(|pending| (pending.event, pending.completion))
            .unzip();

        let outcome = self.deliver(&events).await.map_err(|e| {
            error!("Error while sending log messages: {}", e);
            Arc::new(e)
        });

        for completion in completions {
            completion(outcome.clone());
        }

        outcome
    }

    async fn deliver(&self, events: &[LogEvent]) -> Result<()> {
        let documents = events
            .iter()
            .map(|event| self.formatter.format(event))
            .collect::<Result<Vec<String>>>()?;

        debug!("Sending {} documents", documents.len());

        match self.client.send(&documents).await {
            Ok(()) => Ok(()),
            Err(e) if self.failure_policy == FailurePolicy::FailOpen => {
                warn!("Delivery failed, reporting batch as sent: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release the delivery client's connection.
    pub async fn close(&self) {
        self.client.close().await;
    }
}

/// Dispatcher for callers outside any async runtime.
///
/// `dispatch` blocks the calling thread until delivery finished or gave up.
pub struct BlockingDispatcher {
    runtime: Runtime,
    inner: BatchDispatcher,
}

impl BlockingDispatcher {
    pub fn new(inner: BatchDispatcher) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { runtime, inner })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(BatchDispatcher::from_config(config)?)
    }

    pub fn dispatch(&self, batch: Vec<PendingEvent>) -> Outcome {
        self.runtime.block_on(self.inner.dispatch(batch))
    }

    /// Read newline-delimited JSON events and dispatch them in batches of
    /// `batch_size`. Returns the number of events whose batch failed.
    ///
    /// Lines that are not UTF-8 or not a JSON object are skipped. A read error
    /// stops the input, but the events read so far are still dispatched.
    pub fn forward_lines<R: BufRead>(&self, reader: R, batch_size: usize) -> Result<usize> {
        let batch_size = batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        let mut failed = 0;
        let mut read_error = None;

        for line in reader.split(b'\n') {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("Could not read input: {}", e);
                    read_error = Some(e);
                    break;
                }
            };

            let Ok(line) = std::str::from_utf8(&line) else {
                warn!("Skipping line that is not valid UTF-8");
                continue;
            };

            match ingest::parse_line(line) {
                Ok(Some(event)) => batch.push(PendingEvent::detached(event)),
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping unparseable line: {}", e);
                    continue;
                }
            }

            if batch.len() >= batch_size {
                failed += self.dispatch_counting(&mut batch);
            }
        }

        failed += self.dispatch_counting(&mut batch);

        match read_error {
            Some(e) => Err(e.into()),
            None => Ok(failed),
        }
    }

    fn dispatch_counting(&self, batch: &mut Vec<PendingEvent>) -> usize {
        let size = batch.len();
        match self.dispatch(std::mem::take(batch)) {
            Ok(()) => 0,
            Err(_) => size,
        }
    }

    pub fn close(&self) {
        self.runtime.block_on(self.inner.close());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogLevel;
    use crate::formatter::RoutingMetadata;
    use crate::tcp::TcpTransport;
    use crate::transport::RetryPolicy;
    use async_trait::async_trait;
    use std::io::{BufReader, Cursor, Read};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every batch; fails with `RetriesExhausted` when `fail` is set.
    #[derive(Default)]
    struct RecordingClient {
        fail: bool,
        sent: Mutex<Vec<Vec<String>>>,
        closed: Mutex<u32>,
    }

    #[async_trait]
    impl DeliveryClient for RecordingClient {
        async fn send(&self, documents: &[String]) -> Result<()> {
            self.sent.lock().unwrap().push(documents.to_vec());
            if self.fail {
                Err(SinkError::RetriesExhausted { attempts: 5 })
            } else {
                Ok(())
            }
        }

        async fn close(&self) {
            *self.closed.lock().unwrap() += 1;
        }
    }

    type Calls = Arc<Mutex<Vec<(usize, Outcome)>>>;

    fn batch(messages: &[&str], calls: &Calls) -> Vec<PendingEvent> {
        messages
            .iter()
            .enumerate()
            .map(|(i, message)| {
                let calls = Arc::clone(calls);
                PendingEvent::new(LogEvent::new(LogLevel::Info, *message), move |outcome| {
                    calls.lock().unwrap().push((i, outcome));
                })
            })
            .collect()
    }

    fn dispatcher(client: Arc<RecordingClient>) -> BatchDispatcher {
        BatchDispatcher::new(PayloadFormatter::new(RoutingMetadata::default()), client)
    }

    #[tokio::test]
    async fn test_successful_batch_completes_every_event_in_order() {
        let client = Arc::new(RecordingClient::default());
        let dispatcher = dispatcher(Arc::clone(&client));
        let calls = Calls::default();

        let outcome = dispatcher.dispatch(batch(&["one", "two", "three"], &calls)).await;
        assert!(outcome.is_ok());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(calls.iter().all(|(_, outcome)| outcome.is_ok()));

        let sent = client.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 3);
        assert!(sent[0][0].contains("\"message\":\"one\""));
        assert!(sent[0][2].contains("\"message\":\"three\""));
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let client = Arc::new(RecordingClient::default());
        let dispatcher = dispatcher(Arc::clone(&client));

        assert!(dispatcher.dispatch(Vec::new()).await.is_ok());
        assert!(client.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_open_reports_success_after_exhausted_delivery() {
        let client = Arc::new(RecordingClient {
            fail: true,
            ..RecordingClient::default()
        });
        let dispatcher = dispatcher(Arc::clone(&client));
        let calls = Calls::default();

        assert!(dispatcher.dispatch(batch(&["a", "b"], &calls)).await.is_ok());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, outcome)| outcome.is_ok()));
    }

    #[tokio::test]
    async fn test_fail_closed_reports_delivery_error() {
        let client = Arc::new(RecordingClient {
            fail: true,
            ..RecordingClient::default()
        });
        let dispatcher =
            dispatcher(Arc::clone(&client)).with_failure_policy(FailurePolicy::FailClosed);
        let calls = Calls::default();

        let outcome = dispatcher.dispatch(batch(&["a", "b"], &calls)).await;
        assert!(matches!(
            outcome.as_ref().map_err(|e| &**e),
            Err(SinkError::RetriesExhausted { attempts: 5 })
        ));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, outcome)| outcome.is_err()));
    }

    #[tokio::test]
    async fn test_format_failure_fails_whole_batch_without_sending() {
        let client = Arc::new(RecordingClient::default());
        let dispatcher = BatchDispatcher::new(
            PayloadFormatter::new(RoutingMetadata::default()).include_all_properties(true),
            Arc::clone(&client) as Arc<dyn DeliveryClient>,
        );
        let calls = Calls::default();

        let mut pending = batch(&["fine"], &calls);
        let bad_calls = Arc::clone(&calls);
        pending.push(PendingEvent::new(
            LogEvent::new(LogLevel::Error, "broken").with_property("ratio", f64::NAN),
            move |outcome| bad_calls.lock().unwrap().push((1, outcome)),
        ));

        let outcome = dispatcher.dispatch(pending).await;
        assert!(matches!(outcome.as_ref().map_err(|e| &**e), Err(SinkError::Serialization(_))));
        assert!(client.sent.lock().unwrap().is_empty());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, outcome)| outcome.is_err()));
    }

    #[tokio::test]
    async fn test_unreachable_intake_still_completes_with_success() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new(
            "127.0.0.1".to_string(),
            port,
            false,
            "KEY".to_string(),
            RetryPolicy::new(5, Duration::ZERO),
        );
        let dispatcher = BatchDispatcher::new(
            PayloadFormatter::new(RoutingMetadata::default()),
            Arc::new(transport),
        );
        let calls = Calls::default();

        assert!(dispatcher.dispatch(batch(&["lost", "also lost"], &calls)).await.is_ok());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, outcome)| outcome.is_ok()));
    }

    #[test]
    fn test_blocking_dispatcher_runs_outside_runtime() {
        let client = Arc::new(RecordingClient::default());
        let blocking = BlockingDispatcher::new(dispatcher(Arc::clone(&client))).unwrap();
        let calls = Calls::default();

        assert!(blocking.dispatch(batch(&["first"], &calls)).is_ok());
        assert!(blocking.dispatch(batch(&["second"], &calls)).is_ok());
        blocking.close();

        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(client.sent.lock().unwrap().len(), 2);
        assert_eq!(*client.closed.lock().unwrap(), 1);
    }

    /// Yields `data`, then fails every further read.
    struct FailingReader {
        data: Cursor<Vec<u8>>,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(std::io::Error::other("input went away")),
                n => Ok(n),
            }
        }
    }

    fn sent_messages(client: &RecordingClient) -> Vec<Vec<String>> {
        client
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .map(|doc| {
                        let doc: serde_json::Value = serde_json::from_str(doc).unwrap();
                        doc["message"].as_str().unwrap().to_string()
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_forward_lines_skips_invalid_utf8_and_keeps_earlier_events() {
        let client = Arc::new(RecordingClient::default());
        let blocking = BlockingDispatcher::new(dispatcher(Arc::clone(&client))).unwrap();
        let mut input = b"{\"message\":\"first\"}\n{\"message\":\"second\"}\n".to_vec();
        input.extend_from_slice(b"\xff\xfe bad\n{\"message\":\"third\"}\n");

        let failed = blocking.forward_lines(input.as_slice(), 10).unwrap();

        assert_eq!(failed, 0);
        assert_eq!(sent_messages(&client), vec![vec!["first", "second", "third"]]);
    }

    #[test]
    fn test_forward_lines_batches_and_skips_bad_json() {
        let client = Arc::new(RecordingClient::default());
        let blocking = BlockingDispatcher::new(dispatcher(Arc::clone(&client))).unwrap();
        let input = "{\"message\":\"a\"}\nnot json\n\n{\"msg\":\"b\"}\n{\"text\":\"c\"}";

        assert_eq!(blocking.forward_lines(input.as_bytes(), 2).unwrap(), 0);
        assert_eq!(sent_messages(&client), vec![vec!["a", "b"], vec!["c"]]);
    }

    #[test]
    fn test_forward_lines_dispatches_pending_events_before_read_error() {
        let client = Arc::new(RecordingClient::default());
        let blocking = BlockingDispatcher::new(dispatcher(Arc::clone(&client))).unwrap();
        let reader = BufReader::new(FailingReader {
            data: Cursor::new(b"{\"message\":\"kept\"}\n".to_vec()),
        });

        let result = blocking.forward_lines(reader, 10);

        assert!(matches!(result, Err(SinkError::Io(_))));
        assert_eq!(sent_messages(&client), vec![vec!["kept"]]);
    }

    #[test]
    fn test_forward_lines_counts_failed_events() {
        let client = Arc::new(RecordingClient {
            fail: true,
            ..RecordingClient::default()
        });
        let blocking = BlockingDispatcher::new(
            dispatcher(Arc::clone(&client)).with_failure_policy(FailurePolicy::FailClosed),
        )
        .unwrap();
        let input = "{\"message\":\"a\"}\n{\"message\":\"b\"}\n{\"message\":\"c\"}\n";

        assert_eq!(blocking.forward_lines(input.as_bytes(), 2).unwrap(), 3);
    }

    #[test]
    fn test_from_config_rejects_missing_api_key() {
        let result = BatchDispatcher::from_config(&Config::default());
        assert!(matches!(result, Err(SinkError::Config(_))));
    }
}
