use std::{future::Future, sync::Arc, time::Duration};

use chainsync_common::{
    models::BlockHash,
    traits::{ChainDataSource, NotificationChannel},
};
use metrics::{counter, gauge};
use serde::Deserialize;
use tokio::{
    sync::{mpsc::Receiver, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use super::{signal::NewBlockSignal, BlockListener, SyncError, SyncResult};

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    /// Upper bound for waiting on a new block notification before polling the node again.
    #[serde(with = "duration_secs", rename = "new_block_timeout_secs")]
    pub new_block_timeout: Duration,
    pub notification_topic: String,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self { new_block_timeout: Duration::from_secs(30), notification_topic: "hashblock".into() }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Terminal state of a retrieval loop.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    /// The loop observed a stop request and unwound.
    Cancelled,
    /// The loop hit an error it can't recover from.
    Faulted(SyncError),
}

/// Handle to a running retrieval loop, resolves once the loop terminated.
#[derive(Clone, Debug)]
pub struct RetrievalTask {
    outcome: watch::Receiver<Option<TaskOutcome>>,
}

impl RetrievalTask {
    /// Waits for the loop to terminate.
    pub async fn wait(&mut self) -> TaskOutcome {
        match self
            .outcome
            .wait_for(Option::is_some)
            .await
        {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or(TaskOutcome::Cancelled),
            // The sender lives until the outcome is published, this only happens if the
            // supervising task itself was torn down.
            Err(_) => TaskOutcome::Faulted(SyncError::TaskPanicked(
                "retrieval task dropped without an outcome".to_string(),
            )),
        }
    }

    /// The outcome, if the loop already terminated.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

struct RunningRetrieval {
    cancel: CancellationToken,
    task: RetrievalTask,
    forwarder: Option<JoinHandle<()>>,
}

enum RetrieverState {
    Idle,
    /// Also covers a loop that faulted but was not stopped yet.
    Running(RunningRetrieval),
    Disposed,
}

/// Drives the fetch and advance loop feeding candidate blocks to a [`BlockListener`].
///
/// A block that is not available yet is waited for until either a notification arrives on the
/// configured topic or `new_block_timeout` elapses, whichever comes first.
pub struct BlockRetriever {
    source: Arc<dyn ChainDataSource>,
    notifications: Arc<dyn NotificationChannel>,
    config: RetrieverConfig,
    signal: Arc<NewBlockSignal>,
    state: Mutex<RetrieverState>,
}

impl BlockRetriever {
    pub fn new(
        source: Arc<dyn ChainDataSource>,
        notifications: Arc<dyn NotificationChannel>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            source,
            notifications,
            config,
            signal: Arc::new(NewBlockSignal::new()),
            state: Mutex::new(RetrieverState::Idle),
        }
    }

    /// Starts the retrieval loop in the background and returns immediately.
    #[instrument(skip_all)]
    pub async fn start(&self, listener: Arc<dyn BlockListener>) -> SyncResult<RetrievalTask> {
        let mut state = self.state.lock().await;
        match *state {
            RetrieverState::Idle => {}
            RetrieverState::Running(_) => return Err(SyncError::AlreadyStarted),
            RetrieverState::Disposed => return Err(SyncError::Disposed),
        }

        let cancel = CancellationToken::new();
        let forwarder = match self
            .notifications
            .subscribe(&self.config.notification_topic)
            .await
        {
            Ok(rx) => Some(tokio::spawn(
                forward_notifications(rx, self.signal.clone(), cancel.clone())
                    .instrument(tracing::debug_span!("notification_forwarder")),
            )),
            Err(err) => {
                warn!(
                    error = %err,
                    timeout = ?self.config.new_block_timeout,
                    "Notification subscription failed, relying on timeouts only"
                );
                None
            }
        };

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let worker = tokio::spawn(
            retrieve_blocks(
                self.source.clone(),
                listener,
                self.signal.clone(),
                cancel.clone(),
                self.config.new_block_timeout,
            )
            .instrument(tracing::info_span!(
                parent: None,
                "block_retriever",
                height = tracing::field::Empty
            )),
        );
        // Publishes the outcome, also if the loop panicked.
        tokio::spawn(async move {
            let outcome = match worker.await {
                Ok(Ok(())) => TaskOutcome::Cancelled,
                Ok(Err(err)) => {
                    error!(error = %err, "Block retrieval faulted");
                    TaskOutcome::Faulted(err)
                }
                Err(err) => {
                    error!(error = %err, "Block retrieval task panicked");
                    TaskOutcome::Faulted(SyncError::TaskPanicked(err.to_string()))
                }
            };
            let _ = outcome_tx.send(Some(outcome));
        });

        let task = RetrievalTask { outcome: outcome_rx };
        *state = RetrieverState::Running(RunningRetrieval {
            cancel,
            task: task.clone(),
            forwarder,
        });
        info!(topic = %self.config.notification_topic, "Block retriever started");
        Ok(task)
    }

    /// Cancels the loop and waits until it terminated.
    ///
    /// A fault of the loop is not returned here, it is available through the [`RetrievalTask`].
    #[instrument(skip_all)]
    pub async fn stop(&self) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, RetrieverState::Idle) {
            RetrieverState::Running(running) => {
                // Keep the lock until the loop is gone so a concurrent start can't overlap it.
                Self::shutdown(running).await;
                Ok(())
            }
            RetrieverState::Idle => Err(SyncError::NotRunning),
            RetrieverState::Disposed => {
                *state = RetrieverState::Disposed;
                Err(SyncError::Disposed)
            }
        }
    }

    /// Stops the loop if it is running and releases all resources. Calling it again is a no-op.
    #[instrument(skip_all)]
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if let RetrieverState::Running(running) =
            std::mem::replace(&mut *state, RetrieverState::Disposed)
        {
            Self::shutdown(running).await;
        }
        self.signal.dispose();
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, RetrieverState::Running(_))
    }

    async fn shutdown(mut running: RunningRetrieval) {
        running.cancel.cancel();
        if let Some(forwarder) = running.forwarder.take() {
            if let Err(err) = forwarder.await {
                warn!(error = %err, "Notification forwarder did not shut down cleanly");
            }
        }
        let outcome = running.task.wait().await;
        debug!(?outcome, "Block retriever stopped");
    }
}

impl Drop for BlockRetriever {
    fn drop(&mut self) {
        // Can't await here, the loop notices the cancellation on its own.
        if let RetrieverState::Running(running) = self.state.get_mut() {
            running.cancel.cancel();
        }
    }
}

/// Runs `fut` unless `cancel` fires first.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}

/// The retrieval loop. Returns `Ok(())` only once cancelled.
async fn retrieve_blocks(
    source: Arc<dyn ChainDataSource>,
    listener: Arc<dyn BlockListener>,
    signal: Arc<NewBlockSignal>,
    cancel: CancellationToken,
    new_block_timeout: Duration,
) -> SyncResult<()> {
    let Some(start) = cancellable(&cancel, listener.get_start_height()).await else {
        return Ok(());
    };
    let mut height = start?;
    info!(height, "Starting block retrieval");

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        tracing::Span::current().record("height", height);
        gauge!("chainsync_expected_height").set(height as f64);

        let Some(candidate) = cancellable(&cancel, source.get_block_by_height(height)).await
        else {
            return Ok(());
        };
        if let Some(block) = candidate? {
            trace!(height, hash = %block.hash, "Fetched candidate block");
            // Listener calls are never interrupted, each of them is one atomic step.
            height = listener
                .process_block(&block, height)
                .await?;
            continue;
        }

        // Registered before asking for the remote height so a notification arriving during
        // that call still wakes us.
        let woken = signal.register()?;
        let Some(summary) = cancellable(&cancel, source.get_chain_summary()).await else {
            return Ok(());
        };
        let remote = summary?.height;

        if remote >= height {
            // Produced in between both calls, ask again right away.
            trace!(height, remote, "Block appeared meanwhile, retrying");
            drop(woken);
            tokio::task::yield_now().await;
        } else if remote + 1 == height {
            debug!(height, "Waiting for new block");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                res = timeout(new_block_timeout, woken) => {
                    if res.is_err() {
                        trace!(height, "No new block notification, polling again");
                    }
                }
            }
        } else {
            warn!(
                height,
                remote,
                "Remote chain is shorter than expected, discarding local blocks"
            );
            counter!("chainsync_reorgs_total").increment(1);
            drop(woken);
            listener
                .discard_blocks(remote)
                .await?;
            height = remote;
        }
    }
}

async fn forward_notifications(
    mut rx: Receiver<BlockHash>,
    signal: Arc<NewBlockSignal>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(hash) => {
                    let woken = signal.release();
                    trace!(%hash, woken, "New block notification");
                }
                None => {
                    warn!("Notification channel closed, relying on timeouts only");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use chainsync_common::{
        models::{
            blockchain::{Block, ChainSummary},
            error::{DataSourceError, NotificationError},
            Height,
        },
        traits::{MockChainDataSource, MockNotificationChannel},
        Bytes,
    };
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::synchronizer::MockBlockListener;

    fn int_hash(no: u64) -> Bytes {
        Bytes::from(no.to_be_bytes())
    }

    fn block(no: u64) -> Block {
        let parent_hash = int_hash(no.wrapping_sub(1));
        Block { hash: int_hash(no), parent_hash, ..Default::default() }
    }

    fn summary(height: Height) -> ChainSummary {
        ChainSummary::new("regtest", height, int_hash(height))
    }

    /// Subscriptions succeed but the channel is closed right away.
    fn closed_notifications() -> MockNotificationChannel {
        let mut notifications = MockNotificationChannel::new();
        notifications
            .expect_subscribe()
            .returning(|_| {
                let (_, rx) = mpsc::channel(1);
                Ok(rx)
            });
        notifications
    }

    /// A listener that starts at `start`, never moves and is never asked to do anything else.
    fn idle_listener(start: Height) -> MockBlockListener {
        let mut listener = MockBlockListener::new();
        listener
            .expect_get_start_height()
            .returning(move || Ok(start));
        listener
    }

    /// A source whose remote tip is `tip` and that has no block above it.
    fn source_at_tip(tip: Height) -> MockChainDataSource {
        let mut source = MockChainDataSource::new();
        source
            .expect_get_block_by_height()
            .returning(|_| Ok(None));
        source
            .expect_get_chain_summary()
            .returning(move || Ok(summary(tip)));
        source
    }

    fn retriever(
        source: MockChainDataSource,
        notifications: MockNotificationChannel,
        new_block_timeout: Duration,
    ) -> BlockRetriever {
        BlockRetriever::new(
            Arc::new(source),
            Arc::new(notifications),
            RetrieverConfig { new_block_timeout, ..Default::default() },
        )
    }

    #[tokio::test]
    async fn test_remote_shortened_discards_to_remote_height() {
        let summaries = Arc::new(AtomicUsize::new(0));
        let mut source = MockChainDataSource::new();
        source
            .expect_get_block_by_height()
            .with(eq(5))
            .times(1)
            .returning(|_| Ok(None));
        source
            .expect_get_block_by_height()
            .with(eq(3))
            .returning(|_| Ok(None));
        source
            .expect_get_chain_summary()
            .returning(move || {
                // 3 on the first call, then the remote is one block behind height 3.
                let call = summaries.fetch_add(1, Ordering::SeqCst);
                Ok(summary(if call == 0 { 3 } else { 2 }))
            });
        let (discarded_tx, mut discarded_rx) = mpsc::unbounded_channel();
        let mut listener = idle_listener(5);
        listener
            .expect_discard_blocks()
            .with(eq(3))
            .times(1)
            .returning(move |target| {
                discarded_tx.send(target).unwrap();
                Ok(())
            });
        let retriever = retriever(source, closed_notifications(), Duration::from_secs(3600));

        let mut task = retriever
            .start(Arc::new(listener))
            .await
            .expect("start");

        assert_eq!(discarded_rx.recv().await, Some(3));
        retriever
            .stop()
            .await
            .expect("stop");
        assert_eq!(task.wait().await, TaskOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_advances_and_rewinds_as_listener_decides() {
        let mut source = MockChainDataSource::new();
        source
            .expect_get_block_by_height()
            .with(eq(2))
            .returning(|_| Ok(Some(block(2))));
        source
            .expect_get_block_by_height()
            .with(eq(3))
            .returning(|_| Ok(Some(block(3))));
        source
            .expect_get_block_by_height()
            .with(eq(4))
            .returning(|_| Ok(None));
        source
            .expect_get_chain_summary()
            .returning(|| Ok(summary(3)));
        let processed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let rewound = Arc::new(AtomicUsize::new(0));
        let mut listener = idle_listener(2);
        {
            let processed = processed.clone();
            listener
                .expect_process_block()
                .returning(move |block, height| {
                    processed
                        .lock()
                        .unwrap()
                        .push(height);
                    // Reject block 3 once, as if it did not extend our tip.
                    if block.hash == int_hash(3) && rewound.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok(2)
                    } else {
                        Ok(height + 1)
                    }
                });
        }
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let mut notifications = MockNotificationChannel::new();
        let notify_rx = std::sync::Mutex::new(Some(notify_rx));
        notifications
            .expect_subscribe()
            .returning(move |_| {
                notify_rx
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or(NotificationError::Closed)
            });
        let retriever = retriever(source, notifications, Duration::from_secs(3600));

        retriever
            .start(Arc::new(listener))
            .await
            .expect("start");
        // The loop settles waiting for height 4, nothing else to do until notified.
        while processed.lock().unwrap().len() < 4 {
            tokio::task::yield_now().await;
        }
        retriever
            .stop()
            .await
            .expect("stop");
        drop(notify_tx);

        assert_eq!(*processed.lock().unwrap(), vec![2, 3, 2, 3]);
    }

    #[tokio::test]
    async fn test_notification_wakes_waiting_loop() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let remote_tip = Arc::new(AtomicU64::new(0));
        let mut source = MockChainDataSource::new();
        {
            let fetches = fetches.clone();
            let remote_tip = remote_tip.clone();
            source
                .expect_get_block_by_height()
                .with(eq(1))
                .returning(move |_| {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    if remote_tip.load(Ordering::SeqCst) == 0 {
                        Ok(None)
                    } else {
                        Ok(Some(block(1)))
                    }
                });
        }
        source
            .expect_get_block_by_height()
            .with(eq(2))
            .returning(|_| Ok(None));
        let (waiting_tx, mut waiting_rx) = mpsc::unbounded_channel();
        {
            let remote_tip = remote_tip.clone();
            source
                .expect_get_chain_summary()
                .returning(move || {
                    let _ = waiting_tx.send(());
                    Ok(summary(remote_tip.load(Ordering::SeqCst)))
                });
        }
        let (processed_tx, mut processed_rx) = mpsc::unbounded_channel();
        let mut listener = idle_listener(1);
        listener
            .expect_process_block()
            .returning(move |block, height| {
                processed_tx
                    .send(block.hash.clone())
                    .unwrap();
                Ok(height + 1)
            });
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let mut notifications = MockNotificationChannel::new();
        let notify_rx = std::sync::Mutex::new(Some(notify_rx));
        notifications
            .expect_subscribe()
            .with(eq("hashblock"))
            .returning(move |_| {
                notify_rx
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or(NotificationError::Closed)
            });
        let retriever = retriever(source, notifications, Duration::from_secs(3600));

        retriever
            .start(Arc::new(listener))
            .await
            .expect("start");
        // On the current thread runtime the loop only yields once it is parked on the signal.
        waiting_rx.recv().await.unwrap();
        remote_tip.store(1, Ordering::SeqCst);
        notify_tx
            .send(int_hash(1))
            .await
            .unwrap();

        assert_eq!(processed_rx.recv().await, Some(int_hash(1)));
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        retriever
            .stop()
            .await
            .expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_failure_falls_back_to_timeout() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let mut source = MockChainDataSource::new();
        {
            let fetches = fetches.clone();
            source
                .expect_get_block_by_height()
                .with(eq(1))
                .returning(move |_| {
                    if fetches.fetch_add(1, Ordering::SeqCst) < 3 {
                        Ok(None)
                    } else {
                        Ok(Some(block(1)))
                    }
                });
        }
        source
            .expect_get_block_by_height()
            .with(eq(2))
            .returning(|_| Ok(None));
        source
            .expect_get_chain_summary()
            .returning(move || {
                // The remote produces block 1 together with the fourth fetch.
                Ok(summary(if fetches.load(Ordering::SeqCst) > 3 { 1 } else { 0 }))
            });
        let mut notifications = MockNotificationChannel::new();
        notifications
            .expect_subscribe()
            .returning(|topic| {
                Err(NotificationError::SubscribeError(topic.to_string(), "refused".to_string()))
            });
        let (processed_tx, mut processed_rx) = mpsc::unbounded_channel();
        let mut listener = idle_listener(1);
        listener
            .expect_process_block()
            .returning(move |_, height| {
                processed_tx.send(height).unwrap();
                Ok(height + 1)
            });
        let retriever = retriever(source, notifications, Duration::from_secs(30));
        let started = tokio::time::Instant::now();

        retriever
            .start(Arc::new(listener))
            .await
            .expect("start");

        assert_eq!(processed_rx.recv().await, Some(1));
        assert!(started.elapsed() >= Duration::from_secs(90));
        retriever
            .stop()
            .await
            .expect("stop");
    }

    #[tokio::test]
    async fn test_data_source_fault_terminates_loop() {
        let mut source = MockChainDataSource::new();
        source
            .expect_get_block_by_height()
            .returning(|_| Err(DataSourceError::Transport("connection refused".to_string())));
        let retriever =
            retriever(source, closed_notifications(), Duration::from_secs(3600));

        let mut task = retriever
            .start(Arc::new(idle_listener(0)))
            .await
            .expect("start");
        let outcome = task.wait().await;

        assert_eq!(
            outcome,
            TaskOutcome::Faulted(SyncError::DataSource(DataSourceError::Transport(
                "connection refused".to_string()
            )))
        );
        // A faulted loop still counts as started until stopped.
        assert_eq!(
            retriever
                .start(Arc::new(idle_listener(0)))
                .await
                .err(),
            Some(SyncError::AlreadyStarted)
        );
        retriever
            .stop()
            .await
            .expect("stop does not surface the fault");
        assert!(!retriever.is_running().await);
    }

    #[tokio::test]
    async fn test_listener_fault_terminates_loop() {
        let mut source = MockChainDataSource::new();
        source
            .expect_get_block_by_height()
            .returning(|_| Ok(Some(block(0))));
        let mut listener = idle_listener(0);
        listener
            .expect_process_block()
            .returning(|_, _| Err(SyncError::InvalidArgument("not genesis".to_string())));
        let retriever =
            retriever(source, closed_notifications(), Duration::from_secs(3600));

        let mut task = retriever
            .start(Arc::new(listener))
            .await
            .expect("start");

        assert_eq!(
            task.wait().await,
            TaskOutcome::Faulted(SyncError::InvalidArgument("not genesis".to_string()))
        );
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn test_lifecycle_misuse() {
        let retriever =
            retriever(source_at_tip(0), closed_notifications(), Duration::from_secs(3600));

        assert_eq!(retriever.stop().await, Err(SyncError::NotRunning));

        let task = retriever
            .start(Arc::new(idle_listener(1)))
            .await
            .expect("start");
        assert_eq!(
            retriever
                .start(Arc::new(idle_listener(1)))
                .await
                .err(),
            Some(SyncError::AlreadyStarted)
        );
        retriever
            .stop()
            .await
            .expect("stop");
        assert_eq!(task.outcome(), Some(TaskOutcome::Cancelled));
        assert_eq!(retriever.stop().await, Err(SyncError::NotRunning));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let retriever =
            retriever(source_at_tip(0), closed_notifications(), Duration::from_secs(3600));

        for _ in 0..2 {
            retriever
                .start(Arc::new(idle_listener(1)))
                .await
                .expect("start");
            retriever
                .stop()
                .await
                .expect("stop");
        }
    }

    #[tokio::test]
    async fn test_dispose() {
        let retriever =
            retriever(source_at_tip(0), closed_notifications(), Duration::from_secs(3600));
        let task = retriever
            .start(Arc::new(idle_listener(1)))
            .await
            .expect("start");

        retriever.dispose().await;
        retriever.dispose().await;

        assert_eq!(task.outcome(), Some(TaskOutcome::Cancelled));
        assert_eq!(retriever.stop().await, Err(SyncError::Disposed));
        assert_eq!(
            retriever
                .start(Arc::new(idle_listener(1)))
                .await
                .err(),
            Some(SyncError::Disposed)
        );
    }

    #[tokio::test]
    async fn test_dispose_idle_retriever() {
        let retriever = retriever(
            MockChainDataSource::new(),
            MockNotificationChannel::new(),
            Duration::from_secs(1),
        );

        retriever.dispose().await;

        assert_eq!(retriever.stop().await, Err(SyncError::Disposed));
    }

    #[test]
    fn test_config_from_yaml() {
        let config: RetrieverConfig =
            serde_yaml::from_str("new_block_timeout_secs: 5\n").expect("parse");

        assert_eq!(
            config,
            RetrieverConfig {
                new_block_timeout: Duration::from_secs(5),
                notification_topic: "hashblock".to_string()
            }
        );
    }

    /// Which data source call never completes.
    #[derive(Clone, Copy, Debug)]
    enum Stall {
        BlockByHeight,
        ChainSummary,
    }

    /// A data source hanging forever on one call, reporting when the hanging call was entered.
    struct StalledSource {
        stall: Stall,
        entered: mpsc::UnboundedSender<()>,
    }

    #[async_trait::async_trait]
    impl ChainDataSource for StalledSource {
        async fn get_block_by_height(
            &self,
            _height: Height,
        ) -> Result<Option<Block>, DataSourceError> {
            if let Stall::BlockByHeight = self.stall {
                let _ = self.entered.send(());
                std::future::pending::<()>().await;
            }
            Ok(None)
        }

        async fn get_block_by_hash(
            &self,
            _hash: &BlockHash,
        ) -> Result<Option<Block>, DataSourceError> {
            Ok(None)
        }

        async fn get_chain_summary(&self) -> Result<ChainSummary, DataSourceError> {
            let _ = self.entered.send(());
            std::future::pending::<()>().await;
            Ok(summary(0))
        }
    }

    #[rstest::rstest]
    #[case::block_by_height(Stall::BlockByHeight)]
    #[case::chain_summary(Stall::ChainSummary)]
    #[tokio::test]
    async fn test_stop_interrupts_pending_data_source_call(#[case] stall: Stall) {
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
        let source = StalledSource { stall, entered: entered_tx };
        let mut listener = idle_listener(1);
        listener.expect_process_block().never();
        listener.expect_discard_blocks().never();
        let retriever = BlockRetriever::new(
            Arc::new(source),
            Arc::new(closed_notifications()),
            RetrieverConfig { new_block_timeout: Duration::from_secs(3600), ..Default::default() },
        );

        let mut task = retriever
            .start(Arc::new(listener))
            .await
            .expect("start");
        entered_rx
            .recv()
            .await
            .expect("stalled call entered");

        timeout(Duration::from_secs(5), retriever.stop())
            .await
            .expect("stop did not wait on the pending call")
            .expect("stop");
        assert_eq!(task.wait().await, TaskOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_notification_during_summary_call_is_not_lost() {
        let signal_slot: Arc<std::sync::OnceLock<Arc<NewBlockSignal>>> = Arc::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let mut source = MockChainDataSource::new();
        {
            let fetches = fetches.clone();
            source
                .expect_get_block_by_height()
                .with(eq(1))
                .returning(move |_| {
                    if fetches.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok(None)
                    } else {
                        Ok(Some(block(1)))
                    }
                });
        }
        source
            .expect_get_block_by_height()
            .with(eq(2))
            .returning(|_| Ok(None));
        {
            let signal_slot = signal_slot.clone();
            let fetches = fetches.clone();
            source
                .expect_get_chain_summary()
                .returning(move || {
                    // Block 1 shows up while the remote height is being asked for.
                    if fetches.load(Ordering::SeqCst) == 1 {
                        if let Some(signal) = signal_slot.get() {
                            signal.release();
                        }
                        return Ok(summary(0));
                    }
                    Ok(summary(1))
                });
        }
        let (processed_tx, mut processed_rx) = mpsc::unbounded_channel();
        let mut listener = idle_listener(1);
        listener
            .expect_process_block()
            .returning(move |_, height| {
                processed_tx.send(height).unwrap();
                Ok(height + 1)
            });
        let retriever = retriever(source, closed_notifications(), Duration::from_secs(3600));
        let _ = signal_slot.set(retriever.signal.clone());

        retriever
            .start(Arc::new(listener))
            .await
            .expect("start");

        let processed = timeout(Duration::from_secs(5), processed_rx.recv())
            .await
            .expect("woken without waiting for the timeout");
        assert_eq!(processed, Some(1));
        retriever
            .stop()
            .await
            .expect("stop");
    }
}
