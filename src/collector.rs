use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::db::Db;

/// One incoming bot update, reduced to what reconciliation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderUpdate {
    pub update_id: i64,
    pub username: Option<String>,
    pub chat_id: Option<i64>,
}

#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Updates with id >= `offset`, oldest first.
    async fn fetch(&self, offset: i64) -> Result<Vec<SenderUpdate>>;
}

pub trait ChatIdStore: Send {
    /// Returns how many user records changed.
    fn assign_chat_id(&self, username: &str, chat_id: i64) -> Result<usize>;
}

impl ChatIdStore for Db {
    fn assign_chat_id(&self, username: &str, chat_id: i64) -> Result<usize> {
        self.assign_telegram_chat_id(username, chat_id)
    }
}

pub struct ChatIdCollector<U, S> {
    source: U,
    store: S,
    offset: i64,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl<U, S> ChatIdCollector<U, S>
where
    U: UpdateSource + 'static,
    S: ChatIdStore + 'static,
{
    pub fn new(source: U, store: S, poll_interval: Duration, error_backoff: Duration) -> Self {
        Self {
            source,
            store,
            offset: 0,
            poll_interval,
            error_backoff,
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Processes one batch of updates. The cursor moves past an update only
    /// once it has been stored, so a store failure replays it next poll.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let updates = self.source.fetch(self.offset).await?;
        let mut changed = 0;

        for update in updates {
            if let (Some(username), Some(chat_id)) = (&update.username, update.chat_id) {
                let n = self.store.assign_chat_id(username, chat_id)?;
                if n > 0 {
                    info!("Resolved chat id {chat_id} for @{username} ({n} user(s))");
                }
                changed += n;
            }
            self.offset = self.offset.max(update.update_id + 1);
        }

        debug!("Chat id poll done, next offset {}", self.offset);
        Ok(changed)
    }

    /// Spawns the polling loop, guarded by the process-wide running flag.
    pub fn start(self) -> Result<CollectorHandle> {
        self.start_guarded(&COLLECTOR_RUNNING)
    }

    /// Spawns the polling loop under `running`; starting while it is set
    /// fails.
    pub fn start_guarded(self, running: &'static AtomicBool) -> Result<CollectorHandle> {
        if running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!("chat id collector is already running");
        }

        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(running, wake.clone()));
        Ok(CollectorHandle {
            running,
            wake,
            task,
        })
    }

    async fn run(mut self, running: &'static AtomicBool, wake: Arc<Notify>) {
        // Cleared on exit, including when a poll panics.
        let _guard = RunningGuard(running);
        info!("Chat id collector started");
        while running.load(Ordering::SeqCst) {
            let pause = match self.poll_once().await {
                Ok(_) => self.poll_interval,
                Err(e) => {
                    warn!("Chat id poll failed, backing off: {e:#}");
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = wake.notified() => {}
            }
        }
        info!("Chat id collector stopped at offset {}", self.offset);
    }
}

static COLLECTOR_RUNNING: AtomicBool = AtomicBool::new(false);

struct RunningGuard(&'static AtomicBool);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct CollectorHandle {
    running: &'static AtomicBool,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    /// Clears the running flag; the loop exits after its current poll.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.task.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves scripted batches and records the offsets it was asked for.
    #[derive(Clone, Default)]
    struct ScriptedSource {
        batches: Arc<Mutex<VecDeque<Result<Vec<SenderUpdate>>>>>,
        offsets: Arc<Mutex<Vec<i64>>>,
    }

    impl ScriptedSource {
        fn push(&self, batch: Result<Vec<SenderUpdate>>) {
            self.batches.lock().unwrap().push_back(batch);
        }
    }

    #[async_trait]
    impl UpdateSource for ScriptedSource {
        async fn fetch(&self, offset: i64) -> Result<Vec<SenderUpdate>> {
            self.offsets.lock().unwrap().push(offset);
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn update(id: i64, username: Option<&str>, chat_id: i64) -> SenderUpdate {
        SenderUpdate {
            update_id: id,
            username: username.map(str::to_string),
            chat_id: Some(chat_id),
        }
    }

    fn db_with_users() -> Db {
        let db = Db::open_in_memory().unwrap();
        let g = db.get_or_create_group("all", "").unwrap();
        db.upsert_user(1, "a@x.io", "", "@Alice", g).unwrap();
        db.upsert_user(2, "b@x.io", "", "bob", g).unwrap();
        db
    }

    #[tokio::test]
    async fn resolves_matching_senders_and_advances_cursor() {
        let source = ScriptedSource::default();
        source.push(Ok(vec![
            update(10, Some("alice"), 501),
            update(11, None, 999),
            update(12, Some("stranger"), 502),
        ]));
        source.push(Ok(vec![update(13, Some("BOB"), 503)]));

        let mut collector = ChatIdCollector::new(
            source.clone(),
            db_with_users(),
            Duration::from_secs(1),
            Duration::from_secs(5),
        );

        assert_eq!(collector.poll_once().await.unwrap(), 1);
        assert_eq!(collector.offset(), 13);
        assert_eq!(collector.poll_once().await.unwrap(), 1);
        assert_eq!(collector.offset(), 14);
        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 13]);

        let users = collector.store.list_users(None).unwrap();
        assert_eq!(users[0].telegram_chat_id, Some(501));
        assert_eq!(users[1].telegram_chat_id, Some(503));
    }

    #[tokio::test]
    async fn latest_sender_identity_wins() {
        let source = ScriptedSource::default();
        source.push(Ok(vec![update(1, Some("alice"), 10), update(2, Some("alice"), 20)]));
        let mut collector =
            ChatIdCollector::new(source, db_with_users(), Duration::ZERO, Duration::ZERO);

        collector.poll_once().await.unwrap();
        let users = collector.store.list_users(None).unwrap();
        assert_eq!(users[0].telegram_chat_id, Some(20));
    }

    #[tokio::test]
    async fn fetch_failure_keeps_cursor() {
        let source = ScriptedSource::default();
        source.push(Err(anyhow!("network down")));
        let mut collector =
            ChatIdCollector::new(source, db_with_users(), Duration::ZERO, Duration::ZERO);

        assert!(collector.poll_once().await.is_err());
        assert_eq!(collector.offset(), 0);
    }

    /// Fails the first write, then defers to the database.
    struct FlakyStore {
        db: Db,
        failed: AtomicBool,
    }

    impl ChatIdStore for FlakyStore {
        fn assign_chat_id(&self, username: &str, chat_id: i64) -> Result<usize> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(anyhow!("database is locked"));
            }
            self.db.assign_telegram_chat_id(username, chat_id)
        }
    }

    struct PanickingStore;

    impl ChatIdStore for PanickingStore {
        fn assign_chat_id(&self, _username: &str, _chat_id: i64) -> Result<usize> {
            panic!("store blew up");
        }
    }

    #[tokio::test]
    async fn store_failure_replays_the_update() {
        let source = ScriptedSource::default();
        source.push(Ok(vec![update(3, Some("bob"), 30), update(4, Some("alice"), 40)]));
        source.push(Ok(vec![update(3, Some("bob"), 30), update(4, Some("alice"), 40)]));
        let store = FlakyStore {
            db: db_with_users(),
            failed: AtomicBool::new(false),
        };
        let mut collector =
            ChatIdCollector::new(source.clone(), store, Duration::ZERO, Duration::ZERO);

        let err = collector.poll_once().await.unwrap_err();
        assert_eq!(err.to_string(), "database is locked");
        assert_eq!(collector.offset(), 0);

        assert_eq!(collector.poll_once().await.unwrap(), 2);
        assert_eq!(collector.offset(), 5);
        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 0]);

        let users = collector.store.db.list_users(None).unwrap();
        assert_eq!(users[0].telegram_chat_id, Some(40));
        assert_eq!(users[1].telegram_chat_id, Some(30));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_backs_off_after_errors_and_stops_on_request() {
        static RUNNING: AtomicBool = AtomicBool::new(false);
        let source = ScriptedSource::default();
        source.push(Err(anyhow!("network down")));
        source.push(Ok(vec![update(7, Some("alice"), 70)]));

        let collector = ChatIdCollector::new(
            source.clone(),
            db_with_users(),
            Duration::from_secs(1),
            Duration::from_secs(30),
        );
        let handle = collector.start_guarded(&RUNNING).unwrap();
        assert!(RUNNING.load(Ordering::SeqCst));

        // First poll fails immediately; the retry waits for the backoff.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.offsets.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(source.offsets.lock().unwrap()[..2], [0, 0]);

        handle.shutdown().await.unwrap();
        assert!(!RUNNING.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn second_start_is_refused_while_running() {
        static RUNNING: AtomicBool = AtomicBool::new(false);
        let idle = || {
            ChatIdCollector::new(
                ScriptedSource::default(),
                Db::open_in_memory().unwrap(),
                Duration::from_secs(60),
                Duration::from_secs(60),
            )
        };

        let first = idle().start_guarded(&RUNNING).unwrap();
        let second = idle().start_guarded(&RUNNING);
        assert!(second.is_err());

        first.shutdown().await.unwrap();
        let third = idle().start_guarded(&RUNNING).unwrap();
        third.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_loop_releases_the_flag() {
        static RUNNING: AtomicBool = AtomicBool::new(false);
        let source = ScriptedSource::default();
        source.push(Ok(vec![update(1, Some("alice"), 10)]));
        let handle = ChatIdCollector::new(source, PanickingStore, Duration::ZERO, Duration::ZERO)
            .start_guarded(&RUNNING)
            .unwrap();

        for _ in 0..100 {
            if !RUNNING.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!RUNNING.load(Ordering::SeqCst));
        assert!(handle.shutdown().await.is_err());
    }
}
