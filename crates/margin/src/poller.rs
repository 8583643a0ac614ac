//! The poll cycle: resolve documents, triage their comments, reply to new ones and record
//! what was handled, plus the timer loop that drives cycles in daemon mode.

use std::sync::Arc;

use anyhow::Context as _;
use margin_core::comment::Comment;
use margin_core::config::PollSettings;
use margin_core::state::ProcessedState;
use margin_core::triage::{triage, Triage};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::now_ms;
use crate::reply::ReplyGenerator;
use crate::resolver::resolve_documents;
use crate::service::DocumentService;
use crate::state_store::StateStore;

/// Counters for one cycle, logged when it ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub disabled: bool,
    pub documents_polled: usize,
    pub documents_failed: usize,
    pub comments_seen: usize,
    pub replied: usize,
    pub skipped_solved: usize,
    pub skipped_already_replied: usize,
    pub post_failures: usize,
}

pub struct Poller {
    service: Arc<dyn DocumentService>,
    generator: ReplyGenerator,
    store: StateStore,
    settings: PollSettings,
}

impl Poller {
    pub fn new(
        service: Arc<dyn DocumentService>,
        generator: ReplyGenerator,
        store: StateStore,
        settings: PollSettings,
    ) -> Self {
        Self {
            service,
            generator,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Runs one cycle. Authentication or identity failures abort before anything is
    /// persisted; per-document and per-comment failures are logged and counted instead.
    pub async fn run_cycle(&self, now_ms: u64) -> anyhow::Result<CycleReport> {
        let mut report = CycleReport::default();

        if !self.settings.enabled {
            info!("polling is disabled; skipping cycle");
            report.disabled = true;
            return Ok(report);
        }

        self.service
            .authenticate()
            .await
            .context("authenticate with document service")?;
        let agent_id = self
            .service
            .bot_identity()
            .await
            .context("resolve agent identity")?;

        let mut state = self.store.load().await;
        let documents = resolve_documents(self.service.as_ref(), &self.settings).await;
        if documents.is_empty() {
            debug!("no documents to poll");
        }

        for document in &documents {
            let Some(comments) = self.fetch_comments(document).await else {
                report.documents_failed += 1;
                continue;
            };
            report.documents_polled += 1;
            report.comments_seen += comments.len();

            for comment in &comments {
                self.handle_comment(&mut state, document, comment, &agent_id, &mut report)
                    .await;
            }
        }

        state.touch(now_ms);
        self.store
            .save(&state)
            .await
            .context("save processed state")?;

        info!(
            documents_polled = report.documents_polled,
            documents_failed = report.documents_failed,
            comments_seen = report.comments_seen,
            replied = report.replied,
            skipped_solved = report.skipped_solved,
            skipped_already_replied = report.skipped_already_replied,
            post_failures = report.post_failures,
            "poll cycle finished"
        );

        Ok(report)
    }

    async fn handle_comment(
        &self,
        state: &mut ProcessedState,
        document: &str,
        comment: &Comment,
        agent_id: &str,
        report: &mut CycleReport,
    ) {
        if comment.id.trim().is_empty() {
            warn!(document = %document, "skipping comment without an id");
            return;
        }

        let verdict = triage(state, document, comment, agent_id);
        match verdict {
            Triage::AlreadyProcessed => return,
            Triage::Solved => report.skipped_solved += 1,
            Triage::AlreadyReplied => report.skipped_already_replied += 1,
            Triage::Pending => {}
        }

        if verdict.records_without_reply() {
            debug!(
                document = %document,
                comment_id = %comment.id,
                verdict = ?verdict,
                "recording comment without reply"
            );
            state.mark_processed(document, &comment.id);
            return;
        }

        let reply = self
            .generator
            .generate(document, &comment.id, &comment.text(), comment.quote())
            .await;

        if self.post_reply(document, &comment.id, &reply).await {
            state.mark_processed(document, &comment.id);
            report.replied += 1;
            info!(document = %document, comment_id = %comment.id, "replied to comment");
        } else {
            report.post_failures += 1;
        }
    }

    /// Comments of `document`, or `None` when they could not be listed.
    async fn fetch_comments(&self, document: &str) -> Option<Vec<Comment>> {
        match self.service.list_comments(document).await {
            Ok(comments) => Some(comments),
            Err(err) => {
                warn!(
                    document = %document,
                    error = %format!("{err:#}"),
                    "failed to fetch comments"
                );
                None
            }
        }
    }

    async fn post_reply(&self, document: &str, comment_id: &str, text: &str) -> bool {
        match self.service.post_reply(document, comment_id, text).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    document = %document,
                    comment_id = %comment_id,
                    error = %format!("{err:#}"),
                    "failed to post reply"
                );
                false
            }
        }
    }

    /// Daemon loop: one cycle after the initial delay, then one per interval until
    /// shutdown is requested. A cycle in progress always runs to completion.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            initial_delay_secs = self.settings.initial_delay.as_secs(),
            enabled = self.settings.enabled,
            "poller started"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.settings.initial_delay) => {}
            _ = wait_for_shutdown(&mut shutdown_rx) => {
                info!("poller stopped");
                return;
            }
        }

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.run_cycle(now_ms()).await {
                        warn!(error = %format!("{err:#}"), "poll cycle failed");
                    }
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        info!("poller stopped");
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use margin_core::comment::{Block, Reply, RichText};
    use tempfile::TempDir;

    use super::*;
    use crate::agent::{Agent, AgentResponse, InvokeContext};
    use crate::reply::FALLBACK_REPLY;

    const BOT: &str = "ou_bot";

    #[derive(Default)]
    struct Inner {
        comments: BTreeMap<String, Vec<Comment>>,
        failing_documents: BTreeSet<String>,
        failing_posts: BTreeSet<String>,
        auth_fails: bool,
        identity_fails: bool,
        posts: Vec<(String, String, String)>,
        list_calls: usize,
    }

    #[derive(Default)]
    struct FakeService {
        inner: Mutex<Inner>,
    }

    impl FakeService {
        fn with_comments(docs: &[(&str, Vec<Comment>)]) -> Arc<Self> {
            let svc = Self::default();
            {
                let mut inner = svc.inner.lock().unwrap();
                for (doc, comments) in docs {
                    inner.comments.insert((*doc).to_owned(), comments.clone());
                }
            }
            Arc::new(svc)
        }

        fn posts(&self) -> Vec<(String, String, String)> {
            self.inner.lock().unwrap().posts.clone()
        }

        fn push_comment(&self, doc: &str, comment: Comment) {
            self.inner
                .lock()
                .unwrap()
                .comments
                .entry(doc.to_owned())
                .or_default()
                .push(comment);
        }
    }

    #[async_trait]
    impl DocumentService for FakeService {
        async fn authenticate(&self) -> anyhow::Result<()> {
            if self.inner.lock().unwrap().auth_fails {
                return Err(anyhow!("invalid app secret"));
            }
            Ok(())
        }

        async fn bot_identity(&self) -> anyhow::Result<String> {
            if self.inner.lock().unwrap().identity_fails {
                return Err(anyhow!("bot info unavailable"));
            }
            Ok(BOT.to_owned())
        }

        async fn list_comments(&self, document: &str) -> anyhow::Result<Vec<Comment>> {
            let mut inner = self.inner.lock().unwrap();
            inner.list_calls += 1;
            if inner.failing_documents.contains(document) {
                return Err(anyhow!("HTTP 500"));
            }
            Ok(inner.comments.get(document).cloned().unwrap_or_default())
        }

        async fn document_blocks(&self, _document: &str) -> anyhow::Result<Option<Vec<Block>>> {
            Ok(None)
        }

        async fn post_reply(
            &self,
            document: &str,
            comment_id: &str,
            text: &str,
        ) -> anyhow::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if inner.failing_posts.contains(comment_id) {
                return Err(anyhow!("comment locked"));
            }
            inner
                .posts
                .push((document.to_owned(), comment_id.to_owned(), text.to_owned()));

            // Mirror the service: the reply shows up under the bot identity.
            if let Some(c) = inner
                .comments
                .get_mut(document)
                .and_then(|cs| cs.iter_mut().find(|c| c.id == comment_id))
            {
                c.replies.push(Reply {
                    id: format!("r-{comment_id}"),
                    user_id: BOT.to_owned(),
                    body: RichText::plain(text),
                    created_at: 2,
                });
            }
            Ok(())
        }
    }

    struct EchoAgent {
        fail: bool,
    }

    #[async_trait]
    impl Agent for EchoAgent {
        async fn invoke(
            &self,
            _prompt: &str,
            ctx: &InvokeContext,
        ) -> anyhow::Result<AgentResponse> {
            if self.fail {
                return Err(anyhow!("model overloaded"));
            }
            Ok(AgentResponse {
                response: format!("reply to {}", ctx.comment_id),
            })
        }
    }

    fn comment(id: &str) -> Comment {
        Comment {
            id: id.to_owned(),
            user_id: "ou_alice".to_owned(),
            created_at: 1,
            updated_at: 1,
            is_solved: false,
            solver_user_id: None,
            body: RichText::plain(format!("question {id}")),
            quote: None,
            replies: Vec::new(),
        }
    }

    fn solved(id: &str) -> Comment {
        Comment {
            is_solved: true,
            solver_user_id: Some("ou_alice".to_owned()),
            ..comment(id)
        }
    }

    fn settings(watched: &[&str]) -> PollSettings {
        PollSettings {
            enabled: true,
            interval: Duration::from_millis(20),
            initial_delay: Duration::ZERO,
            index_document: None,
            watched_files: watched.iter().map(|s| (*s).to_owned()).collect(),
            file_type: "docx".to_owned(),
        }
    }

    fn poller(
        service: Arc<FakeService>,
        store: StateStore,
        settings: PollSettings,
        agent_fails: bool,
    ) -> Poller {
        Poller::new(
            service,
            ReplyGenerator::new(Arc::new(EchoAgent { fail: agent_fails })),
            store,
            settings,
        )
    }

    fn store_in(dir: &TempDir) -> StateStore {
        StateStore::new(dir.path().join("state.json"))
    }

    #[tokio::test]
    async fn replies_once_and_records() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[("doxA", vec![comment("c1")])]);
        let p = poller(service.clone(), store_in(&dir), settings(&["doxA"]), false);

        let report = p.run_cycle(1_000).await.unwrap();
        assert_eq!(report.replied, 1);
        assert_eq!(report.comments_seen, 1);
        assert_eq!(
            service.posts(),
            vec![("doxA".to_owned(), "c1".to_owned(), "reply to c1".to_owned())]
        );

        let state = store_in(&dir).load().await;
        assert!(state.is_processed("doxA", "c1"));
        assert_eq!(state.last_poll_time, 1_000);
    }

    #[tokio::test]
    async fn second_cycle_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let service =
            FakeService::with_comments(&[("doxA", vec![comment("c1"), solved("c2")])]);
        let p = poller(service.clone(), store_in(&dir), settings(&["doxA"]), false);

        p.run_cycle(1_000).await.unwrap();
        let first = store_in(&dir).load().await;

        let report = p.run_cycle(2_000).await.unwrap();
        let second = store_in(&dir).load().await;

        assert_eq!(report.replied, 0);
        assert_eq!(report.skipped_solved, 0);
        assert_eq!(service.posts().len(), 1);
        assert_eq!(first.processed("doxA"), second.processed("doxA"));
        assert_eq!(second.last_poll_time, 2_000);
    }

    #[tokio::test]
    async fn solved_comment_is_recorded_without_posting() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[("doxA", vec![solved("c9")])]);
        let p = poller(service.clone(), store_in(&dir), settings(&["doxA"]), false);

        let report = p.run_cycle(1).await.unwrap();
        assert_eq!(report.skipped_solved, 1);
        assert!(service.posts().is_empty());
        assert!(store_in(&dir).load().await.is_processed("doxA", "c9"));
    }

    #[tokio::test]
    async fn crash_before_save_does_not_double_reply() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blocker"), b"").unwrap();
        let broken = StateStore::new(dir.path().join("blocker").join("state.json"));

        let service = FakeService::with_comments(&[("doxA", vec![comment("c1")])]);
        let p = poller(service.clone(), broken, settings(&["doxA"]), false);
        assert!(p.run_cycle(1).await.is_err());
        assert_eq!(service.posts().len(), 1);

        let p = poller(service.clone(), store_in(&dir), settings(&["doxA"]), false);
        let report = p.run_cycle(2).await.unwrap();
        assert_eq!(report.skipped_already_replied, 1);
        assert_eq!(report.replied, 0);
        assert_eq!(service.posts().len(), 1);
        assert!(store_in(&dir).load().await.is_processed("doxA", "c1"));
    }

    #[tokio::test]
    async fn fetch_failure_is_isolated() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[
            ("doxA", vec![comment("a1")]),
            ("doxB", vec![comment("b1")]),
            ("doxC", vec![comment("c1")]),
        ]);
        service
            .inner
            .lock()
            .unwrap()
            .failing_documents
            .insert("doxB".to_owned());

        let p = poller(
            service.clone(),
            store_in(&dir),
            settings(&["doxA", "doxB", "doxC"]),
            false,
        );
        let report = p.run_cycle(1).await.unwrap();
        assert_eq!(report.documents_polled, 2);
        assert_eq!(report.documents_failed, 1);
        assert_eq!(report.replied, 2);

        let state = store_in(&dir).load().await;
        assert!(state.is_processed("doxA", "a1"));
        assert!(!state.is_processed("doxB", "b1"));
        assert!(state.is_processed("doxC", "c1"));
    }

    #[tokio::test]
    async fn failed_post_is_retried_next_cycle() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[("doxA", vec![comment("c1")])]);
        service
            .inner
            .lock()
            .unwrap()
            .failing_posts
            .insert("c1".to_owned());

        let p = poller(service.clone(), store_in(&dir), settings(&["doxA"]), false);
        let report = p.run_cycle(1).await.unwrap();
        assert_eq!(report.post_failures, 1);
        assert!(!store_in(&dir).load().await.is_processed("doxA", "c1"));

        service.inner.lock().unwrap().failing_posts.clear();
        let report = p.run_cycle(2).await.unwrap();
        assert_eq!(report.replied, 1);
        assert!(store_in(&dir).load().await.is_processed("doxA", "c1"));
    }

    #[tokio::test]
    async fn agent_failure_posts_fallback() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[("doxA", vec![comment("c1")])]);
        let p = poller(service.clone(), store_in(&dir), settings(&["doxA"]), true);

        let report = p.run_cycle(1).await.unwrap();
        assert_eq!(report.replied, 1);
        assert_eq!(service.posts()[0].2, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn processed_set_only_grows() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[("doxA", vec![comment("c1")])]);
        let p = poller(service.clone(), store_in(&dir), settings(&["doxA"]), false);

        p.run_cycle(1).await.unwrap();
        let before = store_in(&dir).load().await;

        // The comment disappears from the service and a new one arrives.
        service.inner.lock().unwrap().comments.clear();
        service.push_comment("doxA", comment("c2"));
        p.run_cycle(2).await.unwrap();
        let after = store_in(&dir).load().await;

        for id in before.processed("doxA") {
            assert!(after.is_processed("doxA", id));
        }
        assert!(after.is_processed("doxA", "c2"));
    }

    #[tokio::test]
    async fn auth_failure_persists_nothing() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[("doxA", vec![comment("c1")])]);
        service.inner.lock().unwrap().auth_fails = true;

        let p = poller(service.clone(), store_in(&dir), settings(&["doxA"]), false);
        let err = p.run_cycle(1).await.unwrap_err();
        assert!(format!("{err:#}").contains("invalid app secret"));
        assert!(!dir.path().join("state.json").exists());
        assert_eq!(service.inner.lock().unwrap().list_calls, 0);
    }

    #[tokio::test]
    async fn identity_failure_persists_nothing() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[("doxA", vec![comment("c1")])]);
        service.inner.lock().unwrap().identity_fails = true;

        let p = poller(service.clone(), store_in(&dir), settings(&["doxA"]), false);
        let err = p.run_cycle(1).await.unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("resolve agent identity"));
        assert!(msg.contains("bot info unavailable"));
        assert!(!dir.path().join("state.json").exists());
        assert!(service.posts().is_empty());
    }

    #[tokio::test]
    async fn comment_without_id_is_skipped() {
        let dir = TempDir::new().unwrap();
        let service =
            FakeService::with_comments(&[("doxA", vec![comment(""), comment("c1")])]);
        let p = poller(service.clone(), store_in(&dir), settings(&["doxA"]), false);

        let report = p.run_cycle(1).await.unwrap();
        assert_eq!(report.replied, 1);
        p.run_cycle(2).await.unwrap();

        assert_eq!(
            service.posts(),
            vec![("doxA".to_owned(), "c1".to_owned(), "reply to c1".to_owned())]
        );
        assert_eq!(store_in(&dir).load().await.processed("doxA"), ["c1".to_owned()]);
    }

    #[tokio::test]
    async fn disabled_cycle_does_nothing() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[("doxA", vec![comment("c1")])]);
        let mut s = settings(&["doxA"]);
        s.enabled = false;

        let p = poller(service.clone(), store_in(&dir), s, false);
        let report = p.run_cycle(1).await.unwrap();
        assert!(report.disabled);
        assert!(service.posts().is_empty());
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn empty_document_set_still_persists_poll_time() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[]);
        let p = poller(service.clone(), store_in(&dir), settings(&[]), false);

        let report = p.run_cycle(42).await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(store_in(&dir).load().await.last_poll_time, 42);
    }

    #[tokio::test]
    async fn run_loop_polls_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[("doxA", vec![comment("c1")])]);
        let p = poller(service.clone(), store_in(&dir), settings(&["doxA"]), false);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(p.run(rx));

        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(service.inner.lock().unwrap().list_calls >= 2);
        assert_eq!(service.posts().len(), 1);
    }

    #[tokio::test]
    async fn run_loop_stops_during_initial_delay() {
        let dir = TempDir::new().unwrap();
        let service = FakeService::with_comments(&[]);
        let mut s = settings(&[]);
        s.initial_delay = Duration::from_secs(3600);
        let p = poller(service.clone(), store_in(&dir), s, false);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(p.run(rx));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(service.inner.lock().unwrap().list_calls, 0);
    }
}
