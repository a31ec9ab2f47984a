use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use ractor::{async_trait, call_t, Actor, ActorProcessingErr, ActorRef, OutputPort};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use vigil::{Config, Event, ExceptionInfo, Hit, LogLine, RequestEvent, RuntimeLogUpdate};
use vigil_consume::{Dispatcher, DispatcherArgs, DispatcherMessage, MonitorUpdate, Store};

const CALL_TIMEOUT_MS: u64 = 2000;

/// Records everything published on the dispatcher's output port.
struct Collector;

#[async_trait]
impl Actor for Collector {
    type Msg = MonitorUpdate;
    type State = Arc<Mutex<Vec<MonitorUpdate>>>;
    type Arguments = Arc<Mutex<Vec<MonitorUpdate>>>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        seen: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(seen)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        update: MonitorUpdate,
        seen: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        seen.lock().unwrap().push(update);
        Ok(())
    }
}

fn request(id: &str, endpoint: &str, completed: Option<(u16, f64)>) -> Event {
    Event::Request(RequestEvent {
        id: id.to_string(),
        endpoint: endpoint.to_string(),
        method: "GET".to_string(),
        status_code: completed.map(|(status, _)| status),
        duration_ms: completed.map(|(_, duration)| duration),
        client: "127.0.0.1".to_string(),
        timestamp: Utc::now(),
        request_params: None,
        request_body: None,
        request_headers: Some(BTreeMap::new()),
        response_body: None,
        runtime_logs: vec![],
        exceptions: vec![],
        pending: completed.is_none(),
        completed: completed.is_some(),
    })
}

struct Fixture {
    _dir: TempDir,
    db_path: std::path::PathBuf,
    events: mpsc::Sender<Event>,
    dispatcher: ActorRef<DispatcherMessage>,
    handle: tokio::task::JoinHandle<()>,
    updates: Arc<Mutex<Vec<MonitorUpdate>>>,
    live_session: String,
    earlier_session: String,
}

impl Fixture {
    /// A dispatcher whose store already holds one finished session with a single hit.
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("events.db");
        let mut store = Store::open(&db_path).unwrap();

        let earlier = store.start_new_session().unwrap().unwrap();
        let mut old = Hit::from_request(match &request("old", "/history", Some((201, 4.0))) {
            Event::Request(request) => request,
            _ => unreachable!(),
        });
        old.runtime_logs = vec![json!("replayed")];
        store.save_hit(&old).unwrap();
        store.save_log("INFO", "earlier line", Utc::now()).unwrap();
        let live = store.start_new_session().unwrap().unwrap();

        let updates = Arc::new(Mutex::new(Vec::new()));
        let (collector, _) = Actor::spawn(None, Collector, Arc::clone(&updates)).await.unwrap();
        let output: Arc<OutputPort<MonitorUpdate>> = Arc::new(OutputPort::default());
        output.subscribe(collector, Some);

        let (events, receiver) = mpsc::channel(1024);
        let config = Arc::new(Config::default());
        let (dispatcher, handle) = Actor::spawn(
            None,
            Dispatcher,
            DispatcherArgs {
                config,
                events: receiver,
                store,
                output,
            },
        )
        .await
        .unwrap();

        Fixture {
            _dir: dir,
            db_path,
            events,
            dispatcher,
            handle,
            updates,
            live_session: live.id,
            earlier_session: earlier.id,
        }
    }

    async fn feed(&self, events: Vec<Event>) {
        for event in events {
            self.events.send(event).await.unwrap();
        }
        call_t!(self.dispatcher, DispatcherMessage::Drain, CALL_TIMEOUT_MS).unwrap();
    }

    async fn hits(&self, endpoint: &str) -> Vec<Hit> {
        call_t!(
            self.dispatcher,
            DispatcherMessage::GetHits,
            CALL_TIMEOUT_MS,
            endpoint.to_string()
        )
        .unwrap()
    }

    async fn switch(&self, session: &str) -> bool {
        call_t!(
            self.dispatcher,
            DispatcherMessage::SwitchSession,
            CALL_TIMEOUT_MS,
            session.to_string()
        )
        .unwrap()
    }

    fn persisted(&self, session: &str) -> Vec<Hit> {
        Store::open(&self.db_path)
            .unwrap()
            .get_recent_hits(session, 100)
            .unwrap()
    }

    async fn stop(self) {
        self.dispatcher.stop(None);
        self.handle.await.unwrap();
    }
}

#[tokio::test]
async fn lifecycle_is_folded_persisted_and_published() {
    let f = Fixture::start().await;
    f.feed(vec![
        request("r1", "/items/{id}", None),
        Event::RuntimeLogUpdate(RuntimeLogUpdate {
            request_id: "r1".to_string(),
            log: json!("loading"),
            all_logs: vec![json!("loading")],
        }),
        request("r1", "/items/{id}", Some((200, 12.0))),
        request("r1", "/items/{id}", Some((200, 12.0))),
    ])
    .await;

    let hits = f.hits("/items/{id}").await;
    assert_eq!(hits.len(), 1);
    assert!(!hits[0].pending);
    assert_eq!(hits[0].status_code, Some(200));

    let stats = call_t!(
        f.dispatcher,
        DispatcherMessage::GetStats,
        CALL_TIMEOUT_MS,
        "/items/{id}".to_string()
    )
    .unwrap()
    .expect("stats tracked");
    assert_eq!(stats.total_hits, 1);
    assert_eq!(stats.duration_samples, 1);

    let aggregate = call_t!(f.dispatcher, DispatcherMessage::GetAggregate, CALL_TIMEOUT_MS).unwrap();
    assert_eq!(aggregate.total_hits, 1);
    assert_eq!(aggregate.endpoint_count, 1);

    let persisted = f.persisted(&f.live_session);
    assert_eq!(persisted, hits);

    let published = f.updates.lock().unwrap().clone();
    assert!(published
        .iter()
        .any(|u| matches!(u, MonitorUpdate::HitChanged(hit) if hit.id == "r1" && !hit.pending)));

    f.stop().await;
}

#[tokio::test]
async fn logs_and_exceptions_reach_their_streams() {
    let f = Fixture::start().await;
    f.feed(vec![
        Event::Log(LogLine::new("INFO", "server up")),
        Event::Exception(ExceptionInfo::new("Timeout", "upstream slow")),
        Event::Unknown {
            kind: "heartbeat".to_string(),
        },
    ])
    .await;

    let logs = call_t!(f.dispatcher, DispatcherMessage::GetLogs, CALL_TIMEOUT_MS).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "server up");
    let exceptions = call_t!(f.dispatcher, DispatcherMessage::GetExceptions, CALL_TIMEOUT_MS).unwrap();
    assert_eq!(exceptions[0].exception_type, "Timeout");

    let store = Store::open(&f.db_path).unwrap();
    let persisted = store.get_recent_logs(&f.live_session, 10).unwrap();
    assert_eq!(persisted.len(), 1);

    f.stop().await;
}

#[tokio::test]
async fn browsing_history_keeps_recording_live_events_silently() {
    let f = Fixture::start().await;
    assert!(f.switch(&f.earlier_session).await);

    let replayed = f.hits("/history").await;
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].runtime_logs, vec![json!("replayed")]);
    let logs = call_t!(f.dispatcher, DispatcherMessage::GetLogs, CALL_TIMEOUT_MS).unwrap();
    assert_eq!(logs[0].message, "earlier line");

    f.updates.lock().unwrap().clear();
    f.feed(vec![request("live-1", "/now", None)]).await;

    assert!(f.hits("/now").await.is_empty(), "live hits are not displayed");
    assert_eq!(f.persisted(&f.live_session).len(), 1);
    assert!(f.persisted(&f.earlier_session).iter().all(|h| h.id != "live-1"));

    assert!(f.switch(&f.live_session).await);
    assert_eq!(f.hits("/now").await.len(), 1);
    assert!(f.hits("/history").await.is_empty());

    let displayed = call_t!(f.dispatcher, DispatcherMessage::GetDisplayedSession, CALL_TIMEOUT_MS).unwrap();
    assert_eq!(displayed.as_deref(), Some(f.live_session.as_str()));

    // give the collector a moment to catch up with the port
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let published = f.updates.lock().unwrap().clone();
    assert!(!published.iter().any(|u| matches!(u, MonitorUpdate::HitChanged(_))));
    assert!(matches!(
        published.last(),
        Some(MonitorUpdate::SessionSwitched { session_id: Some(id) }) if *id == f.live_session
    ));

    f.stop().await;
}

#[tokio::test]
async fn deleting_the_browsed_session_returns_to_live() {
    let f = Fixture::start().await;
    assert!(f.switch(&f.earlier_session).await);

    let deleted = call_t!(
        f.dispatcher,
        DispatcherMessage::DeleteSession,
        CALL_TIMEOUT_MS,
        f.earlier_session.clone()
    )
    .unwrap();
    assert!(deleted);

    let displayed = call_t!(f.dispatcher, DispatcherMessage::GetDisplayedSession, CALL_TIMEOUT_MS).unwrap();
    assert_eq!(displayed.as_deref(), Some(f.live_session.as_str()));
    let sessions = call_t!(f.dispatcher, DispatcherMessage::GetSessions, CALL_TIMEOUT_MS).unwrap();
    assert_eq!(sessions.len(), 1);

    f.stop().await;
}

#[tokio::test]
async fn ticks_drain_without_being_asked() {
    let f = Fixture::start().await;
    f.events.send(request("t1", "/tick", None)).await.unwrap();

    let mut found = false;
    for _ in 0..20 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if !f.hits("/tick").await.is_empty() {
            found = true;
            break;
        }
    }
    assert!(found, "the periodic tick drained the queue");

    f.stop().await;
}
