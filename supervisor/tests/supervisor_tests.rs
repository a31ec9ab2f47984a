#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ractor::{async_trait, call_t, Actor, ActorProcessingErr, ActorRef, OutputPort};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use vigil::events::RAW_LOG_KIND;
use vigil::Config;
use vigil_consume::{MonitorUpdate, Store};
use vigil_supervisor::{LaunchSpec, ProcessSupervisor, ProducerStatus, SupervisorArgs, SupervisorMessage};

type Seen = Arc<Mutex<Vec<MonitorUpdate>>>;

struct Collector;

#[async_trait]
impl Actor for Collector {
    type Msg = MonitorUpdate;
    type State = Seen;
    type Arguments = Seen;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        seen: Seen,
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

struct Running {
    _dir: TempDir,
    config: Arc<Config>,
    supervisor: ActorRef<SupervisorMessage>,
    handle: JoinHandle<()>,
    seen: Seen,
}

async fn run(script: &str) -> Running {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(Config {
        db_path: dir.path().join("events.db"),
        ..Config::default()
    });
    let launch = LaunchSpec::new(
        vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        &config,
    )
    .unwrap();

    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let (collector, _) = Actor::spawn(None, Collector, Arc::clone(&seen)).await.unwrap();
    let output: Arc<OutputPort<MonitorUpdate>> = Arc::new(OutputPort::default());
    output.subscribe(collector, Some);

    let (supervisor, handle) = Actor::spawn(
        None,
        ProcessSupervisor,
        SupervisorArgs {
            config: Arc::clone(&config),
            launch,
            output,
        },
    )
    .await
    .unwrap();

    Running {
        _dir: dir,
        config,
        supervisor,
        handle,
        seen,
    }
}

impl Running {
    /// Waits until a published log line satisfies `matches`.
    async fn wait_for_log(&self, matches: impl Fn(&vigil::LogLine) -> bool) -> vigil::LogLine {
        for _ in 0..100 {
            let found = self.seen.lock().unwrap().iter().find_map(|update| match update {
                MonitorUpdate::Log(line) if matches(line) => Some(line.clone()),
                _ => None,
            });
            if let Some(line) = found {
                return line;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("expected log line was never published");
    }

    async fn status(&self) -> ProducerStatus {
        call_t!(self.supervisor, SupervisorMessage::GetStatus, 1000).unwrap()
    }

    async fn shutdown(self) -> (TempDir, Arc<Config>) {
        self.supervisor
            .send_message(SupervisorMessage::Shutdown)
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("supervisor stops in time")
            .unwrap();
        (self._dir, self.config)
    }
}

#[tokio::test]
async fn producer_output_is_forwarded_and_persisted() {
    let running = run("echo hello from stdout; echo oops >&2; exec sleep 30").await;

    let line = running
        .wait_for_log(|line| line.message == "hello from stdout")
        .await;
    assert_eq!(line.kind(), RAW_LOG_KIND);
    running.wait_for_log(|line| line.message == "oops").await;
    assert!(matches!(running.status().await, ProducerStatus::Running { pid: Some(_) }));

    let (_dir, config) = running.shutdown().await;

    let store = Store::open(&config.db_path).unwrap();
    let session = &store.get_sessions().unwrap()[0];
    let persisted: Vec<String> = store
        .get_recent_logs(&session.id, 100)
        .unwrap()
        .into_iter()
        .map(|line| line.message)
        .collect();
    assert!(persisted.contains(&"hello from stdout".to_string()));
    assert!(persisted.contains(&"oops".to_string()));
}

#[tokio::test]
async fn producer_receives_configuration_and_channel_bootstrap() {
    let running = run(r#"test -n "$VIGIL_CONFIG" && test -n "$VIGIL_IPC_AUTHKEY" && echo "port=$VIGIL_IPC_PORT"; exec sleep 30"#).await;

    let line = running
        .wait_for_log(|line| line.message.starts_with("port="))
        .await;
    let port: u16 = line.message["port=".len()..].parse().unwrap();
    assert_ne!(port, 0);

    running.shutdown().await;
}

#[tokio::test]
async fn producer_exit_is_reported_and_the_consumer_keeps_running() {
    let running = run("exit 3").await;

    let line = running
        .wait_for_log(|line| line.level == "ERROR" && line.message.contains("exited"))
        .await;
    assert!(line.message.contains('3'));
    assert_eq!(running.status().await, ProducerStatus::Exited { code: Some(3) });

    running.shutdown().await;
}

#[tokio::test]
async fn unstartable_producer_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(Config {
        db_path: dir.path().join("events.db"),
        ..Config::default()
    });
    let launch = LaunchSpec::new(vec![dir.path().join("no-such-binary").display().to_string()], &config).unwrap();
    let (supervisor, handle) = Actor::spawn(
        None,
        ProcessSupervisor,
        SupervisorArgs {
            config,
            launch,
            output: Arc::new(OutputPort::default()),
        },
    )
    .await
    .unwrap();

    let status = call_t!(supervisor, SupervisorMessage::GetStatus, 1000).unwrap();
    assert!(matches!(status, ProducerStatus::FailedToStart { .. }));

    supervisor.stop(None);
    handle.await.unwrap();
}

#[tokio::test]
async fn stubborn_producer_is_killed() {
    let running = run("trap '' TERM; echo ready; while true; do sleep 1; done").await;
    running.wait_for_log(|line| line.message == "ready").await;

    let started = std::time::Instant::now();
    running.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[tokio::test]
async fn non_utf8_output_keeps_the_producer_alive() {
    let running = run(r"printf 'caf\351\n'; sleep 0.5; echo after; exec sleep 30").await;

    let line = running.wait_for_log(|line| line.message.starts_with("caf")).await;
    assert_eq!(line.message, "caf\u{FFFD}");
    running.wait_for_log(|line| line.message == "after").await;
    assert!(matches!(running.status().await, ProducerStatus::Running { .. }));

    running.shutdown().await;
}

#[tokio::test]
async fn output_written_while_exiting_is_persisted() {
    let running = run(
        "trap 'i=0; while [ $i -lt 200 ]; do i=$((i+1)); echo bye $i; done; exit 0' TERM; \
         echo ready; while true; do sleep 0.1; done",
    )
    .await;
    running.wait_for_log(|line| line.message == "ready").await;

    let (_dir, config) = running.shutdown().await;

    let store = Store::open(&config.db_path).unwrap();
    let session = &store.get_sessions().unwrap()[0];
    let persisted: Vec<String> = store
        .get_recent_logs(&session.id, 1000)
        .unwrap()
        .into_iter()
        .map(|line| line.message)
        .collect();
    assert!(persisted.contains(&"bye 1".to_string()));
    assert!(persisted.contains(&"bye 200".to_string()));
}
