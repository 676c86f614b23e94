//! # Engine Process Supervisor
//!
//! Starts one speech engine subprocess per voice session and owns its stdio.
//!
//! ## Task layout per engine:
//! ```text
//!   EngineHandle::send ──try_send──▶ [bounded queue] ──▶ stdin pump ──▶ child stdin
//!   child stdout ──▶ stdout pump ──FrameCodec──▶ EngineEvent::Output ──▶ bound actor
//!   child stderr ──▶ stderr pump ──▶ tracing (target "engine")
//!   monitor: waits for exit or kill request, drains stdout, emits EngineEvent::Exited
//! ```
//!
//! ## Backpressure policy:
//! `send` never waits. If the queue towards stdin is full the frame is
//! dropped and counted; if the stdin pump has gone away the caller gets
//! `WriteAfterClose`. Live voice tolerates a lost chunk; a stalled actor does
//! not. Should lossless delivery ever be required, the queue capacity and the
//! `frames_dropped_backpressure` counter are the places to start.
//!
//! ## Binding:
//! Output is delivered to whichever actor is currently bound to the engine.
//! A session whose client disconnected is unbound; its output is discarded
//! until a new connection binds. Its exit and its first readiness signal are
//! still recorded on the handle, so a later connection can catch up.

use crate::config::EngineConfig;
use crate::engine::frame::{EngineOutput, Frame, FrameCodec};
use crate::error::RelayError;
use crate::session::machine::ReadinessSignal;
use crate::state::RelayMetrics;
use actix::prelude::*;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// How long the monitor waits for stdout to drain after the process exits.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Per-session values exported into the engine environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLaunch {
    pub session_id: String,
    pub voice_id: String,
    pub connection_id: String,
}

/// How an engine process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSummary {
    pub code: Option<i32>,
    pub success: bool,
    /// True when the relay asked for the kill.
    pub killed: bool,
}

/// Events an engine delivers to the actor bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Message)]
#[rtype(result = "()")]
pub enum EngineEvent {
    Output { process_id: u64, output: EngineOutput },
    Exited { process_id: u64, summary: ExitSummary },
}

type Binding = Option<Recipient<EngineEvent>>;

/// Exclusive handle to one running engine.
///
/// Dropping the handle without calling [`EngineHandle::kill`] also kills the
/// engine, so a session can never leak its subprocess.
pub struct EngineHandle {
    process_id: u64,
    os_pid: Option<u32>,
    stdin: mpsc::Sender<Frame>,
    kill: Option<oneshot::Sender<()>>,
    binding: Arc<watch::Sender<Binding>>,
    exit: watch::Receiver<Option<ExitSummary>>,
    readiness: watch::Receiver<Option<ReadinessSignal>>,
    metrics: Arc<RelayMetrics>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("process_id", &self.process_id)
            .field("os_pid", &self.os_pid)
            .field("exited", &self.exit_summary())
            .finish()
    }
}

impl EngineHandle {
    pub fn process_id(&self) -> u64 {
        self.process_id
    }

    pub fn os_pid(&self) -> Option<u32> {
        self.os_pid
    }

    /// Queue a frame for the engine's stdin without waiting.
    pub fn send(&self, frame: Frame) -> Result<(), RelayError> {
        if self.exit.borrow().is_some() {
            RelayMetrics::incr(&self.metrics.frames_dropped_closed);
            return Err(RelayError::WriteAfterClose);
        }

        match self.stdin.try_send(frame) {
            Ok(()) => {
                RelayMetrics::incr(&self.metrics.frames_forwarded);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(frame)) => {
                RelayMetrics::incr(&self.metrics.frames_dropped_backpressure);
                warn!(
                    process_id = self.process_id,
                    frame = frame.kind(),
                    "Engine input queue full, dropping frame"
                );
                Err(RelayError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(frame)) => {
                RelayMetrics::incr(&self.metrics.frames_dropped_closed);
                warn!(
                    process_id = self.process_id,
                    frame = frame.kind(),
                    "Engine stdin closed, dropping frame"
                );
                Err(RelayError::WriteAfterClose)
            }
        }
    }

    /// Request termination. Returns immediately; the exit is confirmed later
    /// by an [`EngineEvent::Exited`]. Calling it twice is harmless.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            info!(process_id = self.process_id, os_pid = ?self.os_pid, "Killing voice engine");
            let _ = kill.send(());
        }
    }

    pub fn kill_requested(&self) -> bool {
        self.kill.is_none()
    }

    /// Route engine output to `recipient` from now on.
    pub fn bind(&self, recipient: Recipient<EngineEvent>) {
        self.binding.send_replace(Some(recipient));
    }

    /// Stop routing output; it is discarded until the next [`bind`](Self::bind).
    pub fn unbind(&self) {
        self.binding.send_replace(None);
    }

    pub fn exit_summary(&self) -> Option<ExitSummary> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// First readiness signal seen on stdout, bound or not.
    pub fn observed_readiness(&self) -> Option<ReadinessSignal> {
        self.readiness.borrow().clone()
    }

    /// Wait until the engine has exited.
    pub async fn wait_exit(&mut self) -> ExitSummary {
        loop {
            if let Some(summary) = *self.exit.borrow_and_update() {
                return summary;
            }
            if self.exit.changed().await.is_err() {
                return self.exit.borrow().unwrap_or(ExitSummary {
                    code: None,
                    success: false,
                    killed: self.kill_requested(),
                });
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Spawns engine processes according to [`EngineConfig`].
#[derive(Clone)]
pub struct ProcessSupervisor {
    config: EngineConfig,
    metrics: Arc<RelayMetrics>,
}

impl ProcessSupervisor {
    pub fn new(config: EngineConfig, metrics: Arc<RelayMetrics>) -> Self {
        Self { config, metrics }
    }

    /// Environment handed to the engine: a cleared environment rebuilt from
    /// `PATH`, the session parameters, the region and the allow-listed
    /// pass-through variables. Secrets not on the list never reach it.
    pub fn engine_env(&self, launch: &SessionLaunch) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Ok(path) = std::env::var("PATH") {
            env.push(("PATH".to_string(), path));
        }
        env.push(("SESSION_ID".to_string(), launch.session_id.clone()));
        env.push(("VOICE_ID".to_string(), launch.voice_id.clone()));
        env.push(("CONNECTION_ID".to_string(), launch.connection_id.clone()));
        env.push(("AWS_REGION".to_string(), self.config.region.clone()));
        env.push(("AWS_DEFAULT_REGION".to_string(), self.config.region.clone()));
        if let Some(url) = &self.config.transport_url {
            env.push(("SOCKET_URL".to_string(), url.clone()));
        }
        for name in &self.config.env_passthrough {
            if env.iter().any(|(key, _)| key == name) {
                continue;
            }
            if let Ok(value) = std::env::var(name) {
                env.push((name.clone(), value));
            }
        }
        env
    }

    /// Start an engine for `launch`, optionally bound to an actor already.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        &self,
        launch: &SessionLaunch,
        recipient: Option<Recipient<EngineEvent>>,
    ) -> Result<EngineHandle, RelayError> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .env_clear()
            .envs(self.engine_env(launch))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|err| {
            RelayMetrics::incr(&self.metrics.spawn_failures);
            RelayError::Spawn(format!("{}: {}", self.config.command, err))
        })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                RelayMetrics::incr(&self.metrics.spawn_failures);
                let _ = child.start_kill();
                return Err(RelayError::Spawn("engine stdio was not captured".to_string()));
            }
        };

        let process_id = self.metrics.next_process_id();
        let os_pid = child.id();
        RelayMetrics::incr(&self.metrics.engines_live);

        let (stdin_tx, stdin_rx) = mpsc::channel(self.config.stdin_queue_capacity.max(1));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (binding_tx, binding_rx) = watch::channel(recipient);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (readiness_tx, readiness_rx) = watch::channel(None);

        tokio::spawn(pump_stdin(process_id, stdin, stdin_rx));
        let stdout_task = tokio::spawn(pump_stdout(
            process_id,
            stdout,
            binding_rx.clone(),
            ReadinessLatch {
                sentinel: self.config.ready_sentinel.clone(),
                seen: readiness_tx,
            },
            self.config.max_line_bytes,
            self.metrics.clone(),
        ));
        tokio::spawn(pump_stderr(process_id, stderr));
        tokio::spawn(monitor(
            process_id,
            child,
            kill_rx,
            stdout_task,
            binding_rx,
            exit_tx,
            self.metrics.clone(),
        ));

        info!(
            process_id,
            os_pid = ?os_pid,
            session_id = %launch.session_id,
            voice_id = %launch.voice_id,
            "Voice engine started"
        );

        Ok(EngineHandle {
            process_id,
            os_pid,
            stdin: stdin_tx,
            kill: Some(kill_tx),
            binding: Arc::new(binding_tx),
            exit: exit_rx,
            readiness: readiness_rx,
            metrics: self.metrics.clone(),
        })
    }
}

/// Remembers the first line of output that carries the ready sentinel.
struct ReadinessLatch {
    sentinel: String,
    seen: watch::Sender<Option<ReadinessSignal>>,
}

impl ReadinessLatch {
    fn observe(&self, output: &EngineOutput) {
        if self.seen.borrow().is_some() {
            return;
        }
        if let Some(signal) = ReadinessSignal::detect(output, &self.sentinel) {
            self.seen.send_replace(Some(signal));
        }
    }
}

fn deliver(binding: &watch::Receiver<Binding>, event: EngineEvent) -> bool {
    let recipient = binding.borrow().clone();
    match recipient {
        Some(recipient) => {
            recipient.do_send(event);
            true
        }
        None => false,
    }
}

async fn pump_stdin(process_id: u64, mut stdin: ChildStdin, mut frames: mpsc::Receiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        let line = match frame.to_line() {
            Ok(line) => line,
            Err(err) => {
                warn!(process_id, error = %err, "Failed to encode frame for engine");
                continue;
            }
        };
        if let Err(err) = stdin.write_all(line.as_bytes()).await {
            warn!(process_id, error = %err, "Engine stdin write failed, closing input");
            break;
        }
        if let Err(err) = stdin.flush().await {
            warn!(process_id, error = %err, "Engine stdin flush failed, closing input");
            break;
        }
    }
    debug!(process_id, "Engine stdin pump finished");
}

async fn pump_stdout(
    process_id: u64,
    mut stdout: ChildStdout,
    binding: watch::Receiver<Binding>,
    readiness: ReadinessLatch,
    max_line_bytes: usize,
    metrics: Arc<RelayMetrics>,
) {
    let mut codec = FrameCodec::new(max_line_bytes);
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let read = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!(process_id, error = %err, "Engine stdout read failed");
                break;
            }
        };
        for output in codec.decode(&buf[..read]) {
            // Latched before delivery: a connection that binds after a
            // discarded ready line still finds it on the handle.
            readiness.observe(&output);
            forward_output(process_id, &binding, output, &metrics);
        }
    }

    if let Some(output) = codec.finish() {
        readiness.observe(&output);
        forward_output(process_id, &binding, output, &metrics);
    }
    debug!(process_id, "Engine stdout closed");
}

fn forward_output(
    process_id: u64,
    binding: &watch::Receiver<Binding>,
    output: EngineOutput,
    metrics: &RelayMetrics,
) {
    if deliver(binding, EngineEvent::Output { process_id, output }) {
        RelayMetrics::incr(&metrics.frames_to_client);
    } else {
        debug!(process_id, "No connection bound, discarding engine output");
    }
}

async fn pump_stderr(process_id: u64, stderr: ChildStderr) {
    let mut lines = LinesStream::new(BufReader::new(stderr).lines());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => debug!(target: "engine", process_id, "{}", line),
            Err(err) => {
                debug!(target: "engine", process_id, error = %err, "Engine stderr read failed");
                break;
            }
        }
    }
}

async fn monitor(
    process_id: u64,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    stdout_task: JoinHandle<()>,
    binding: watch::Receiver<Binding>,
    exit: watch::Sender<Option<ExitSummary>>,
    metrics: Arc<RelayMetrics>,
) {
    let mut killed = false;
    let status = tokio::select! {
        status = child.wait() => status,
        // A dropped handle counts as a kill request.
        _ = kill => {
            killed = true;
            if let Err(err) = child.start_kill() {
                warn!(process_id, error = %err, "Failed to signal voice engine");
            }
            child.wait().await
        }
    };

    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_task).await.is_err() {
        warn!(process_id, "Engine stdout did not drain after exit");
    }

    let summary = match status {
        Ok(status) => ExitSummary {
            code: status.code(),
            success: status.success(),
            killed,
        },
        Err(err) => {
            warn!(process_id, error = %err, "Failed to wait for voice engine");
            ExitSummary {
                code: None,
                success: false,
                killed,
            }
        }
    };

    RelayMetrics::decr(&metrics.engines_live);
    RelayMetrics::incr(&metrics.engines_exited);
    if summary.success || summary.killed {
        info!(process_id, code = ?summary.code, killed, "Voice engine exited");
    } else {
        warn!(process_id, code = ?summary.code, "Voice engine exited unexpectedly");
    }

    exit.send_replace(Some(summary));
    deliver(&binding, EngineEvent::Exited { process_id, summary });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    /// Forwards every engine event into a channel the test can await.
    struct Collector(mpsc::UnboundedSender<EngineEvent>);

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<EngineEvent> for Collector {
        type Result = ();

        fn handle(&mut self, event: EngineEvent, _ctx: &mut Self::Context) {
            let _ = self.0.send(event);
        }
    }

    fn supervisor(script: &str) -> (ProcessSupervisor, Arc<RelayMetrics>) {
        let mut config = AppConfig::default().engine;
        config.command = "sh".to_string();
        config.args = vec!["-c".to_string(), script.to_string()];
        config.env_passthrough = vec![];
        let metrics = Arc::new(RelayMetrics::new());
        (ProcessSupervisor::new(config, metrics.clone()), metrics)
    }

    fn launch() -> SessionLaunch {
        SessionLaunch {
            session_id: "s1".to_string(),
            voice_id: "v1".to_string(),
            connection_id: "c1".to_string(),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for engine event")
            .expect("collector dropped")
    }

    #[actix_web::test]
    async fn test_frames_round_trip_through_engine() {
        let (supervisor, metrics) = supervisor(r#"echo '{"type":"text","text":"ready"}'; exec cat"#);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let collector = Collector(tx).start();

        let mut handle = supervisor.spawn(&launch(), Some(collector.recipient())).unwrap();
        let process_id = handle.process_id();

        assert_eq!(
            next_event(&mut rx).await,
            EngineEvent::Output {
                process_id,
                output: EngineOutput::Frame(Frame::Text { data: "ready".to_string() }),
            }
        );

        handle.send(Frame::Audio { data: "AAAA".to_string() }).unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            EngineEvent::Output {
                process_id,
                output: EngineOutput::Frame(Frame::Audio { data: "AAAA".to_string() }),
            }
        );

        handle.kill();
        match next_event(&mut rx).await {
            EngineEvent::Exited { process_id: id, summary } => {
                assert_eq!(id, process_id);
                assert!(summary.killed);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(metrics.live_engines(), 0);
        assert_eq!(handle.send(Frame::EndAudio), Err(RelayError::WriteAfterClose));
    }

    #[actix_web::test]
    async fn test_engine_receives_session_environment() {
        let (supervisor, _metrics) = supervisor(r#"echo "$SESSION_ID:$VOICE_ID:$AWS_REGION:${HOME:-unset}""#);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let collector = Collector(tx).start();

        let _handle = supervisor.spawn(&launch(), Some(collector.recipient())).unwrap();
        match next_event(&mut rx).await {
            EngineEvent::Output { output, .. } => {
                assert_eq!(output, EngineOutput::Diagnostic("s1:v1:us-east-1:unset".to_string()));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(next_event(&mut rx).await, EngineEvent::Exited { summary, .. } if summary.success));
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_recorded_without_binding() {
        let (supervisor, metrics) = supervisor("exit 3");
        let mut handle = supervisor.spawn(&launch(), None).unwrap();

        let summary = handle.wait_exit().await;
        assert_eq!(summary.code, Some(3));
        assert!(!summary.killed);
        assert!(handle.has_exited());
        assert_eq!(metrics.snapshot().engines_exited, 1);
        assert_eq!(handle.send(Frame::StartAudio), Err(RelayError::WriteAfterClose));
    }

    #[tokio::test]
    async fn test_first_ready_line_is_latched_without_binding() {
        let (supervisor, _metrics) = supervisor("echo 'loading'; echo 'Nova Sonic ready!'; echo 'ready again'; sleep 30");
        let mut handle = supervisor.spawn(&launch(), None).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handle.observed_readiness().is_none() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            handle.observed_readiness(),
            Some(ReadinessSignal::Sentinel("Nova Sonic ready!".to_string()))
        );

        handle.kill();
        assert!(handle.wait_exit().await.killed);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (mut supervisor, metrics) = supervisor("sleep 30");
        supervisor.config.stdin_queue_capacity = 1;
        let mut handle = supervisor.spawn(&launch(), None).unwrap();

        let mut dropped = 0;
        for _ in 0..10_000 {
            if handle.send(Frame::Audio { data: "A".repeat(4096) }) == Err(RelayError::Backpressure) {
                dropped += 1;
            }
        }
        assert!(dropped > 0);
        assert_eq!(metrics.snapshot().frames_dropped_backpressure, dropped);

        handle.kill();
        assert!(handle.wait_exit().await.killed);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let mut config = AppConfig::default().engine;
        config.command = "/nonexistent/voice-engine".to_string();
        let metrics = Arc::new(RelayMetrics::new());
        let supervisor = ProcessSupervisor::new(config, metrics.clone());

        assert!(matches!(supervisor.spawn(&launch(), None), Err(RelayError::Spawn(_))));
        assert_eq!(metrics.snapshot().spawn_failures, 1);
        assert_eq!(metrics.live_engines(), 0);
    }
}
