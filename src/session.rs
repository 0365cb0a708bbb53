//! Session lifecycle, client membership, and size negotiation.
//!
//! A [`Session`] ties together one child process, one PTY, one shadow
//! terminal, and a dynamic set of clients on two transports. The
//! [`SessionRegistry`] is the single authority for creating, looking up,
//! and reaping sessions; it holds its own mutex and is never held while
//! per-session work runs.
//!
//! ## Locking
//!
//! Each session owns three locks:
//! - `state` guards membership maps, sizes, and the PTY handle.
//! - `write_gate` serializes every socket write. The output pump holds
//!   it across "apply to shadow terminal, then fan out", and a joining
//!   client holds it across "register, then send snapshot", so a late
//!   joiner can neither miss output nor receive it twice.
//! - the shadow terminal's own mutex (inside `term`).
//!
//! Lock order is always `write_gate` → `state`; status broadcasts
//! collect their targets under `state`, release it, then take the gate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assistant::{AssistantCatalog, AssistantConfig};
use crate::protocol::{ServerMessage, TermSize};
use crate::pty::{PtyError, PtyProcess};
use crate::term::VirtualTerminal;

/// Polling clients are dropped when their last poll is older than this.
pub const POLL_STALENESS: Duration = Duration::from_secs(60);
/// Reaper sweep interval.
pub const REAPER_TICK: Duration = Duration::from_secs(60);
/// Pause between an abnormal exit and the restart attempt.
const RESTART_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown assistant: {0}")]
    UnknownAssistant(String),
    #[error("failed to start assistant: {0}")]
    SpawnFailure(#[from] PtyError),
}

/// Write half of a duplex client's socket.
///
/// The socket is not safe for concurrent writes, so every send goes
/// through this mutex and the session's write gate.
pub type ClientSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

struct DuplexClient {
    size: TermSize,
    sink: ClientSink,
}

struct PollingClient {
    size: TermSize,
    last_poll: Instant,
}

struct SessionState {
    pty: Option<Arc<PtyProcess>>,
    /// Taken by the output pump; refilled on restart.
    output_rx: Option<mpsc::Receiver<Vec<u8>>>,
    duplex: HashMap<u64, DuplexClient>,
    next_duplex_id: u64,
    polling: HashMap<String, PollingClient>,
    applied: TermSize,
    last_activity: Instant,
    pump_running: bool,
    closed: bool,
}

/// What the output pump does after the child exits.
#[derive(Debug, PartialEq, Eq)]
enum ExitAction {
    /// Clean exit: announce and stop.
    AnnounceExit,
    /// Abnormal exit with clients watching: restart with the resume
    /// command line.
    Restart,
    /// Abnormal exit, nobody attached: stop quietly.
    Drop,
}

fn exit_action(success: bool, clients: usize) -> ExitAction {
    if success {
        ExitAction::AnnounceExit
    } else if clients > 0 {
        ExitAction::Restart
    } else {
        ExitAction::Drop
    }
}

/// Component-wise minimum over all attached client sizes, floored at
/// (1,1); the default size when no clients are attached.
fn negotiated_size(sizes: impl Iterator<Item = TermSize>) -> TermSize {
    match sizes.reduce(TermSize::min) {
        Some(min) => TermSize::clamped(min.rows, min.cols),
        None => TermSize::DEFAULT,
    }
}

/// One shared terminal: a child process under a PTY, its shadow
/// terminal, and the clients watching it.
pub struct Session {
    pub id: String,
    pub assistant: AssistantConfig,
    term: parking_lot::Mutex<VirtualTerminal>,
    state: Mutex<SessionState>,
    write_gate: Mutex<()>,
    cwd: Option<PathBuf>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("assistant", &self.assistant)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn create(
        id: &str,
        assistant: AssistantConfig,
        cwd: Option<&Path>,
    ) -> Result<Arc<Self>, SessionError> {
        let size = TermSize::DEFAULT;
        let (pty, output_rx) = PtyProcess::spawn(&assistant.command, size.rows, size.cols, cwd)?;
        info!(
            session_id = %id,
            assistant = %assistant.name,
            command = %assistant.command,
            "session created"
        );
        Ok(Arc::new(Session {
            id: id.to_string(),
            assistant,
            term: parking_lot::Mutex::new(VirtualTerminal::new(size.rows, size.cols)),
            state: Mutex::new(SessionState {
                pty: Some(Arc::new(pty)),
                output_rx: Some(output_rx),
                duplex: HashMap::new(),
                next_duplex_id: 1,
                polling: HashMap::new(),
                applied: size,
                last_activity: Instant::now(),
                pump_running: false,
                closed: false,
            }),
            write_gate: Mutex::new(()),
            cwd: cwd.map(Path::to_path_buf),
        }))
    }

    /// Render the current screen as a self-contained escape sequence.
    pub fn snapshot(&self) -> Vec<u8> {
        self.term.lock().snapshot()
    }

    /// `(viewer count, applied size)` for status and poll responses.
    pub async fn status(&self) -> (usize, TermSize) {
        let st = self.state.lock().await;
        (st.duplex.len() + st.polling.len(), st.applied)
    }

    /// Block until the shadow terminal shows any non-whitespace glyph,
    /// or `max_wait` elapses. Used before a fresh session's first
    /// snapshot so the caller gets a banner instead of a blank screen.
    pub async fn wait_for_content(&self, max_wait: Duration) {
        let deadline = Instant::now() + max_wait;
        while Instant::now() < deadline {
            if self.term.lock().has_visible_content() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Recompute the negotiated size; apply it to PTY and shadow
    /// terminal only when it actually changed.
    fn sync_size_locked(&self, st: &mut SessionState) -> bool {
        let new = negotiated_size(
            st.duplex
                .values()
                .map(|c| c.size)
                .chain(st.polling.values().map(|c| c.size)),
        );
        if new == st.applied {
            return false;
        }
        debug!(
            session_id = %self.id,
            rows = new.rows,
            cols = new.cols,
            "applying negotiated size"
        );
        st.applied = new;
        if let Some(pty) = &st.pty {
            if let Err(e) = pty.resize(new.rows, new.cols) {
                warn!(session_id = %self.id, error = %e, "PTY resize failed");
            }
        }
        self.term.lock().resize(new.rows, new.cols);
        true
    }

    /// Add a duplex client. When `catch_up` is set (the session already
    /// existed) the client's first payload is a snapshot, sent under the
    /// write gate so no PTY output can slip in front of it.
    pub async fn attach_duplex(&self, sink: ClientSink, size: TermSize, catch_up: bool) -> u64 {
        let id;
        {
            let _gate = self.write_gate.lock().await;
            {
                let mut st = self.state.lock().await;
                id = st.next_duplex_id;
                st.next_duplex_id += 1;
                st.duplex.insert(
                    id,
                    DuplexClient {
                        size,
                        sink: sink.clone(),
                    },
                );
                st.last_activity = Instant::now();
                self.sync_size_locked(&mut st);
            }
            if catch_up {
                let snap = self.term.lock().snapshot();
                if let Err(e) = sink.lock().await.send(Message::Binary(snap)).await {
                    warn!(session_id = %self.id, error = %e, "failed to send join snapshot");
                }
            }
        }
        info!(session_id = %self.id, client = id, "duplex client attached");
        self.broadcast_status().await;
        id
    }

    pub async fn detach_duplex(&self, id: u64) {
        {
            let mut st = self.state.lock().await;
            st.duplex.remove(&id);
            st.last_activity = Instant::now();
            self.sync_size_locked(&mut st);
        }
        info!(session_id = %self.id, client = id, "duplex client detached");
        self.broadcast_status().await;
    }

    pub async fn update_duplex_size(&self, id: u64, size: TermSize) {
        let changed = {
            let mut st = self.state.lock().await;
            if let Some(client) = st.duplex.get_mut(&id) {
                client.size = size;
            }
            self.sync_size_locked(&mut st)
        };
        if changed {
            self.broadcast_status().await;
        }
    }

    /// Register or refresh a polling client; update its size when the
    /// poll carried one.
    pub async fn touch_polling(&self, client_id: &str, size: Option<TermSize>) {
        let (joined, resized) = {
            let mut st = self.state.lock().await;
            let joined = !st.polling.contains_key(client_id);
            let entry = st
                .polling
                .entry(client_id.to_string())
                .or_insert(PollingClient {
                    size: TermSize::DEFAULT,
                    last_poll: Instant::now(),
                });
            entry.last_poll = Instant::now();
            if let Some(size) = size {
                entry.size = size;
            }
            st.last_activity = Instant::now();
            let resized = self.sync_size_locked(&mut st);
            (joined, resized)
        };
        if joined || resized {
            self.broadcast_status().await;
        }
    }

    pub async fn polling_known(&self, client_id: &str) -> bool {
        self.state.lock().await.polling.contains_key(client_id)
    }

    /// Update a polling client's size from a `send` resize request.
    pub async fn resize_polling(&self, client_id: &str, size: TermSize) {
        let changed = {
            let mut st = self.state.lock().await;
            if let Some(client) = st.polling.get_mut(client_id) {
                client.size = size;
            }
            st.last_activity = Instant::now();
            self.sync_size_locked(&mut st)
        };
        if changed {
            self.broadcast_status().await;
        }
    }

    /// Drop polling clients that have not polled within `max_age`.
    /// Returns true when any were evicted.
    pub async fn evict_stale_pollers(&self, max_age: Duration) -> bool {
        let evicted = {
            let mut st = self.state.lock().await;
            let before = st.polling.len();
            st.polling.retain(|_, c| c.last_poll.elapsed() <= max_age);
            let evicted = before - st.polling.len();
            if evicted > 0 {
                self.sync_size_locked(&mut st);
            }
            evicted
        };
        if evicted > 0 {
            info!(session_id = %self.id, evicted, "dropped stale polling clients");
            self.broadcast_status().await;
        }
        evicted > 0
    }

    /// Write raw client input to the child's stdin.
    pub async fn write_input(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let pty = {
            let mut st = self.state.lock().await;
            st.last_activity = Instant::now();
            st.pty.clone()
        };
        match pty {
            Some(pty) => pty.write(bytes),
            None => Err(PtyError::WriteFailed("no child process".to_string())),
        }
    }

    /// Write input one byte at a time with a short delay between bytes.
    ///
    /// Some TUIs drop or misparse input that arrives faster than a
    /// human could type; the long-poll transport always paces.
    pub async fn write_input_paced(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let pty = {
            let mut st = self.state.lock().await;
            st.last_activity = Instant::now();
            st.pty.clone()
        };
        let Some(pty) = pty else {
            return Err(PtyError::WriteFailed("no child process".to_string()));
        };
        for (i, byte) in bytes.iter().enumerate() {
            pty.write(std::slice::from_ref(byte))?;
            if i + 1 < bytes.len() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        Ok(())
    }

    /// Send one message to a single client under the write gate.
    pub async fn send_to(&self, sink: &ClientSink, msg: Message) {
        let _gate = self.write_gate.lock().await;
        if let Err(e) = sink.lock().await.send(msg).await {
            debug!(session_id = %self.id, error = %e, "direct send failed");
        }
    }

    /// Fan a message out to every duplex client; returns ids whose
    /// socket write failed.
    async fn fanout(&self, msg: Message) -> Vec<u64> {
        let sinks: Vec<(u64, ClientSink)> = {
            let st = self.state.lock().await;
            st.duplex
                .iter()
                .map(|(id, c)| (*id, c.sink.clone()))
                .collect()
        };
        let _gate = self.write_gate.lock().await;
        let mut failed = Vec::new();
        for (id, sink) in sinks {
            if sink.lock().await.send(msg.clone()).await.is_err() {
                failed.push(id);
            }
        }
        failed
    }

    fn evict_failed_locked(&self, st: &mut SessionState, failed: &[u64]) {
        for id in failed {
            st.duplex.remove(id);
            warn!(session_id = %self.id, client = *id, "evicting client after write failure");
        }
        self.sync_size_locked(st);
    }

    /// Broadcast the current status to all duplex clients. Re-runs when
    /// a write failure shrank the membership, so the viewer count sent
    /// out is consistent with who actually received it.
    pub async fn broadcast_status(&self) {
        loop {
            let msg = {
                let st = self.state.lock().await;
                ServerMessage::Status {
                    viewers: st.duplex.len() + st.polling.len(),
                    cols: st.applied.cols,
                    rows: st.applied.rows,
                    assistant: self.assistant.display_name.clone(),
                }
            };
            let failed = self.fanout(Message::Text(msg.to_json())).await;
            if failed.is_empty() {
                return;
            }
            let mut st = self.state.lock().await;
            self.evict_failed_locked(&mut st, &failed);
        }
    }

    /// Broadcast a control message (chat, exit) to all duplex clients.
    pub async fn broadcast_control(&self, msg: &ServerMessage) {
        let failed = self.fanout(Message::Text(msg.to_json())).await;
        if !failed.is_empty() {
            {
                let mut st = self.state.lock().await;
                self.evict_failed_locked(&mut st, &failed);
            }
            self.broadcast_status().await;
        }
    }

    /// Apply one output chunk to the shadow terminal, then fan it out.
    ///
    /// The shadow write and the sends happen under the write gate so a
    /// concurrently joining client sees each byte exactly once (either
    /// inside its snapshot or as live output).
    async fn apply_output(&self, chunk: &[u8]) {
        let failed = {
            let _gate = self.write_gate.lock().await;
            self.term.lock().write(chunk);
            let sinks: Vec<(u64, ClientSink)> = {
                let st = self.state.lock().await;
                st.duplex
                    .iter()
                    .map(|(id, c)| (*id, c.sink.clone()))
                    .collect()
            };
            let msg = Message::Binary(chunk.to_vec());
            let mut failed = Vec::new();
            for (id, sink) in sinks {
                if sink.lock().await.send(msg.clone()).await.is_err() {
                    failed.push(id);
                }
            }
            failed
        };
        if !failed.is_empty() {
            {
                let mut st = self.state.lock().await;
                self.evict_failed_locked(&mut st, &failed);
            }
            self.broadcast_status().await;
        }
    }

    /// Start the output pump once per session.
    pub fn spawn_output_pump(session: Arc<Session>) {
        tokio::spawn(async move {
            {
                let mut st = session.state.lock().await;
                if st.pump_running || st.closed {
                    return;
                }
                st.pump_running = true;
            }
            session.run_output_pump().await;
        });
    }

    /// Drain PTY output into the shadow terminal and the clients,
    /// applying the restart policy when the child exits. The loop
    /// persists across restarts: each restart installs a fresh channel
    /// before the next iteration picks it up.
    async fn run_output_pump(self: Arc<Self>) {
        debug!(session_id = %self.id, "output pump started");
        loop {
            let rx = self.state.lock().await.output_rx.take();
            let Some(mut rx) = rx else { break };
            while let Some(chunk) = rx.recv().await {
                self.apply_output(&chunk).await;
            }
            if !self.handle_child_exit().await {
                break;
            }
        }
        debug!(session_id = %self.id, "output pump stopped");
    }

    /// Reap the exited child and decide whether to restart.
    /// Returns true when a new child was started.
    async fn handle_child_exit(&self) -> bool {
        let (pty, closed, clients, applied) = {
            let st = self.state.lock().await;
            (
                st.pty.clone(),
                st.closed,
                st.duplex.len() + st.polling.len(),
                st.applied,
            )
        };
        if closed {
            return false;
        }
        let Some(pty) = pty else { return false };
        let Some(mut child) = pty.take_child() else {
            return false;
        };

        let status = tokio::task::spawn_blocking(move || child.wait()).await;
        let (success, code) = match status {
            Ok(Ok(status)) => (status.success(), status.exit_code() as i64),
            _ => (false, -1),
        };
        info!(session_id = %self.id, exit_code = code, "child exited");

        match exit_action(success, clients) {
            ExitAction::AnnounceExit => {
                self.apply_output(b"[Process exited successfully]\r\n").await;
                self.broadcast_control(&ServerMessage::Exit { exit_code: 0 }).await;
                false
            }
            ExitAction::Drop => {
                debug!(session_id = %self.id, "no clients attached, not restarting");
                false
            }
            ExitAction::Restart => {
                let line = format!("[Process exited with code {code}, restarting...]\r\n");
                self.apply_output(line.as_bytes()).await;
                tokio::time::sleep(RESTART_DELAY).await;

                match PtyProcess::spawn(
                    &self.assistant.resume_command,
                    applied.rows,
                    applied.cols,
                    self.cwd.as_deref(),
                ) {
                    Ok((new_pty, rx)) => {
                        let mut st = self.state.lock().await;
                        if st.closed {
                            drop(st);
                            new_pty.kill_and_reap().await;
                            return false;
                        }
                        st.pty = Some(Arc::new(new_pty));
                        st.output_rx = Some(rx);
                        info!(
                            session_id = %self.id,
                            command = %self.assistant.resume_command,
                            "child restarted"
                        );
                        true
                    }
                    Err(e) => {
                        warn!(session_id = %self.id, error = %e, "restart failed");
                        let line = format!("[Failed to restart process: {e}]\r\n");
                        self.apply_output(line.as_bytes()).await;
                        false
                    }
                }
            }
        }
    }

    /// Tear the session down exactly once: kill and reap the child,
    /// close the PTY, and drop every client handle.
    pub async fn close(&self) {
        let pty = {
            let mut st = self.state.lock().await;
            if st.closed {
                return;
            }
            st.closed = true;
            st.duplex.clear();
            st.polling.clear();
            st.output_rx = None;
            st.pty.take()
        };
        if let Some(pty) = pty {
            pty.kill_and_reap().await;
        }
        info!(session_id = %self.id, "session closed");
    }

    /// True when nobody is attached and the session has been idle
    /// longer than `ttl`.
    pub async fn is_reapable(&self, ttl: Duration) -> bool {
        let st = self.state.lock().await;
        st.duplex.is_empty() && st.polling.is_empty() && st.last_activity.elapsed() > ttl
    }
}

/// Process-wide table of live sessions, keyed by their UUID-shaped id.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    pub catalog: AssistantCatalog,
    pub session_ttl: Duration,
    pub working_dir: Option<PathBuf>,
    pub uploads_dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(
        catalog: AssistantCatalog,
        session_ttl: Duration,
        working_dir: Option<PathBuf>,
        uploads_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            catalog,
            session_ttl,
            working_dir,
            uploads_dir,
        })
    }

    /// Return the session stored under `id`, creating it when absent.
    ///
    /// The registry lock is held across the lookup and insert so two
    /// concurrent requests can never spawn two children for one id.
    /// When the id already exists under a different assistant the
    /// stored session wins; callers redirect (see the HTTP layer).
    pub async fn lookup_or_create(
        &self,
        id: &str,
        assistant: &str,
    ) -> Result<(Arc<Session>, bool), SessionError> {
        let config = self
            .catalog
            .get(assistant)
            .ok_or_else(|| SessionError::UnknownAssistant(assistant.to_string()))?
            .clone();

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(id) {
            return Ok((session.clone(), false));
        }
        let session = Session::create(id, config, self.working_dir.as_deref())?;
        sessions.insert(id.to_string(), session.clone());
        Ok((session, true))
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) {
        self.sessions.lock().await.remove(id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// One reaper sweep: evict stale polling clients everywhere, then
    /// close and remove sessions that have been idle with no clients
    /// longer than the TTL.
    pub async fn reap_once(&self) {
        let snapshot: Vec<(String, Arc<Session>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(id, s)| (id.clone(), s.clone()))
                .collect()
        };
        for (id, session) in snapshot {
            session.evict_stale_pollers(POLL_STALENESS).await;
            if session.is_reapable(self.session_ttl).await {
                info!(session_id = %id, "reaping idle session");
                session.close().await;
                self.remove(&id).await;
            }
        }
    }

    /// Background task sweeping the registry once per tick.
    pub fn spawn_reaper(registry: Arc<SessionRegistry>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_TICK);
            tick.tick().await; // immediate first tick
            loop {
                tick.tick().await;
                registry.reap_once().await;
            }
        })
    }

    /// Close every session; used during graceful shutdown.
    pub async fn close_all(&self) {
        let snapshot: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in snapshot {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(rows: u16, cols: u16) -> TermSize {
        TermSize { rows, cols }
    }

    #[test]
    fn no_clients_means_default_size() {
        assert_eq!(negotiated_size(std::iter::empty()), TermSize::DEFAULT);
    }

    #[test]
    fn size_is_component_wise_minimum() {
        let sizes = vec![size(40, 120), size(24, 80), size(30, 100)];
        assert_eq!(negotiated_size(sizes.into_iter()), size(24, 80));
    }

    #[test]
    fn minimum_mixes_dimensions_across_clients() {
        // One tall-narrow and one short-wide client: the result matches
        // neither client exactly.
        let sizes = vec![size(50, 60), size(20, 200)];
        assert_eq!(negotiated_size(sizes.into_iter()), size(20, 60));
    }

    #[test]
    fn size_floors_at_one() {
        let sizes = vec![size(0, 0)];
        assert_eq!(negotiated_size(sizes.into_iter()), size(1, 1));
    }

    #[test]
    fn restart_policy_table() {
        // Clean exit never restarts, attached clients or not.
        assert_eq!(exit_action(true, 0), ExitAction::AnnounceExit);
        assert_eq!(exit_action(true, 3), ExitAction::AnnounceExit);
        // Crash restarts only while someone is watching.
        assert_eq!(exit_action(false, 1), ExitAction::Restart);
        assert_eq!(exit_action(false, 0), ExitAction::Drop);
    }
}
