//! Line-oriented console surface.
//!
//! One conversation per user, keyed `console:<user>`. Lines starting with `/`
//! are commands; anything else goes to the user's current session, which is
//! created on demand.

use std::future::Future;
use std::io;
use std::sync::Arc;

use sessionhub_core::registry::{RegisterOptions, SessionMapping, SurfaceSessionRegistry};
use sessionhub_core::session::{project_id_for, SessionConfig};
use sessionhub_core::{BackendError, SessionBackend};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub const SURFACE_NAME: &str = "console";

/// What the read loop should do after a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Nothing,
    Quit,
}

/// Why [`ConsoleSurface::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Quit,
    EndOfInput,
    Interrupted,
}

pub struct ConsoleSurface {
    registry: SurfaceSessionRegistry,
    backend: Arc<dyn SessionBackend>,
    user_id: String,
    working_dir: String,
}

impl ConsoleSurface {
    pub fn new(
        registry: SurfaceSessionRegistry,
        backend: Arc<dyn SessionBackend>,
        user_id: impl Into<String>,
        working_dir: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            backend,
            user_id: user_id.into(),
            working_dir: working_dir.into(),
        }
    }

    pub fn routing_key(&self) -> String {
        format!("console:{}", self.user_id)
    }

    pub fn registry(&self) -> &SurfaceSessionRegistry {
        &self.registry
    }

    /// Read lines until `/quit`, end of input or `shutdown` resolves.
    ///
    /// `shutdown` also cancels a turn that is still waiting on the agent.
    pub async fn run<R, S>(&self, input: R, shutdown: S) -> io::Result<Exit>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        let mut lines = input.lines();
        tokio::pin!(shutdown);

        loop {
            let line = tokio::select! {
                _ = &mut shutdown => return Ok(Exit::Interrupted),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                return Ok(Exit::EndOfInput);
            };

            let reply = tokio::select! {
                _ = &mut shutdown => return Ok(Exit::Interrupted),
                reply = self.handle_line(&line) => reply,
            };
            match reply {
                Reply::Text(text) => println!("{text}"),
                Reply::Nothing => {}
                Reply::Quit => return Ok(Exit::Quit),
            }
        }
    }

    pub async fn handle_line(&self, line: &str) -> Reply {
        let line = line.trim();
        if line.is_empty() {
            return Reply::Nothing;
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "/new" => self.new_session(rest).await,
            "/end" => self.end_current().await,
            "/list" => self.list(),
            "/quit" => Reply::Quit,
            _ if command.starts_with('/') => {
                Reply::Text(format!("Unknown command {command}. Try /new, /end, /list or /quit."))
            }
            _ => self.send(line).await,
        }
    }

    fn current(&self) -> Option<SessionMapping> {
        self.registry
            .lookup(&self.routing_key())
            .filter(|m| m.is_active)
    }

    async fn new_session(&self, description: &str) -> Reply {
        // The key is reused, so retire whatever it pointed at first.
        if let Some(previous) = self.current() {
            self.backend.end_session(&previous.session_id).await;
            self.registry.deactivate(&previous.routing_key).await;
        }

        match self.start_session(description).await {
            Ok(mapping) => Reply::Text(format!("Started session {}", mapping.session_id)),
            Err(message) => Reply::Text(message),
        }
    }

    async fn start_session(&self, description: &str) -> Result<SessionMapping, String> {
        self.registry
            .check_limit(&self.user_id)
            .map_err(|e| e.to_string())?;

        let config = SessionConfig::new(self.working_dir.clone(), SURFACE_NAME)
            .description(description);
        let info = self
            .backend
            .create_session(config)
            .await
            .map_err(|e| e.to_string())?;

        let options = RegisterOptions::default()
            .project(project_id_for(&self.working_dir))
            .description(description);
        Ok(self
            .registry
            .register(&self.routing_key(), &info.session_id, &self.user_id, options)
            .await)
    }

    async fn end_current(&self) -> Reply {
        match self.current() {
            Some(mapping) => {
                self.backend.end_session(&mapping.session_id).await;
                self.registry.deactivate(&mapping.routing_key).await;
                Reply::Text(format!("Ended session {}", mapping.session_id))
            }
            None => Reply::Text("No active session".to_string()),
        }
    }

    fn list(&self) -> Reply {
        let mappings = self.registry.list_for_user(&self.user_id);
        if mappings.is_empty() {
            return Reply::Text("No active sessions".to_string());
        }
        let lines: Vec<String> = mappings
            .iter()
            .map(|m| {
                let mut line = format!("{}  {}  last active {}", m.routing_key, m.session_id, m.last_active);
                if !m.description.is_empty() {
                    line.push_str("  ");
                    line.push_str(&m.description);
                }
                line
            })
            .collect();
        Reply::Text(lines.join("\n"))
    }

    async fn send(&self, message: &str) -> Reply {
        let mapping = match self.current() {
            Some(mapping) => mapping,
            None => match self.start_session("").await {
                Ok(mapping) => mapping,
                Err(message) => return Reply::Text(message),
            },
        };

        match self.backend.send_message(&mapping.session_id, message).await {
            Ok(response) => {
                self.registry.update_activity(&mapping.routing_key).await;
                Reply::Text(response)
            }
            Err(BackendError::UnknownSession(id)) => {
                log::warn!("Session {} is gone; retiring {}", id, mapping.routing_key);
                self.registry.deactivate(&mapping.routing_key).await;
                Reply::Text(format!(
                    "Session {id} could not be recovered. Your next message starts a new one."
                ))
            }
            Err(e) => Reply::Text(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionhub_core::backend::MockCall;
    use sessionhub_core::MockBackend;
    use tempfile::tempdir;

    fn surface(backend: Arc<MockBackend>, max: usize) -> ConsoleSurface {
        let registry = SurfaceSessionRegistry::new(SURFACE_NAME, None, max);
        ConsoleSurface::new(registry, backend, "alice", "/srv/app")
    }

    fn text(reply: Reply) -> String {
        match reply {
            Reply::Text(text) => text,
            other => panic!("expected text, got {other:?}"),
        }
    }

    mod messages {
        use super::*;

        #[tokio::test]
        async fn first_message_creates_and_registers_a_session() {
            let backend = Arc::new(MockBackend::new());
            let console = surface(backend.clone(), 10);

            let reply = text(console.handle_line("hello").await);

            assert_eq!(reply, "[mock] hello");
            let mapping = console.registry().lookup("console:alice").unwrap();
            assert_eq!(mapping.session_id, "mock-session-0001");
            assert_eq!(mapping.project_id, "app");
            assert_eq!(mapping.surface, SURFACE_NAME);
        }

        #[tokio::test]
        async fn later_messages_reuse_the_session() {
            let backend = Arc::new(MockBackend::new());
            let console = surface(backend.clone(), 10);

            console.handle_line("one").await;
            console.handle_line("two").await;

            assert_eq!(backend.list_active_sessions().len(), 1);
            assert_eq!(backend.history("mock-session-0001").len(), 4);
        }

        #[tokio::test]
        async fn unavailable_backend_is_reported() {
            let backend = Arc::new(MockBackend::new());
            backend.set_available(false);
            let console = surface(backend.clone(), 10);

            let reply = text(console.handle_line("hello").await);

            assert!(reply.contains("unavailable"), "{reply}");
            assert!(console.registry().is_empty());
        }

        #[tokio::test]
        async fn blank_lines_are_ignored() {
            let backend = Arc::new(MockBackend::new());
            let console = surface(backend.clone(), 10);

            assert_eq!(console.handle_line("   ").await, Reply::Nothing);
            assert!(backend.calls().is_empty());
        }

        #[tokio::test]
        async fn lost_session_is_retired() {
            let backend = Arc::new(MockBackend::new());
            let console = surface(backend.clone(), 10);
            console.handle_line("hello").await;

            // Ended behind the surface's back.
            backend.end_session("mock-session-0001").await;
            let reply = text(console.handle_line("still there?").await);

            assert!(reply.contains("could not be recovered"));
            assert!(!console.registry().lookup("console:alice").unwrap().is_active);

            assert_eq!(text(console.handle_line("again").await), "[mock] again");
            assert_eq!(
                console.registry().lookup("console:alice").unwrap().session_id,
                "mock-session-0002"
            );
        }
    }

    mod commands {
        use super::*;

        #[tokio::test]
        async fn new_replaces_the_current_session() {
            let backend = Arc::new(MockBackend::new());
            let console = surface(backend.clone(), 10);
            console.handle_line("hello").await;

            let reply = text(console.handle_line("/new refactor parser").await);

            assert_eq!(reply, "Started session mock-session-0002");
            assert_eq!(backend.list_active_sessions().len(), 1);
            let mapping = console.registry().lookup("console:alice").unwrap();
            assert_eq!(mapping.description, "refactor parser");
            assert!(backend
                .calls()
                .contains(&MockCall::EndSession {
                    session_id: "mock-session-0001".to_string()
                }));
        }

        #[tokio::test]
        async fn new_respects_the_limit() {
            let backend = Arc::new(MockBackend::new());
            let console = surface(backend.clone(), 0);

            let reply = text(console.handle_line("/new").await);

            assert!(reply.contains("already has 0 active sessions"), "{reply}");
            assert!(backend.list_active_sessions().is_empty());
        }

        #[tokio::test]
        async fn end_deactivates_the_mapping() {
            let backend = Arc::new(MockBackend::new());
            let console = surface(backend.clone(), 10);
            console.handle_line("hello").await;

            let reply = text(console.handle_line("/end").await);

            assert_eq!(reply, "Ended session mock-session-0001");
            assert!(backend.list_active_sessions().is_empty());
            assert!(console.registry().list_active().is_empty());
            assert_eq!(text(console.handle_line("/end").await), "No active session");
        }

        #[tokio::test]
        async fn list_shows_active_sessions() {
            let backend = Arc::new(MockBackend::new());
            let console = surface(backend.clone(), 10);

            assert_eq!(text(console.handle_line("/list").await), "No active sessions");

            console.handle_line("/new docs pass").await;
            let listing = text(console.handle_line("/list").await);

            assert!(listing.starts_with("console:alice  mock-session-0001"));
            assert!(listing.ends_with("docs pass"));
        }

        #[tokio::test]
        async fn quit_and_unknown_commands() {
            let backend = Arc::new(MockBackend::new());
            let console = surface(backend, 10);

            assert_eq!(console.handle_line("/quit").await, Reply::Quit);
            assert!(text(console.handle_line("/bogus").await).starts_with("Unknown command /bogus"));
        }
    }

    mod read_loop {
        use super::*;
        use async_trait::async_trait;
        use sessionhub_core::SessionInfo;
        use std::time::Duration;

        /// Backend whose turns never finish.
        struct StuckBackend(MockBackend);

        #[async_trait]
        impl SessionBackend for StuckBackend {
            async fn create_session(
                &self,
                config: SessionConfig,
            ) -> Result<SessionInfo, BackendError> {
                self.0.create_session(config).await
            }

            async fn send_message(&self, _session_id: &str, _message: &str) -> Result<String, BackendError> {
                std::future::pending().await
            }

            async fn end_session(&self, session_id: &str) {
                self.0.end_session(session_id).await
            }

            async fn get_session_info(&self, session_id: &str) -> Option<SessionInfo> {
                self.0.get_session_info(session_id).await
            }

            fn list_active_sessions(&self) -> Vec<SessionInfo> {
                self.0.list_active_sessions()
            }

            fn backend_name(&self) -> &'static str {
                "stuck"
            }
        }

        #[tokio::test]
        async fn quit_stops_reading() {
            let console = surface(Arc::new(MockBackend::new()), 10);
            let input: &[u8] = b"hello\n/quit\nnever sent\n";

            let exit = console.run(input, std::future::pending()).await.unwrap();

            assert_eq!(exit, Exit::Quit);
            assert_eq!(console.registry().len(), 1);
        }

        #[tokio::test]
        async fn end_of_input_returns() {
            let console = surface(Arc::new(MockBackend::new()), 10);
            let input: &[u8] = b"";

            let exit = console.run(input, std::future::pending()).await.unwrap();
            assert_eq!(exit, Exit::EndOfInput);
        }

        #[tokio::test]
        async fn shutdown_interrupts_a_pending_turn() {
            let registry = SurfaceSessionRegistry::new(SURFACE_NAME, None, 10);
            let backend = Arc::new(StuckBackend(MockBackend::new()));
            let console = ConsoleSurface::new(registry, backend, "alice", "/srv/app");
            let input: &[u8] = b"this never gets an answer\n";

            let exit = tokio::time::timeout(
                Duration::from_secs(5),
                console.run(input, tokio::time::sleep(Duration::from_millis(50))),
            )
            .await
            .expect("run should return once shutdown fires")
            .unwrap();

            assert_eq!(exit, Exit::Interrupted);
        }
    }

    #[tokio::test]
    async fn mapping_survives_a_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("console.json");
        let backend = Arc::new(MockBackend::new());

        {
            let registry = SurfaceSessionRegistry::new(SURFACE_NAME, Some(path.clone()), 10);
            let console = ConsoleSurface::new(registry, backend.clone(), "alice", "/srv/app");
            console.handle_line("hello").await;
        }

        let registry = SurfaceSessionRegistry::new(SURFACE_NAME, Some(path), 10);
        let console = ConsoleSurface::new(registry, backend.clone(), "alice", "/srv/app");

        assert_eq!(text(console.handle_line("again").await), "[mock] again");
        assert_eq!(backend.list_active_sessions().len(), 1);
    }
}
