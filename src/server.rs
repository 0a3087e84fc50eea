//! TCP policy server
//!
//! Accepts simulator connections and answers every request with one
//! action. All connections share a single [`Session`]; the mutex keeps
//! each decide/update cycle atomic.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::brain::{Brain, DeepQBrain};
use crate::config::{ListenConfig, RunMode, ServerConfig};
use crate::error::{ParleyError, Result};
use crate::protocol::{decode_bytes, encode_action, FrameReader, Framing};
use crate::session::Session;
use crate::store::PolicyStore;

/// Connection handling settings
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub framing: Framing,
    /// Stop the whole server on the first failed request
    pub strict: bool,
}

impl From<&ListenConfig> for ConnectionSettings {
    fn from(config: &ListenConfig) -> Self {
        Self {
            framing: config.framing,
            strict: config.strict_mode,
        }
    }
}

pub struct PolicyServer {
    session: Arc<Mutex<Session>>,
    store: Arc<PolicyStore>,
    bind_addr: String,
    settings: ConnectionSettings,
}

impl PolicyServer {
    pub fn new(session: Session, store: PolicyStore, config: &ListenConfig) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            store: Arc::new(store),
            bind_addr: config.bind_addr(),
            settings: ConnectionSettings::from(config),
        }
    }

    /// Assemble agents, store and session for `mode`.
    ///
    /// Test mode restores every agent's policy and runs one warm-up
    /// decision; a missing or unreadable policy is fatal.
    pub fn from_config(config: &ServerConfig, mode: RunMode) -> Result<Self> {
        let store = PolicyStore::from_config(&config.output);
        let mut session = Session::from_factory(
            &config.brain,
            mode,
            config.output.saving_frequency,
            |brain| -> Box<dyn Brain> { Box::new(DeepQBrain::from_config(brain)) },
        );

        if !mode.is_training() {
            for agent_id in 0..session.agents().len() {
                if let Some(agent) = session.agent_mut(agent_id) {
                    store.load(agent.brain_mut(), agent_id)?;
                }
            }
            session.warmup()?;
        }

        info!(
            agents = session.agents().len(),
            inputs = config.brain.num_inputs,
            actions = config.brain.network_actions(),
            "Running in {} mode",
            mode
        );
        Ok(Self::new(session, store, &config.server))
    }

    /// Shared session handle
    pub fn session(&self) -> Arc<Mutex<Session>> {
        Arc::clone(&self.session)
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.settings
    }

    /// Bind the configured address and serve until a fatal error or Ctrl-C
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!(
            "Policy server listening on {} (framing: {:?}, strict: {})",
            local, self.settings.framing, self.settings.strict
        );

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ParleyError>(1);

        loop {
            tokio::select! {
                Some(err) = fatal_rx.recv() => {
                    error!("Stopping server: {}", err);
                    return Err(err);
                }

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    info!("Simulator connected from {}", peer);

                    let session = Arc::clone(&self.session);
                    let store = Arc::clone(&self.store);
                    let settings = self.settings;
                    let fatal_tx = fatal_tx.clone();

                    tokio::spawn(async move {
                        match handle_connection(stream, peer, session, store, settings).await {
                            Ok(()) => info!("Simulator {} disconnected", peer),
                            Err(e) if is_fatal(&e, settings.strict) => {
                                error!("Request from {} failed: {}", peer, e);
                                let _ = fatal_tx.send(e).await;
                            }
                            Err(e) => {
                                error!("Closing connection {}: {}", peer, e);
                            }
                        }
                    });
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Socket failures only ever end their own connection
fn is_fatal(err: &ParleyError, strict: bool) -> bool {
    strict && !matches!(err, ParleyError::Io(_))
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    session: Arc<Mutex<Session>>,
    store: Arc<PolicyStore>,
    settings: ConnectionSettings,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(reader, settings.framing);

    while let Some(message) = frames.next_frame().await? {
        let request = decode_bytes(&message)?;

        // Never hold the session across socket IO
        let action = {
            let mut session = session.lock().await;
            let action = session.handle(&request)?;
            session.save(&store);
            action
        };

        writer.write_all(encode_action(action).as_bytes()).await?;
    }

    debug!(peer = %peer, "end of stream");
    Ok(())
}
