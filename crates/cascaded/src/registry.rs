//! Session registry — maps payload paths to live sessions.
//!
//! A session is created on the first admitted receiver of a payload and
//! owns one scheduler task, one multicast port (`start_port +
//! session_id`), and one send socket. The registry enforces the session
//! cap; the per-session receiver cap is the scheduler's call. Ended
//! sessions deregister themselves, freeing the path and the id slot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};

use cascade_core::block::derive_block_size;
use cascade_core::config::ServerConfig;
use cascade_core::error::TransferError;
use cascade_core::fileset::DiskFileSet;
use cascade_core::group::{DatagramGroup, GroupInterface};
use cascade_core::psk::{PassphraseEncoder, PayloadCipher};

use crate::scheduler::{JoinGrant, SchedulerEvent, WaveScheduler};
use crate::sender::MulticastSender;

/// Scheduler event queue depth per session.
const EVENT_QUEUE: usize = 256;

struct SessionEntry {
    session_id: usize,
    events: mpsc::Sender<SchedulerEvent>,
}

pub struct Registry {
    config: Arc<ServerConfig>,
    cipher: Option<PayloadCipher>,
    sessions: DashMap<String, SessionEntry>,
    ids_in_use: Mutex<HashSet<usize>>,
    shutdown: broadcast::Sender<()>,
}

impl Registry {
    pub fn new(config: Arc<ServerConfig>, shutdown: broadcast::Sender<()>) -> Arc<Self> {
        let cipher = config.passphrase().map(|pass| {
            let encoder = PassphraseEncoder::new(config.passphrase_encoding);
            PayloadCipher::from_passphrase(&encoder, pass)
        });
        Arc::new(Self {
            config,
            cipher,
            sessions: DashMap::new(),
            ids_in_use: Mutex::new(HashSet::new()),
            shutdown,
        })
    }

    pub fn cipher(&self) -> Option<&PayloadCipher> {
        self.cipher.as_ref()
    }

    /// Route a join into the session for `path`, creating the session if
    /// this is its first receiver. Returns the grant together with the
    /// event handle the receiver's control loop keeps using. `Refused`
    /// when limits are hit, `ConfigInvalid`/`FileSet` when the payload
    /// cannot be served.
    pub async fn join(
        self: &Arc<Self>,
        path: &str,
        resume: bool,
    ) -> Result<(JoinGrant, mpsc::Sender<SchedulerEvent>), TransferError> {
        loop {
            let events = match self.sessions.get(path) {
                Some(entry) => entry.events.clone(),
                None => self.create_session(path).await?,
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            let event = SchedulerEvent::Join { resume, reply: reply_tx };
            if events.send(event).await.is_err() {
                // The session ended between lookup and send; retry with
                // a fresh one.
                self.sessions.remove(path);
                continue;
            }
            return match reply_rx.await {
                Ok(Ok(grant)) => Ok((grant, events)),
                Ok(Err(reason)) => Err(TransferError::Refused(reason)),
                Err(_) => {
                    self.sessions.remove(path);
                    continue;
                }
            };
        }
    }

    async fn create_session(
        self: &Arc<Self>,
        path: &str,
    ) -> Result<mpsc::Sender<SchedulerEvent>, TransferError> {
        let session_id = {
            let mut ids = self.ids_in_use.lock().expect("id set poisoned");
            if self.sessions.len() >= self.config.max_sessions {
                return Err(TransferError::Refused(format!(
                    "server at its {}-session limit",
                    self.config.max_sessions
                )));
            }
            let slot = (0..self.config.max_sessions)
                .find(|id| !ids.contains(id))
                .ok_or_else(|| {
                    TransferError::Refused(format!(
                        "server at its {}-session limit",
                        self.config.max_sessions
                    ))
                })?;
            ids.insert(slot);
            slot
        };

        match self.spawn_session(path, session_id).await {
            Ok(events) => Ok(events),
            Err(e) => {
                self.ids_in_use
                    .lock()
                    .expect("id set poisoned")
                    .remove(&session_id);
                Err(e)
            }
        }
    }

    async fn spawn_session(
        self: &Arc<Self>,
        path: &str,
        session_id: usize,
    ) -> Result<mpsc::Sender<SchedulerEvent>, TransferError> {
        let block = derive_block_size(self.config.mtu, self.config.ipv6, self.cipher.as_ref())?;
        let fileset = DiskFileSet::scan(&self.config.root_folder, path, block.usable)?;

        let port = self.config.multicast_start_port + session_id as u16;
        let interface = if self.config.interface_name.is_empty() {
            GroupInterface::default()
        } else {
            GroupInterface::named(self.config.interface_name.clone())
        };
        let group = DatagramGroup::join(
            self.config.multicast_address,
            port,
            &interface,
            self.config.ttl,
            0,
        )?;
        let sender = MulticastSender::new(Arc::new(group), self.cipher.clone(), block.usable);

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let scheduler = WaveScheduler::new(
            self.config.clone(),
            path.to_string(),
            session_id,
            fileset,
            block,
            port,
            sender,
            events_rx,
            self.shutdown.subscribe(),
        );

        let registry = self.clone();
        let owned_path = path.to_string();
        tokio::spawn(async move {
            scheduler.run().await;
            registry.release(&owned_path, session_id);
        });

        self.sessions.insert(
            path.to_string(),
            SessionEntry { session_id, events: events_tx.clone() },
        );
        tracing::info!(path, session_id, port, "session created");
        Ok(events_tx)
    }

    fn release(&self, path: &str, session_id: usize) {
        self.sessions
            .remove_if(path, |_, entry| entry.session_id == session_id);
        self.ids_in_use
            .lock()
            .expect("id set poisoned")
            .remove(&session_id);
        tracing::info!(path, session_id, "session released");
    }
}
