//! Top-level factory owning every known adapter (spec §4.5, §6 "Exit
//! behavior"). Generalizes a single-adapter discovery helper into a
//! multi-adapter registry, since this crate talks to raw controller
//! indices rather than a single pre-selected session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::adapter::Adapter;
use crate::config::Config;
use crate::error::Error;
use crate::pairing::{NoInputOutputPairingAgent, PairingAgent};
use crate::sock;

/// Owns every known adapter, keyed by controller index, and reacts to
/// controllers appearing/disappearing at runtime.
pub struct Manager {
    config: Config,
    agent: Arc<dyn PairingAgent>,
    key_bin_dir: Option<std::path::PathBuf>,
    adapters: Mutex<HashMap<u16, Arc<Adapter>>>,
    /// Kept open only to host the index-added/removed listeners; each
    /// adapter opens its own transport for its own commands.
    index_watch: Arc<crate::hci::Transport>,
}

impl Manager {
    /// Opens the MGMT control socket, enumerates already-present
    /// controllers, and subscribes to index add/remove events.
    pub fn open(config: Config) -> Result<Arc<Self>, Error> {
        Self::with_agent(config, Arc::new(NoInputOutputPairingAgent), None)
    }

    pub fn with_agent(config: Config, agent: Arc<dyn PairingAgent>, key_bin_dir: Option<std::path::PathBuf>) -> Result<Arc<Self>, Error> {
        let index_watch = crate::hci::Transport::open(config.clone())?;
        let manager = Arc::new(Manager {
            config,
            agent,
            key_bin_dir,
            adapters: Mutex::new(HashMap::new()),
            index_watch: index_watch.clone(),
        });

        for index in read_controller_index_list(&index_watch)? {
            manager.add_adapter(index);
        }

        let added = manager.clone();
        index_watch.add_index_added_listener(move |index| added.add_adapter(index));
        let removed = manager.clone();
        index_watch.add_index_removed_listener(move |index| removed.remove_adapter(index));

        Ok(manager)
    }

    fn add_adapter(&self, index: u16) {
        let mut adapters = self.adapters.lock().unwrap();
        if adapters.contains_key(&index) {
            return;
        }
        match Adapter::open(index, self.config.clone(), self.agent.clone(), self.key_bin_dir.clone()) {
            Ok(adapter) => {
                adapters.insert(index, adapter);
            }
            Err(e) => {
                tracing::warn!(target: "btstack::manager", index, error = %e, "failed to open adapter");
            }
        }
    }

    fn remove_adapter(&self, index: u16) {
        if let Some(adapter) = self.adapters.lock().unwrap().remove(&index) {
            adapter.close();
        }
    }

    pub fn adapter(&self, index: u16) -> Option<Arc<Adapter>> {
        self.adapters.lock().unwrap().get(&index).cloned()
    }

    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.adapters.lock().unwrap().values().cloned().collect()
    }

    /// Orderly shutdown (spec §6 "Exit behavior"): stops every reader and
    /// closes every socket, bounded by `thread_shutdown_timeout` at the
    /// level of each component's own join.
    pub fn shutdown(&self) {
        for adapter in self.adapters.lock().unwrap().drain().map(|(_, a)| a) {
            adapter.close();
        }
        self.index_watch.close();
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_controller_index_list(transport: &crate::hci::Transport) -> Result<Vec<u16>, Error> {
    let frame = crate::pdu::mgmt::command_no_params(crate::pdu::mgmt::opcode::ReadControllerIndexList, sock::HCI_DEV_NONE);
    let reply = transport.command_no_reply_wait(crate::pdu::mgmt::opcode::ReadControllerIndexList, sock::HCI_DEV_NONE, &frame)?;
    Ok(parse_index_list(&reply))
}

fn parse_index_list(bytes: &[u8]) -> Vec<u16> {
    if bytes.len() < 2 {
        return Vec::new();
    }
    let count = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    bytes[2..]
        .chunks_exact(2)
        .take(count)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_index_list_reads_count_prefixed_indices() {
        let bytes = [2, 0, 0, 0, 1, 0];
        assert_eq!(parse_index_list(&bytes), vec![0, 1]);
    }

    #[test]
    fn parse_index_list_truncates_to_declared_count() {
        let bytes = [1, 0, 0, 0, 1, 0];
        assert_eq!(parse_index_list(&bytes), vec![0]);
    }

    #[test]
    fn parse_index_list_handles_short_buffer() {
        assert_eq!(parse_index_list(&[]), Vec::<u16>::new());
        assert_eq!(parse_index_list(&[1]), Vec::<u16>::new());
    }
}
