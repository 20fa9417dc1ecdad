//! Shared relay state: connection registry, fan-out, change-feed bracket.
//!
//! Each connection owns an unbounded outbox drained by a single writer
//! task, so frames from the connection's own command handling and from
//! broadcast never interleave mid-frame on the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tracing::debug;

use crate::event::Event;
use crate::filter::{self, ChangesOptions, Filter};
use crate::kind::KindClass;
use crate::proto::RelayFrame;
use crate::store::{ChangeScan, IngestOutcome, Store};

/// Write half of one client connection plus its subscription state.
pub struct Client {
    outbox: mpsc::UnboundedSender<String>,
    subs: Mutex<HashMap<String, Vec<Filter>>>,
    feeds: Mutex<HashMap<String, ChangesOptions>>,
}

impl Client {
    /// Queue a frame for the connection's writer task.
    ///
    /// Errors are ignored: a closed outbox means the connection is gone
    /// and its registry entry is about to be dropped.
    pub fn send(&self, frame: &RelayFrame) {
        let _ = self.outbox.send(frame.to_json());
    }

    /// Register or replace a filter subscription.
    pub fn set_sub(&self, sub_id: String, filters: Vec<Filter>) {
        self.subs.lock().expect("subs lock").insert(sub_id, filters);
    }

    /// Remove a filter subscription; silent when absent.
    pub fn remove_sub(&self, sub_id: &str) {
        self.subs.lock().expect("subs lock").remove(sub_id);
    }

    /// Remove a change-feed subscription; silent when absent.
    pub fn remove_feed(&self, sub_id: &str) {
        self.feeds.lock().expect("feeds lock").remove(sub_id);
    }
}

/// Process-wide relay state shared by all connection tasks.
pub struct Relay {
    store: Store,
    clients: RwLock<HashMap<u64, Arc<Client>>>,
    next_client: AtomicU64,
    /// Serializes commit + fan-out so change-feed replay can bracket
    /// registration against concurrent publishes.
    publish_lock: Mutex<()>,
}

impl Relay {
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self {
            store,
            clients: RwLock::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            publish_lock: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Add a connection; returns its id, handle, and outbox receiver.
    pub fn register(&self) -> (u64, Arc<Client>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Client {
            outbox: tx,
            subs: Mutex::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
        });
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        self.clients
            .write()
            .expect("client registry lock")
            .insert(id, client.clone());
        debug!(conn = id, "connection registered");
        (id, client, rx)
    }

    /// Drop a connection and all of its subscriptions.
    pub fn unregister(&self, id: u64) {
        self.clients
            .write()
            .expect("client registry lock")
            .remove(&id);
        debug!(conn = id, "connection closed");
    }

    /// Commit an event and fan it out to every interested connection.
    ///
    /// Duplicates and superseded events are acknowledged but not
    /// re-broadcast; ephemeral events are broadcast without a seq.
    pub fn publish(&self, ev: &Event, class: KindClass) -> Result<IngestOutcome> {
        let _bracket = self
            .publish_lock
            .lock()
            .map_err(|_| anyhow!("publish lock poisoned"))?;
        let outcome = self.store.ingest(ev, class)?;
        match outcome {
            IngestOutcome::Stored { seq } => self.fan_out(ev, Some(seq)),
            IngestOutcome::Ephemeral => self.fan_out(ev, None),
            IngestOutcome::Duplicate { .. } | IngestOutcome::Superseded { .. } => {}
        }
        Ok(outcome)
    }

    /// Replay persisted changes for a new feed, then switch it live.
    ///
    /// Runs under the publish lock: the replay covers everything up to
    /// the snapshot, the registration covers everything after, and no
    /// commit can land in between, so each change arrives exactly once
    /// and in seq order.
    pub fn subscribe_changes(
        &self,
        client: &Client,
        sub_id: String,
        opts: ChangesOptions,
    ) -> Result<()> {
        let _bracket = self
            .publish_lock
            .lock()
            .map_err(|_| anyhow!("publish lock poisoned"))?;
        let scan = ChangeScan {
            limit: None,
            kinds: opts.kinds.clone(),
            authors: opts.authors.clone(),
        };
        let (changes, _) = self.store.query_changes(opts.since, &scan)?;
        let last = self.store.last_seq()?;
        for change in changes {
            client.send(&RelayFrame::changes_event(&sub_id, change.seq, change.event));
        }
        client.send(&RelayFrame::changes_eose(&sub_id, last));
        client
            .feeds
            .lock()
            .expect("feeds lock")
            .insert(sub_id, opts);
        Ok(())
    }

    fn fan_out(&self, ev: &Event, seq: Option<i64>) {
        let clients = self.clients.read().expect("client registry lock");
        for client in clients.values() {
            {
                let subs = client.subs.lock().expect("subs lock");
                // at most one EVENT per connection per event: the first
                // matching regular subscription takes the delivery
                for (sub_id, filters) in subs.iter() {
                    if filter::matches_any(ev, filters) {
                        client.send(&RelayFrame::event(sub_id, ev.clone()));
                        break;
                    }
                }
            }
            if let Some(seq) = seq {
                let feeds = client.feeds.lock().expect("feeds lock");
                for (sub_id, opts) in feeds.iter() {
                    if opts.matches(ev) {
                        client.send(&RelayFrame::changes_event(sub_id, seq, ev.clone()));
                    }
                }
            }
        }
    }
}
