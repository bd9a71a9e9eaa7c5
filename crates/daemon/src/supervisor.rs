//! Renderer instances, one per deck.
//!
//! Each deck owns a slot behind an async mutex. Launch, reuse and teardown of a
//! deck all hold its slot, so a deck never has two launches in flight and an
//! instance is never handed out while it is being torn down. The slot map
//! itself is only locked briefly and never across an await.

use crate::deck::DeckId;
use crate::error::Result;
use crate::launcher::{Launcher, RendererProcess};
use crate::registry::PortRegistry;
use chrono::{DateTime, Utc};
use preview_common::InstanceInfo;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Instance {
    process: RendererProcess,
    port: u16,
    last_interaction: DateTime<Utc>,
}

type Slot = Arc<AsyncMutex<Option<Instance>>>;
type SlotGuard = OwnedMutexGuard<Option<Instance>>;

pub struct Supervisor {
    registry: PortRegistry,
    launcher: Launcher,
    deck_dir: PathBuf,
    idle_timeout: Duration,
    slots: Mutex<HashMap<DeckId, Slot>>,
}

impl Supervisor {
    pub fn new(registry: PortRegistry, launcher: Launcher, deck_dir: PathBuf, idle_timeout: Duration) -> Self {
        Self {
            registry,
            launcher,
            deck_dir,
            idle_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    pub fn deck_dir(&self) -> &Path {
        &self.deck_dir
    }

    /// Write the deck source and make sure a renderer serves it. Returns the port.
    ///
    /// A running renderer is reused and its idle clock reset. Otherwise a port is
    /// leased and a renderer launched; if that fails the port is released and no
    /// instance is left behind.
    pub async fn ensure(&self, deck: &DeckId, markdown: &str) -> Result<u16> {
        let (slot, mut guard) = self.lock_slot(deck).await;
        let result = self.ensure_locked(deck, markdown, &mut guard).await;
        if guard.is_none() {
            self.remove_slot(deck, &slot);
        }
        result
    }

    async fn ensure_locked(&self, deck: &DeckId, markdown: &str, guard: &mut SlotGuard) -> Result<u16> {
        let path = deck.artifact_path(&self.deck_dir);
        tokio::fs::create_dir_all(&self.deck_dir).await?;
        tokio::fs::write(&path, markdown).await?;
        debug!(%deck, path = %path.display(), "wrote deck source");

        if let Some(instance) = guard.as_mut() {
            if !instance.process.has_exited() {
                instance.last_interaction = Utc::now();
                info!(%deck, port = instance.port, "reusing running renderer");
                return Ok(instance.port);
            }
        }
        if let Some(dead) = guard.take() {
            warn!(%deck, port = dead.port, "renderer exited on its own, relaunching");
            self.dispose(deck, dead).await;
        }

        let port = self.registry.allocate(deck).await?;
        match self.launcher.spawn(deck, &path, port).await {
            Ok(process) => {
                **guard = Some(Instance {
                    process,
                    port,
                    last_interaction: Utc::now(),
                });
                Ok(port)
            }
            Err(e) => {
                error!(%deck, port, "renderer launch failed: {}", e);
                self.release_port(port).await;
                self.remove_artifact(deck).await;
                Err(e)
            }
        }
    }

    /// Tear down the renderer for `deck`. Returns `false` if none was running.
    pub async fn stop(&self, deck: &DeckId) -> bool {
        let Some((slot, mut guard)) = self.lock_existing(deck).await else {
            debug!(%deck, "stop requested for deck with no renderer");
            return false;
        };
        self.teardown_locked(deck, &slot, &mut guard).await
    }

    /// Tear down instances idle for longer than the idle timeout, and any whose
    /// renderer has died. Returns how many were removed.
    ///
    /// Decks that are busy (launching, being reused or stopped) are skipped; the
    /// idle check runs under the deck's lock, so a request that refreshed the
    /// timestamp first keeps its instance.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        for (deck, slot) in self.snapshot_slots() {
            let Ok(mut guard) = slot.clone().try_lock_owned() else {
                continue;
            };
            if !self.is_current(&deck, &slot) {
                continue;
            }
            let reason = match guard.as_mut() {
                None => continue,
                Some(instance) => {
                    if instance.process.has_exited() {
                        "renderer exited"
                    } else if self.is_idle(instance.last_interaction, now) {
                        "idle timeout"
                    } else {
                        continue;
                    }
                }
            };
            info!(%deck, reason, "evicting renderer");
            if self.teardown_locked(&deck, &slot, &mut guard).await {
                evicted += 1;
            }
        }
        evicted
    }

    /// Sweep for idle instances every `period` until `shutdown` fires.
    pub async fn run_reaper(&self, period: Duration, shutdown: CancellationToken) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = self.evict_idle(Utc::now()).await;
                    if evicted > 0 {
                        info!("Evicted {} idle renderer(s)", evicted);
                    }
                }
            }
        }
        debug!("reaper stopped");
    }

    /// Tear down every instance. Returns how many were running.
    pub async fn shutdown(&self) -> usize {
        let mut stopped = 0;
        for (deck, _) in self.snapshot_slots() {
            if self.stop(&deck).await {
                stopped += 1;
            }
        }
        info!("Shut down {} renderer(s)", stopped);
        stopped
    }

    /// Running instances, by deck. A deck whose slot is busy right now (being
    /// launched, reused, stopped or swept) is left out of this snapshot.
    pub fn instances(&self) -> Vec<InstanceInfo> {
        let mut out: Vec<InstanceInfo> = self
            .snapshot_slots()
            .into_iter()
            .filter_map(|(deck, slot)| {
                let guard = slot.try_lock().ok()?;
                let instance = guard.as_ref()?;
                Some(InstanceInfo {
                    deck: deck.to_string(),
                    port: instance.port,
                    pid: instance.process.pid(),
                    last_interaction: instance.last_interaction,
                })
            })
            .collect();
        out.sort_by(|a, b| a.deck.cmp(&b.deck));
        out
    }

    fn is_idle(&self, last_interaction: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(last_interaction)
            .to_std()
            .is_ok_and(|idle| idle > self.idle_timeout)
    }

    async fn teardown_locked(&self, deck: &DeckId, slot: &Slot, guard: &mut SlotGuard) -> bool {
        let torn_down = match guard.take() {
            Some(instance) => {
                let port = instance.port;
                self.dispose(deck, instance).await;
                self.remove_artifact(deck).await;
                info!(%deck, port, "cleaned up renderer");
                true
            }
            None => false,
        };
        self.remove_slot(deck, slot);
        torn_down
    }

    /// Kill the renderer and give its port back.
    async fn dispose(&self, deck: &DeckId, mut instance: Instance) {
        if let Err(e) = instance.process.kill().await {
            warn!(%deck, "failed to kill renderer: {}", e);
        }
        self.release_port(instance.port).await;
    }

    async fn release_port(&self, port: u16) {
        if let Err(e) = self.registry.release(port).await {
            warn!("{}", e);
        }
    }

    async fn remove_artifact(&self, deck: &DeckId) {
        let path = deck.artifact_path(&self.deck_dir);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(%deck, "removed deck source"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(%deck, path = %path.display(), "failed to remove deck source: {}", e),
        }
    }

    fn slot_map(&self) -> std::sync::MutexGuard<'_, HashMap<DeckId, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot_slots(&self) -> Vec<(DeckId, Slot)> {
        self.slot_map()
            .iter()
            .map(|(deck, slot)| (deck.clone(), slot.clone()))
            .collect()
    }

    fn is_current(&self, deck: &DeckId, slot: &Slot) -> bool {
        self.slot_map()
            .get(deck)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn remove_slot(&self, deck: &DeckId, slot: &Slot) {
        let mut slots = self.slot_map();
        if slots.get(deck).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(deck);
        }
    }

    /// Lock the deck's slot, creating it if needed.
    async fn lock_slot(&self, deck: &DeckId) -> (Slot, SlotGuard) {
        loop {
            let slot = self.slot_map().entry(deck.clone()).or_default().clone();
            let guard = slot.clone().lock_owned().await;
            // The slot may have been retired while we waited.
            if self.is_current(deck, &slot) {
                return (slot, guard);
            }
        }
    }

    async fn lock_existing(&self, deck: &DeckId) -> Option<(Slot, SlotGuard)> {
        loop {
            let slot = self.slot_map().get(deck).cloned()?;
            let guard = slot.clone().lock_owned().await;
            if self.is_current(deck, &slot) {
                return Some((slot, guard));
            }
        }
    }

    #[cfg(test)]
    async fn set_last_interaction(&self, deck: &DeckId, at: DateTime<Utc>) {
        if let Some((_, mut guard)) = self.lock_existing(deck).await {
            if let Some(instance) = guard.as_mut() {
                instance.last_interaction = at;
            }
        }
    }
}
