//! The simulation the server ticks: a set of worlds full of scheduled block
//! updates, and the players connected to them.
//!
//! Worlds are shared as `Arc<World>` so console commands can look at them,
//! but every mutation reaches a world through the tick loop, either from a
//! phase or from a task submitted to the driver.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use pulse_core::ticks::{DeferredEventQueue, TickPriority};
use pulse_core::{Phase, PhaseContext, Simulation, SuppressedFault};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Most scheduled updates a world applies in one tick.
pub const MAX_UPDATES_PER_TICK: usize = 65_536;
/// Ticks a sleeping player stays in bed.
pub const SLEEP_TICKS: u64 = 100;
/// Final growth stage of a crop.
pub const MAX_GROWTH_STAGE: u8 = 7;

/// A block position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    /// East-west.
    pub x: i32,
    /// Up-down.
    pub y: i32,
    /// North-south.
    pub z: i32,
}

impl BlockPos {
    /// Creates a position.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    const fn east(self) -> Self {
        Self::new(self.x.wrapping_add(1), self.y, self.z)
    }
}

/// A pending change to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockUpdate {
    /// A redstone signal that travels east, losing one power per block.
    Redstone {
        /// Remaining signal strength, 1..=15.
        power: u8,
    },
    /// A crop that grows one stage per update until fully grown.
    Growth {
        /// Current stage.
        stage: u8,
    },
}

impl BlockUpdate {
    /// Ticks between this update and the one it causes.
    #[must_use]
    pub const fn delay(self) -> u32 {
        match self {
            Self::Redstone { .. } => 2,
            Self::Growth { .. } => 20,
        }
    }

    /// Redstone runs before anything else due on the same tick.
    #[must_use]
    pub const fn priority(self) -> TickPriority {
        match self {
            Self::Redstone { .. } => TickPriority::High,
            Self::Growth { .. } => TickPriority::Normal,
        }
    }

    /// The update applying this one causes, and where.
    #[must_use]
    pub fn follow_up(self, pos: BlockPos) -> Option<(BlockPos, Self)> {
        match self {
            Self::Redstone { power } if power > 1 => {
                Some((pos.east(), Self::Redstone { power: power - 1 }))
            }
            Self::Growth { stage } if stage < MAX_GROWTH_STAGE => {
                Some((pos, Self::Growth { stage: stage + 1 }))
            }
            _ => None,
        }
    }
}

/// A pending update as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    /// Where.
    pub pos: BlockPos,
    /// What.
    pub update: BlockUpdate,
    /// When.
    pub trigger_tick: u64,
}

/// A world as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSave {
    /// World name.
    pub name: String,
    /// Last tick the world ran.
    pub ticks: u64,
    /// Block updates applied so far.
    pub applied: u64,
    /// Pending updates in the order they will run.
    pub pending: Vec<PendingUpdate>,
}

struct WorldState {
    ticks: u64,
    applied: u64,
    events: DeferredEventQueue<BlockPos, BlockUpdate>,
}

/// One world.
pub struct World {
    name: String,
    state: Mutex<WorldState>,
}

impl World {
    /// Creates an empty world.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(WorldState {
                ticks: 0,
                applied: 0,
                events: DeferredEventQueue::new(),
            }),
        }
    }

    /// Rebuilds a world from its save, keeping the order of pending updates.
    #[must_use]
    pub fn from_save(save: WorldSave) -> Self {
        let world = Self::new(save.name);
        {
            let mut state = world.state.lock();
            state.ticks = save.ticks;
            state.applied = save.applied;
            for pending in save.pending {
                state.events.schedule(
                    pending.pos,
                    pending.update,
                    pending.trigger_tick,
                    pending.update.priority(),
                );
            }
        }
        world
    }

    /// The world's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last tick this world ran. Pending updates are scheduled against it.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.state.lock().ticks
    }

    /// Block updates applied so far.
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.state.lock().applied
    }

    /// Updates waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Schedules `update` at `pos`, `delay` ticks after `current_tick`.
    ///
    /// Returns `false` if the same update is already pending there.
    pub fn schedule(&self, pos: BlockPos, update: BlockUpdate, current_tick: u64, delay: u32) -> bool {
        self.state
            .lock()
            .events
            .schedule_in(pos, update, current_tick, delay, update.priority())
            .is_some()
    }

    /// Applies every update due at `tick`.
    ///
    /// Past [`MAX_UPDATES_PER_TICK`] the rest is left for the next tick and
    /// a [`SuppressedFault`] is raised so operators hear about it.
    pub fn tick(&self, tick: u64) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.ticks = tick;

        let due = state.events.drain_due_limited(tick, MAX_UPDATES_PER_TICK);
        for event in &due {
            state.applied += 1;
            if let Some((pos, update)) = event.payload.follow_up(event.location) {
                state
                    .events
                    .schedule_in(pos, update, tick, update.delay(), update.priority());
            }
        }

        if state.events.peek_next_tick().is_some_and(|next| next <= tick) {
            return Err(SuppressedFault::new(format!(
                "more than {MAX_UPDATES_PER_TICK} block updates due in '{}' at tick {tick}",
                self.name
            ))
            .into());
        }
        Ok(())
    }

    /// Captures the world for saving.
    #[must_use]
    pub fn save(&self) -> WorldSave {
        let state = self.state.lock();
        WorldSave {
            name: self.name.clone(),
            ticks: state.ticks,
            applied: state.applied,
            pending: state
                .events
                .iter()
                .map(|event| PendingUpdate {
                    pos: event.location,
                    update: event.payload,
                    trigger_tick: event.trigger_tick,
                })
                .collect(),
        }
    }
}

/// A connected player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Player {
    /// Player name.
    pub name: String,
    /// Tick the player went to bed, if asleep.
    pub asleep_since: Option<u64>,
}

/// Connected players by name.
pub type Players = RwLock<FxHashMap<String, Player>>;

/// Read access to the realm for code outside the tick loop.
#[derive(Clone)]
pub struct RealmView {
    /// Every world, in tick order.
    pub worlds: Vec<Arc<World>>,
    /// Connected players.
    pub players: Arc<Players>,
}

impl RealmView {
    /// Looks up a world by name.
    #[must_use]
    pub fn world(&self, name: &str) -> Option<&Arc<World>> {
        self.worlds.iter().find(|world| world.name() == name)
    }
}

/// All worlds and players, owned by the tick loop.
pub struct Realm {
    worlds: Vec<Arc<World>>,
    players: Arc<Players>,
    data_dir: PathBuf,
}

impl Realm {
    /// Creates a realm from worlds already in memory.
    pub fn new(worlds: Vec<World>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            worlds: worlds.into_iter().map(Arc::new).collect(),
            players: Arc::new(RwLock::new(FxHashMap::default())),
            data_dir: data_dir.into(),
        }
    }

    /// Loads `names` from `data_dir`, creating worlds that have no save yet.
    pub fn load(names: &[String], data_dir: &Path) -> anyhow::Result<Self> {
        let mut worlds = Vec::with_capacity(names.len());
        for name in names {
            let path = save_path(data_dir, name);
            let world = if path.exists() {
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let save: WorldSave = serde_json::from_str(&contents)
                    .with_context(|| format!("parsing {}", path.display()))?;
                log::info!(
                    "Loaded world '{name}' at tick {} with {} pending update(s)",
                    save.ticks,
                    save.pending.len()
                );
                World::from_save(save)
            } else {
                log::info!("Creating world '{name}'");
                World::new(name.clone())
            };
            worlds.push(world);
        }
        Ok(Self::new(worlds, data_dir))
    }

    /// The tick a driver should resume from: the latest tick any world ran.
    #[must_use]
    pub fn resume_tick(&self) -> u64 {
        self.worlds.iter().map(|world| world.ticks()).max().unwrap_or(0)
    }

    /// The phases every tick runs, in order.
    #[must_use]
    pub fn phases() -> Vec<Phase<Self>> {
        vec![
            Phase::per_unit("tick world", |realm: &mut Self, ctx| {
                let world = ctx
                    .unit
                    .and_then(|index| realm.worlds.get(index))
                    .context("world phase invoked without a world")?;
                world.tick(ctx.tick)
            }),
            Phase::server("player bookkeeping", |realm: &mut Self, ctx| {
                realm.wake_players(ctx);
                Ok(())
            }),
        ]
    }

    /// A cloneable view for the console and other threads.
    #[must_use]
    pub fn view(&self) -> RealmView {
        RealmView {
            worlds: self.worlds.clone(),
            players: Arc::clone(&self.players),
        }
    }

    fn wake_players(&self, ctx: &PhaseContext) {
        for player in self.players.write().values_mut() {
            if let Some(since) = player.asleep_since
                && ctx.tick.saturating_sub(since) >= SLEEP_TICKS
            {
                player.asleep_since = None;
                log::info!("{} woke up", player.name);
            }
        }
    }

    fn save_world(&self, world: &World, flush: bool) -> anyhow::Result<()> {
        let path = save_path(&self.data_dir, world.name());
        let temp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(&world.save())?;

        let mut file =
            File::create(&temp).with_context(|| format!("creating {}", temp.display()))?;
        file.write_all(&contents)
            .with_context(|| format!("writing {}", temp.display()))?;
        if flush {
            file.sync_all()
                .with_context(|| format!("flushing {}", temp.display()))?;
        }
        fs::rename(&temp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

fn save_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("{name}.json"))
}

impl Simulation for Realm {
    fn unit_count(&self) -> usize {
        self.worlds.len()
    }

    fn unit_name(&self, index: usize) -> String {
        self.worlds
            .get(index)
            .map_or_else(|| format!("world #{index}"), |world| world.name().to_owned())
    }

    fn fast_forward_eligible(&self) -> bool {
        let players = self.players.read();
        !players.is_empty() && players.values().all(|player| player.asleep_since.is_some())
    }

    fn session_count(&self) -> usize {
        self.players.read().len()
    }

    fn describe_state_for_diagnostics(&self) -> serde_json::Value {
        // Never block while assembling a crash report.
        self.worlds
            .iter()
            .map(|world| match world.state.try_lock() {
                Some(state) => serde_json::json!({
                    "name": world.name(),
                    "ticks": state.ticks,
                    "applied": state.applied,
                    "pending": state.events.len(),
                    "next_update": state.events.peek_next_tick(),
                }),
                None => serde_json::json!({ "name": world.name(), "state": "locked" }),
            })
            .collect()
    }

    fn notify_operators(&mut self, notice: &str) {
        log::warn!("{notice}");
        let players = self.players.read().len();
        if players > 0 {
            log::info!("Notified {players} player(s)");
        }
    }

    fn save_all(&mut self, flush: bool) -> anyhow::Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating {}", self.data_dir.display()))?;
        for world in &self.worlds {
            if flush {
                log::info!("Saving world '{}'", world.name());
            }
            self.save_world(world, flush)
                .with_context(|| format!("saving world '{}'", world.name()))?;
        }
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        let disconnected = self.players.write().drain().count();
        if disconnected > 0 {
            log::info!("Disconnected {disconnected} player(s)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulse_core::{ManualClock, TickConfig, TickDriver};

    use super::*;

    fn driver(realm: Realm, resume: u64) -> TickDriver<Realm, Arc<ManualClock>> {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1000)));
        TickDriver::new(realm, clock, TickConfig::default(), Realm::phases())
            .expect("valid config")
            .starting_at(resume)
    }

    #[test]
    fn test_redstone_signal_travels_and_fades() {
        let world = World::new("overworld");
        assert!(world.schedule(BlockPos::new(0, 64, 0), BlockUpdate::Redstone { power: 3 }, 0, 1));
        assert!(!world.schedule(BlockPos::new(0, 64, 0), BlockUpdate::Redstone { power: 3 }, 0, 1));

        for tick in 1..=10 {
            world.tick(tick).expect("no overload");
        }
        // Power 3 at x=0 on tick 1, power 2 at x=1 on tick 3, power 1 at x=2 on tick 5
        assert_eq!(world.applied(), 3);
        assert_eq!(world.pending(), 0);
        assert_eq!(world.ticks(), 10);
    }

    #[test]
    fn test_growth_reschedules_until_grown() {
        let world = World::new("overworld");
        world.schedule(BlockPos::new(4, 70, 4), BlockUpdate::Growth { stage: 5 }, 0, 1);

        world.tick(1).expect("no overload");
        let save = world.save();
        assert_eq!(
            save.pending,
            vec![PendingUpdate {
                pos: BlockPos::new(4, 70, 4),
                update: BlockUpdate::Growth { stage: 6 },
                trigger_tick: 21,
            }]
        );

        world.tick(21).expect("no overload");
        world.tick(41).expect("no overload");
        assert_eq!(world.applied(), 3);
        assert_eq!(world.pending(), 0);
    }

    #[test]
    fn test_overload_is_suppressed_and_deferred() {
        let world = World::new("nether");
        for x in 0..=i32::try_from(MAX_UPDATES_PER_TICK).expect("fits") {
            world.schedule(BlockPos::new(x, 0, 0), BlockUpdate::Growth { stage: MAX_GROWTH_STAGE }, 0, 1);
        }

        let err = world.tick(1).expect_err("too many updates");
        assert!(err.is::<SuppressedFault>());
        assert_eq!(world.pending(), 1);

        world.tick(2).expect("leftover fits");
        assert_eq!(world.pending(), 0);
    }

    #[test]
    fn test_save_round_trip_keeps_order() {
        let world = World::new("end");
        world.schedule(BlockPos::new(0, 0, 0), BlockUpdate::Growth { stage: 0 }, 0, 5);
        world.schedule(BlockPos::new(1, 0, 0), BlockUpdate::Redstone { power: 9 }, 0, 5);
        world.schedule(BlockPos::new(2, 0, 0), BlockUpdate::Growth { stage: 0 }, 0, 3);

        let save = world.save();
        let restored = World::from_save(save.clone()).save();
        assert_eq!(restored, save);
        // Redstone outranks growth on the same tick
        assert_eq!(save.pending[1].update, BlockUpdate::Redstone { power: 9 });
    }

    #[test]
    fn test_realm_saves_and_loads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let names = vec!["overworld".to_owned(), "nether".to_owned()];

        let mut realm = Realm::load(&names, dir.path()).expect("fresh realm");
        realm.view().worlds[1].schedule(BlockPos::new(1, 2, 3), BlockUpdate::Redstone { power: 15 }, 0, 4);
        realm.save_all(true).expect("saved");
        assert!(dir.path().join("nether.json").exists());

        let loaded = Realm::load(&names, dir.path()).expect("saved realm");
        let view = loaded.view();
        assert_eq!(view.world("nether").map(|w| w.pending()), Some(1));
        assert_eq!(view.world("overworld").map(|w| w.pending()), Some(0));
    }

    #[test]
    fn test_reloaded_updates_fire_on_time_after_restart() {
        let dir = tempfile::tempdir().expect("temp dir");
        let names = vec!["overworld".to_owned()];
        let pos = BlockPos::new(8, 64, 8);

        let mut first = driver(Realm::load(&names, dir.path()).expect("fresh realm"), 999);
        // The first cycle only sleeps, the second runs tick 1000
        first.cycle().expect("no fault");
        first.cycle().expect("no fault");
        assert_eq!(first.tick_count(), 1000);

        let world = Arc::clone(&first.simulation().view().worlds[0]);
        assert!(world.schedule(pos, BlockUpdate::Growth { stage: MAX_GROWTH_STAGE }, 1000, 1));
        first.simulation_mut().save_all(true).expect("saved");
        drop(first);

        let realm = Realm::load(&names, dir.path()).expect("saved realm");
        assert_eq!(realm.resume_tick(), 1000);
        let view = realm.view();
        let mut second = driver(realm, 1000);
        for _ in 0..6 {
            second.cycle().expect("no fault");
        }

        assert_eq!(second.tick_count(), 1005);
        assert_eq!(view.worlds[0].pending(), 0);
        assert_eq!(view.worlds[0].applied(), 1);
        assert_eq!(view.worlds[0].ticks(), 1005);
    }

    #[test]
    fn test_resume_tick_is_the_latest_world_tick() {
        let realm = Realm::new(vec![World::new("overworld"), World::new("nether")], "unused");
        assert_eq!(realm.resume_tick(), 0);

        realm.view().worlds[1].tick(42).expect("no overload");
        assert_eq!(realm.resume_tick(), 42);
    }

    #[test]
    fn test_fast_forward_needs_everyone_asleep() {
        let mut realm = Realm::new(vec![World::new("overworld")], "unused");
        assert!(!realm.fast_forward_eligible());

        realm.players.write().insert(
            "alex".to_owned(),
            Player {
                name: "alex".to_owned(),
                asleep_since: Some(10),
            },
        );
        assert!(realm.fast_forward_eligible());
        assert_eq!(realm.session_count(), 1);

        realm.wake_players(&PhaseContext {
            tick: 10 + SLEEP_TICKS,
            unit: None,
        });
        assert!(!realm.fast_forward_eligible());

        realm.release().expect("release never fails");
        assert_eq!(realm.session_count(), 0);
    }
}
