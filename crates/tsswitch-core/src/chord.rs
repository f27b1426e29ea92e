use crate::config::HotkeySettings;
use crate::types::{Key, KeyAction, KeyEdge, KeyEvent};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ChordConfig {
    pub trigger: Key,
    pub confirm: Key,
    pub probe_modifier: Key,
    pub window: Duration,
    pub probe_debounce: Duration,
}

impl From<&HotkeySettings> for ChordConfig {
    fn from(s: &HotkeySettings) -> Self {
        Self {
            trigger: s.trigger,
            confirm: s.confirm,
            probe_modifier: s.probe_modifier,
            window: s.chord_window(),
            probe_debounce: s.probe_debounce(),
        }
    }
}

impl Default for ChordConfig {
    fn default() -> Self {
        Self::from(&HotkeySettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The foreground layout is not the target input method.
    LayoutNotTarget,
}

/// Side effects the runtime has to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChordEffect {
    ArmTimeout { generation: u64, after: Duration },
    CancelTimeout,
    Toggle,
    Probe,
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChordOutput {
    pub action: KeyAction,
    pub effects: Vec<ChordEffect>,
}

impl ChordOutput {
    fn pass(effects: Vec<ChordEffect>) -> Self {
        Self {
            action: KeyAction::Pass,
            effects,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChordPhase {
    Idle,
    AwaitingConfirmation { generation: u64 },
}

#[derive(Debug)]
pub struct ChordState {
    taps: VecDeque<Instant>,
    phase: ChordPhase,
    held: HashSet<Key>,
    swallow_up: Option<Key>,
    last_probe: Option<Instant>,
    generation: u64,
}

impl Default for ChordState {
    fn default() -> Self {
        Self {
            taps: VecDeque::with_capacity(4),
            phase: ChordPhase::Idle,
            held: HashSet::new(),
            swallow_up: None,
            last_probe: None,
            generation: 0,
        }
    }
}

/// Recognizes trigger, trigger, confirm within the chord window, plus the
/// trigger + probe-modifier hold.
#[derive(Debug)]
pub struct HotkeyChordDetector {
    config: ChordConfig,
    state: ChordState,
}

impl HotkeyChordDetector {
    pub fn new(config: ChordConfig) -> Self {
        Self {
            config,
            state: ChordState::default(),
        }
    }

    pub fn phase(&self) -> ChordPhase {
        self.state.phase
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self.state.phase, ChordPhase::AwaitingConfirmation { .. })
    }

    pub fn pending_taps(&self) -> usize {
        self.state.taps.len()
    }

    /// `gate` is only consulted when a double tap completes.
    pub fn on_event(
        &mut self,
        event: KeyEvent,
        t: Instant,
        gate: impl FnOnce() -> bool,
    ) -> ChordOutput {
        let key = event.key;
        if event.edge == KeyEdge::Up {
            self.state.held.remove(&key);
            if self.state.swallow_up == Some(key) {
                self.state.swallow_up = None;
                return ChordOutput {
                    action: KeyAction::Block,
                    effects: Vec::new(),
                };
            }
            return ChordOutput::pass(Vec::new());
        }

        let repeat = !self.state.held.insert(key);
        let mut effects = Vec::new();

        if !repeat && self.probe_held(key) {
            let due = self
                .state
                .last_probe
                .map_or(true, |p| t.saturating_duration_since(p) >= self.config.probe_debounce);
            if due {
                self.state.last_probe = Some(t);
                effects.push(ChordEffect::Probe);
            }
        }

        if key == self.config.trigger {
            if !repeat {
                self.on_trigger(t, gate, &mut effects);
            }
            return ChordOutput::pass(effects);
        }

        if key == self.config.confirm && self.is_awaiting() {
            debug!("Chord confirmed by {}", key);
            self.state.phase = ChordPhase::Idle;
            self.state.taps.clear();
            self.state.swallow_up = Some(key);
            effects.push(ChordEffect::CancelTimeout);
            effects.push(ChordEffect::Toggle);
            return ChordOutput {
                action: KeyAction::Block,
                effects,
            };
        }

        if !self.state.taps.is_empty() || self.is_awaiting() {
            debug!("Chord reset by {}", key);
            self.state.taps.clear();
            if self.is_awaiting() {
                self.state.phase = ChordPhase::Idle;
                effects.push(ChordEffect::CancelTimeout);
            }
        }
        ChordOutput::pass(effects)
    }

    /// Returns true if this expiry ended a pending confirmation.
    pub fn on_timeout(&mut self, generation: u64) -> bool {
        match self.state.phase {
            ChordPhase::AwaitingConfirmation { generation: g } if g == generation => {
                debug!("Chord confirmation timed out");
                self.state.phase = ChordPhase::Idle;
                true
            }
            _ => false,
        }
    }

    fn probe_held(&self, key: Key) -> bool {
        let (trigger, modifier) = (self.config.trigger, self.config.probe_modifier);
        (key == trigger || key == modifier)
            && self.state.held.contains(&trigger)
            && self.state.held.contains(&modifier)
    }

    fn on_trigger(&mut self, t: Instant, gate: impl FnOnce() -> bool, effects: &mut Vec<ChordEffect>) {
        let window = self.config.window;
        self.state.taps.push_back(t);
        self.state
            .taps
            .retain(|&tap| t.saturating_duration_since(tap) <= window);

        if self.state.taps.len() < 2 {
            return;
        }
        self.state.taps.clear();

        if gate() {
            if self.is_awaiting() {
                effects.push(ChordEffect::CancelTimeout);
            }
            self.state.generation += 1;
            let generation = self.state.generation;
            self.state.phase = ChordPhase::AwaitingConfirmation { generation };
            debug!("Double {} seen, awaiting {}", self.config.trigger, self.config.confirm);
            effects.push(ChordEffect::ArmTimeout {
                generation,
                after: window,
            });
        } else {
            if self.is_awaiting() {
                self.state.phase = ChordPhase::Idle;
                effects.push(ChordEffect::CancelTimeout);
            }
            effects.push(ChordEffect::Dropped(DropReason::LayoutNotTarget));
        }
    }
}
