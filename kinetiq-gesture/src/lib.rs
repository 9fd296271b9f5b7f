//! Gesture recognition over skeleton snapshots.
//! A gesture is made of components, each one is a pair of joints
//! that must first satisfy a begin relationship and later an end
//! relationship. Every tracked person gets its own copy of the state
//! of every gesture, the manager picks the best completed gesture
//! across all persons and releases it once per debounce window.

use glam::Vec3;
use kinetiq_common::{JointId, Skeleton, TrackingId};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    fs,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

pub type GestureId = String;

#[derive(thiserror::Error, Debug)]
pub enum GestureError {
    #[error("unable to read gesture definitions: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse gesture definitions: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("gesture `{0}` has no components")]
    Empty(GestureId),
    #[error("gesture `{0}` is defined more than once")]
    Duplicated(GestureId),
}

/// Qualitative position of the first joint with respect to the second one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    /// Always satisfied
    #[default]
    None,
    Above,
    Below,
    LeftOf,
    RightOf,
    AboveAndLeft,
    AboveAndRight,
    BelowAndLeft,
    BelowAndRight,
}

impl Relationship {
    pub fn holds(&self, first: Vec3, second: Vec3) -> bool {
        let above = first.y > second.y;
        let below = first.y < second.y;
        let left = first.x < second.x;
        let right = first.x > second.x;

        match self {
            Relationship::None => true,
            Relationship::Above => above,
            Relationship::Below => below,
            Relationship::LeftOf => left,
            Relationship::RightOf => right,
            Relationship::AboveAndLeft => above && left,
            Relationship::AboveAndRight => above && right,
            Relationship::BelowAndLeft => below && left,
            Relationship::BelowAndRight => below && right,
        }
    }
}

/// Pair of joints that must move from the begin to the end relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GestureComponent {
    pub first: JointId,
    pub second: JointId,
    #[serde(default)]
    pub begin: Relationship,
    #[serde(default)]
    pub end: Relationship,
}

impl GestureComponent {
    fn begin_holds(&self, skeleton: &Skeleton) -> bool {
        self.begin
            .holds(skeleton.joint(self.first), skeleton.joint(self.second))
    }

    fn end_holds(&self, skeleton: &Skeleton) -> bool {
        self.end
            .holds(skeleton.joint(self.first), skeleton.joint(self.second))
    }
}

/// Immutable gesture definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gesture {
    /// Unique name
    pub id: GestureId,
    #[serde(default)]
    pub description: String,
    /// Maximum time between the start and the end of the gesture, 0 is unbounded
    #[serde(default)]
    pub max_execution_time_ms: u64,
    /// Notification target fired when the gesture is recognized
    pub url: String,
    pub components: Vec<GestureComponent>,
}

impl Gesture {
    pub fn max_execution_time(&self) -> Option<Duration> {
        match self.max_execution_time_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// More components ranks higher, equal sizes favor the lowest id
    pub fn rank(&self, other: &Gesture) -> Ordering {
        self.components
            .len()
            .cmp(&other.components.len())
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Collection of gestures loaded at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GestureSet {
    pub gestures: Vec<Gesture>,
}

impl GestureSet {
    pub fn from_file<P: AsRef<Path>>(filepath: P) -> Result<Self, GestureError> {
        let string = fs::read_to_string(filepath.as_ref())?;
        Self::from_str(string)
    }

    pub fn from_str<S: AsRef<str>>(string: S) -> Result<Self, GestureError> {
        let set = serde_json::from_str::<Self>(string.as_ref())?;
        set.validate()?;
        Ok(set)
    }

    fn validate(&self) -> Result<(), GestureError> {
        let mut ids = HashSet::new();
        for gesture in &self.gestures {
            if gesture.components.is_empty() {
                return Err(GestureError::Empty(gesture.id.clone()));
            }
            if !ids.insert(gesture.id.as_str()) {
                return Err(GestureError::Duplicated(gesture.id.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Began,
    Completed,
}

/// Progress of a single component, flags are sticky until reset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentState {
    pub is_begin: bool,
    pub is_ending: bool,
}

impl ComponentState {
    pub fn reset(&mut self) {
        self.is_begin = false;
        self.is_ending = false;
    }

    pub fn phase(&self) -> Phase {
        match (self.is_begin, self.is_ending) {
            (true, true) => Phase::Completed,
            (true, false) => Phase::Began,
            _ => Phase::Idle,
        }
    }

    /// Advance at most one step, a missing end relationship completes together with the begin
    pub fn evaluate(&mut self, component: &GestureComponent, skeleton: &Skeleton) {
        if !self.is_begin {
            if component.begin_holds(skeleton) {
                self.is_begin = true;
                self.is_ending = component.end == Relationship::None;
            }
        } else if !self.is_ending {
            self.is_ending = component.end_holds(skeleton);
        }
    }
}

/// Outcome of one evaluation of a gesture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Not every component has begun yet
    Pending,
    /// Every component has begun, the execution clock is running
    Executing,
    /// Execution took longer than allowed, the state was reset
    TimedOut,
    /// Every component reached its end relationship
    Completed,
}

/// State of one gesture for one person
#[derive(Debug, Clone)]
pub struct GestureState {
    gesture: Arc<Gesture>,
    components: Vec<ComponentState>,
    is_executing: bool,
    begin_execution_time: Option<Instant>,
}

impl GestureState {
    pub fn new(gesture: Arc<Gesture>) -> Self {
        let components = vec![ComponentState::default(); gesture.components.len()];
        Self {
            gesture,
            components,
            is_executing: false,
            begin_execution_time: None,
        }
    }

    pub fn gesture(&self) -> &Arc<Gesture> {
        &self.gesture
    }

    pub fn components(&self) -> &[ComponentState] {
        &self.components
    }

    pub fn is_executing(&self) -> bool {
        self.is_executing
    }

    pub fn reset(&mut self) {
        self.components.iter_mut().for_each(ComponentState::reset);
        self.is_executing = false;
        self.begin_execution_time = None;
    }

    pub fn evaluate(&mut self, skeleton: &Skeleton, now: Instant) -> Progress {
        if let (true, Some(max), Some(begin)) = (
            self.is_executing,
            self.gesture.max_execution_time(),
            self.begin_execution_time,
        ) {
            if now.saturating_duration_since(begin) > max {
                tracing::trace!(gesture = %self.gesture.id, "gesture timed out");
                self.reset();
                return Progress::TimedOut;
            }
        }

        for (state, component) in self.components.iter_mut().zip(&self.gesture.components) {
            state.evaluate(component, skeleton);
        }

        let total = self.components.len();
        let inflight = self.components.iter().filter(|c| c.is_begin).count();
        let complete = self.components.iter().filter(|c| c.is_ending).count();

        if complete >= total && self.is_executing {
            self.reset();
            Progress::Completed
        } else if inflight >= total && !self.is_executing {
            self.is_executing = true;
            self.begin_execution_time = Some(now);
            Progress::Executing
        } else if self.is_executing {
            Progress::Executing
        } else {
            Progress::Pending
        }
    }
}

/// Gesture states of one tracked person
#[derive(Debug, Clone)]
pub struct UserGestures {
    tracking_id: TrackingId,
    states: Vec<GestureState>,
    last_completion_time: Option<Instant>,
}

impl UserGestures {
    pub fn new(tracking_id: TrackingId, gestures: &[Arc<Gesture>]) -> Self {
        Self {
            tracking_id,
            states: gestures.iter().cloned().map(GestureState::new).collect(),
            last_completion_time: None,
        }
    }

    pub fn tracking_id(&self) -> TrackingId {
        self.tracking_id
    }

    pub fn states(&self) -> &[GestureState] {
        &self.states
    }

    pub fn last_completion_time(&self) -> Option<Instant> {
        self.last_completion_time
    }

    /// True when no gesture has any progress
    pub fn is_idle(&self) -> bool {
        self.states.iter().all(|s| {
            !s.is_executing() && s.components().iter().all(|c| c.phase() == Phase::Idle)
        })
    }

    pub fn reset(&mut self) {
        self.states.iter_mut().for_each(GestureState::reset);
    }

    /// Evaluate every gesture, returns the best one completed by this skeleton
    pub fn evaluate(&mut self, skeleton: &Skeleton, now: Instant) -> Option<Arc<Gesture>> {
        let mut best: Option<Arc<Gesture>> = None;
        for state in &mut self.states {
            if state.evaluate(skeleton, now) != Progress::Completed {
                continue;
            }

            let candidate = state.gesture().clone();
            best = match best {
                Some(current) if current.rank(&candidate) == Ordering::Greater => Some(current),
                _ => Some(candidate),
            };
        }

        if best.is_some() {
            self.last_completion_time = Some(now);
        }
        best
    }
}

/// A completed gesture and the person who performed it
#[derive(Debug, Clone)]
pub struct GestureMatch {
    pub gesture: Arc<Gesture>,
    pub tracking_id: TrackingId,
    pub completed_at: Instant,
}

/// Tracks every person in view and debounces completed gestures
#[derive(Debug)]
pub struct GestureManager {
    gestures: Vec<Arc<Gesture>>,
    users: HashMap<TrackingId, UserGestures>,
    best: Option<GestureMatch>,
    window: Duration,
    window_start: Option<Instant>,
}

impl GestureManager {
    pub fn new(set: GestureSet, window: Duration) -> Self {
        Self {
            gestures: set.gestures.into_iter().map(Arc::new).collect(),
            users: HashMap::new(),
            best: None,
            window,
            window_start: None,
        }
    }

    pub fn gestures(&self) -> &[Arc<Gesture>] {
        &self.gestures
    }

    pub fn user(&self, tracking_id: TrackingId) -> Option<&UserGestures> {
        self.users.get(&tracking_id)
    }

    pub fn users_count(&self) -> usize {
        self.users.len()
    }

    /// The match that will be released at the end of the current window
    pub fn pending(&self) -> Option<&GestureMatch> {
        self.best.as_ref()
    }

    /// Evaluate all the skeletons of a frame, completed gestures are only stored
    pub fn observe(&mut self, skeletons: &[Skeleton], now: Instant) {
        let present: HashSet<TrackingId> = skeletons
            .iter()
            .filter(|s| s.is_tracked())
            .map(|s| s.tracking_id)
            .collect();

        // Tracking ids are recycled by the sensor
        self.users.retain(|id, _| {
            let keep = present.contains(id);
            if !keep {
                tracing::debug!(tracking_id = id, "user left, dropping gesture state");
            }
            keep
        });

        for skeleton in skeletons.iter().filter(|s| s.is_tracked()) {
            let user = self
                .users
                .entry(skeleton.tracking_id)
                .or_insert_with(|| UserGestures::new(skeleton.tracking_id, &self.gestures));

            let Some(gesture) = user.evaluate(skeleton, now) else {
                continue;
            };

            tracing::debug!(gesture = %gesture.id, tracking_id = skeleton.tracking_id, "gesture completed");
            let replace = match &self.best {
                Some(current) => gesture.rank(&current.gesture) != Ordering::Less,
                None => true,
            };
            if replace {
                self.best = Some(GestureMatch {
                    gesture,
                    tracking_id: skeleton.tracking_id,
                    completed_at: now,
                });
            }
            self.window_start.get_or_insert(now);
        }
    }

    /// Release the stored match once the debounce window has elapsed
    pub fn flush(&mut self, now: Instant) -> Option<GestureMatch> {
        let start = self.window_start?;
        if now.saturating_duration_since(start) < self.window {
            return None;
        }

        self.window_start = None;
        let best = self.best.take()?;
        if let Some(user) = self.users.get_mut(&best.tracking_id) {
            user.reset();
        }
        Some(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinetiq_common::JOINT_COUNT;

    const HEAD: Vec3 = Vec3::new(0.0, 1.6, 2.0);

    fn skeleton(tracking_id: TrackingId, hand_left: Vec3, hand_right: Vec3) -> Skeleton {
        let mut joints = [Vec3::new(0.0, 1.0, 2.0); JOINT_COUNT];
        joints[JointId::Head.index()] = HEAD;
        joints[JointId::HandLeft.index()] = hand_left;
        joints[JointId::HandRight.index()] = hand_right;
        Skeleton::new(tracking_id, joints)
    }

    fn hands_down(tracking_id: TrackingId) -> Skeleton {
        skeleton(tracking_id, Vec3::new(-0.3, 0.9, 2.0), Vec3::new(0.3, 0.9, 2.0))
    }

    fn right_up(tracking_id: TrackingId) -> Skeleton {
        skeleton(tracking_id, Vec3::new(-0.3, 0.9, 2.0), Vec3::new(0.3, 1.9, 2.0))
    }

    fn left_up(tracking_id: TrackingId) -> Skeleton {
        skeleton(tracking_id, Vec3::new(-0.3, 1.9, 2.0), Vec3::new(0.3, 0.9, 2.0))
    }

    fn component(first: JointId, begin: Relationship, end: Relationship) -> GestureComponent {
        GestureComponent {
            first,
            second: JointId::Head,
            begin,
            end,
        }
    }

    fn vacuous(id: &str, components: usize) -> Gesture {
        Gesture {
            id: id.into(),
            description: String::new(),
            max_execution_time_ms: 0,
            url: format!("http://localhost/{id}"),
            components: (0..components)
                .map(|_| component(JointId::HandRight, Relationship::None, Relationship::None))
                .collect(),
        }
    }

    /// Right hand goes over the head and back down
    fn raise_right(max_execution_time_ms: u64) -> Gesture {
        Gesture {
            id: "raise_right".into(),
            description: "raise and lower the right hand".into(),
            max_execution_time_ms,
            url: "http://localhost/raise".into(),
            components: vec![component(
                JointId::HandRight,
                Relationship::Above,
                Relationship::Below,
            )],
        }
    }

    #[test]
    fn relationships() {
        let a = Vec3::new(-1.0, 1.0, 0.0);
        let b = Vec3::new(0.0, 0.0, 0.0);
        assert!(Relationship::Above.holds(a, b));
        assert!(Relationship::LeftOf.holds(a, b));
        assert!(Relationship::AboveAndLeft.holds(a, b));
        assert!(!Relationship::AboveAndRight.holds(a, b));
        assert!(Relationship::BelowAndRight.holds(b, a));
        assert!(Relationship::None.holds(a, b));
    }

    #[test]
    fn vacuous_component_completes_on_first_evaluation() {
        let component = component(JointId::HandLeft, Relationship::None, Relationship::None);
        let mut state = ComponentState::default();
        assert_eq!(state.phase(), Phase::Idle);
        state.evaluate(&component, &hands_down(1));
        assert_eq!(state.phase(), Phase::Completed);
    }

    #[test]
    fn component_flags_are_sticky() {
        let component = component(JointId::HandRight, Relationship::Above, Relationship::Below);
        let mut state = ComponentState::default();

        state.evaluate(&component, &hands_down(1));
        assert_eq!(state.phase(), Phase::Idle);

        state.evaluate(&component, &right_up(1));
        assert_eq!(state.phase(), Phase::Began);

        // Still above, end not reached but begin is kept
        state.evaluate(&component, &right_up(1));
        assert_eq!(state.phase(), Phase::Began);

        state.evaluate(&component, &hands_down(1));
        assert_eq!(state.phase(), Phase::Completed);

        state.reset();
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[test]
    fn gesture_completes_after_execution_window_opens() {
        let t0 = Instant::now();
        let mut state = GestureState::new(Arc::new(raise_right(0)));

        assert_eq!(state.evaluate(&hands_down(1), t0), Progress::Pending);
        assert_eq!(
            state.evaluate(&right_up(1), t0 + Duration::from_millis(100)),
            Progress::Executing
        );
        assert_eq!(
            state.evaluate(&hands_down(1), t0 + Duration::from_millis(200)),
            Progress::Completed
        );
        assert!(!state.is_executing());
        assert!(state.components().iter().all(|c| c.phase() == Phase::Idle));
    }

    #[test]
    fn gesture_times_out() {
        let t0 = Instant::now();
        let mut state = GestureState::new(Arc::new(raise_right(500)));

        assert_eq!(state.evaluate(&right_up(1), t0), Progress::Executing);
        assert_eq!(
            state.evaluate(&right_up(1), t0 + Duration::from_millis(300)),
            Progress::Executing
        );

        // Lowering the hand too late does not complete the gesture
        assert_eq!(
            state.evaluate(&hands_down(1), t0 + Duration::from_millis(600)),
            Progress::TimedOut
        );
        assert!(!state.is_executing());
        assert!(state.components().iter().all(|c| c.phase() == Phase::Idle));
    }

    #[test]
    fn user_prefers_gesture_with_more_components() {
        let gestures = vec![Arc::new(vacuous("two", 2)), Arc::new(vacuous("three", 3))];
        let mut user = UserGestures::new(4, &gestures);
        let t0 = Instant::now();

        assert!(user.evaluate(&hands_down(4), t0).is_none());
        let best = user
            .evaluate(&hands_down(4), t0 + Duration::from_millis(30))
            .unwrap();
        assert_eq!(best.id, "three");
        assert_eq!(user.last_completion_time(), Some(t0 + Duration::from_millis(30)));
    }

    #[test]
    fn equal_size_tie_favors_lowest_id() {
        for order in [["b", "a"], ["a", "b"]] {
            let gestures: Vec<_> = order.iter().map(|id| Arc::new(vacuous(id, 2))).collect();
            let mut user = UserGestures::new(1, &gestures);
            let t0 = Instant::now();
            user.evaluate(&hands_down(1), t0);
            let best = user.evaluate(&hands_down(1), t0).unwrap();
            assert_eq!(best.id, "a");
        }
    }

    fn two_hand_set() -> GestureSet {
        GestureSet {
            gestures: vec![
                Gesture {
                    components: vec![
                        component(JointId::HandRight, Relationship::Above, Relationship::None),
                        component(JointId::HandLeft, Relationship::None, Relationship::None),
                    ],
                    ..vacuous("right", 0)
                },
                Gesture {
                    components: vec![
                        component(JointId::HandLeft, Relationship::Above, Relationship::None),
                        component(JointId::HandLeft, Relationship::None, Relationship::None),
                        component(JointId::HandRight, Relationship::None, Relationship::None),
                    ],
                    ..vacuous("left", 0)
                },
            ],
        }
    }

    #[test]
    fn manager_fires_once_per_window() {
        let mut manager = GestureManager::new(two_hand_set(), Duration::from_secs(1));
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        manager.observe(&[right_up(1), hands_down(2)], t0);
        manager.observe(&[right_up(1), hands_down(2)], t0 + ms(100));
        assert_eq!(manager.pending().unwrap().gesture.id, "right");

        manager.observe(&[right_up(1), left_up(2)], t0 + ms(200));
        manager.observe(&[right_up(1), left_up(2)], t0 + ms(300));
        let pending = manager.pending().unwrap();
        assert_eq!(pending.gesture.id, "left");
        assert_eq!(pending.tracking_id, 2);

        // Window opened with the first completion at 100ms
        assert!(manager.flush(t0 + ms(600)).is_none());
        let fired = manager.flush(t0 + ms(1100)).unwrap();
        assert_eq!(fired.gesture.id, "left");
        assert_eq!(fired.tracking_id, 2);
        assert_eq!(fired.completed_at, t0 + ms(300));
        assert!(manager.flush(t0 + ms(2500)).is_none());

        // Only the owner of the match is reset
        assert!(manager.user(2).unwrap().is_idle());
        assert!(!manager.user(1).unwrap().is_idle());
    }

    #[test]
    fn manager_without_completion_fires_nothing() {
        let mut manager = GestureManager::new(two_hand_set(), Duration::from_secs(1));
        let t0 = Instant::now();
        manager.observe(&[hands_down(1)], t0);
        assert!(manager.flush(t0 + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn manager_evicts_users_that_left() {
        let mut manager = GestureManager::new(two_hand_set(), Duration::from_secs(1));
        let t0 = Instant::now();

        manager.observe(&[hands_down(1), hands_down(2)], t0);
        assert_eq!(manager.users_count(), 2);

        manager.observe(&[hands_down(2)], t0 + Duration::from_millis(30));
        assert_eq!(manager.users_count(), 1);
        assert!(manager.user(1).is_none());

        let mut untracked = hands_down(3);
        untracked.state = kinetiq_common::TrackingState::PositionOnly;
        manager.observe(&[untracked], t0 + Duration::from_millis(60));
        assert_eq!(manager.users_count(), 0);
    }

    #[test]
    fn parse_gesture_set() {
        let json = r#"{
            "gestures": [{
                "id": "wave",
                "url": "http://localhost/wave",
                "max_execution_time_ms": 1500,
                "components": [
                    { "first": "hand_right", "second": "elbow_right", "begin": "left_of", "end": "right_of" }
                ]
            }]
        }"#;

        let set = GestureSet::from_str(json).unwrap();
        let wave = &set.gestures[0];
        assert_eq!(wave.max_execution_time(), Some(Duration::from_millis(1500)));
        assert_eq!(wave.components[0].first, JointId::HandRight);
        assert_eq!(wave.components[0].end, Relationship::RightOf);
    }

    #[test]
    fn reject_invalid_gesture_set() {
        let empty = r#"{ "gestures": [{ "id": "x", "url": "u", "components": [] }] }"#;
        assert!(matches!(
            GestureSet::from_str(empty),
            Err(GestureError::Empty(id)) if id == "x"
        ));

        let component = r#"{ "first": "head", "second": "spine" }"#;
        let twice = format!(
            r#"{{ "gestures": [{{ "id": "x", "url": "u", "components": [{component}] }}, {{ "id": "x", "url": "u", "components": [{component}] }}] }}"#
        );
        assert!(matches!(
            GestureSet::from_str(twice),
            Err(GestureError::Duplicated(_))
        ));
    }
}
