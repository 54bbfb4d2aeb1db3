use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use num_bigint::BigUint;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_str(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Unique run identifier.
    RunId
);
string_id!(
    /// Unique branch identifier.
    BranchId
);
string_id!(
    /// Shared by sibling branches spawned from the same fork point; used to
    /// recognize siblings when joining parallel splits.
    ProcessId
);
string_id!(
    /// Groups branches belonging to one multi-step subroutine invocation.
    SubroutineInstanceId
);

/// Key for an outstanding deferred decision. Generated deterministically by
/// the `DecisionStrategy` so re-polling is idempotent across resumptions.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DecisionKey(pub String);

impl fmt::Display for DecisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of graph object a location points into.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum GraphObjectType {
    RoutineVersion,
    ProjectVersion,
}

impl fmt::Display for GraphObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoutineVersion => write!(f, "RoutineVersion"),
            Self::ProjectVersion => write!(f, "ProjectVersion"),
        }
    }
}

/// A graph-scoped position: which object, which node.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub object_type: GraphObjectType,
    pub object_id: String,
    pub location_id: String,
}

impl Location {
    pub fn new(
        object_type: GraphObjectType,
        object_id: impl Into<String>,
        location_id: impl Into<String>,
    ) -> Self {
        Self {
            object_type,
            object_id: object_id.into(),
            location_id: location_id.into(),
        }
    }

    /// Whether two locations reference the same root object.
    pub fn same_object(&self, other: &Location) -> bool {
        self.object_type == other.object_type && self.object_id == other.object_id
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}",
            self.object_type, self.object_id, self.location_id
        )
    }
}

/// Ordered path of locations from the outermost routine to the innermost
/// current node. The top of the stack is always the branch's current
/// position; popping occurs only when returning from a nested subroutine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationStack(Vec<Location>);

impl LocationStack {
    pub fn new(root: Location) -> Self {
        Self(vec![root])
    }

    pub fn from_locations(locations: Vec<Location>) -> Self {
        Self(locations)
    }

    /// The branch's current position.
    pub fn current(&self) -> Option<&Location> {
        self.0.last()
    }

    pub fn push(&mut self, location: Location) {
        self.0.push(location);
    }

    pub fn pop(&mut self) -> Option<Location> {
        self.0.pop()
    }

    /// Replace the current position, keeping the rest of the path.
    pub fn replace_current(&mut self, location: Location) {
        if let Some(top) = self.0.last_mut() {
            *top = location;
        } else {
            self.0.push(location);
        }
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn locations(&self) -> &[Location] {
        &self.0
    }
}

/// Run lifecycle states. `Paused`/`Cancelled` are resumable only via a fresh
/// `init_existing_run`; `Completed`/`Failed` are terminal.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Paused => "Paused",
            Self::Cancelled => "Cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Why a run stopped or changed status. Every stopping condition sets one of
/// these; there is no silent failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunStatusChangeReason {
    MaxTime,
    MaxCredits,
    MaxSteps,
    MaxLoops,
    BranchFailure,
    AllBranchesCompleted,
    AllBranchesWaiting,
    StopRequested,
}

impl fmt::Display for RunStatusChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MaxTime => "MaxTime",
            Self::MaxCredits => "MaxCredits",
            Self::MaxSteps => "MaxSteps",
            Self::MaxLoops => "MaxLoops",
            Self::BranchFailure => "BranchFailure",
            Self::AllBranchesCompleted => "AllBranchesCompleted",
            Self::AllBranchesWaiting => "AllBranchesWaiting",
            Self::StopRequested => "StopRequested",
        };
        write!(f, "{}", s)
    }
}

/// Branch lifecycle states.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum BranchStatus {
    Active,
    Waiting,
    Completed,
    Failed,
}

/// What kind of object a run executes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunType {
    RunRoutine,
    RunProject,
}

/// Arbitrary-precision credit amount.
///
/// Serialized as a decimal string, never native floating point, so values
/// survive persistence round-trips without precision loss.
#[derive(Debug, Clone, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Credits(BigUint);

impl Credits {
    pub fn zero() -> Self {
        Self(BigUint::ZERO)
    }

    /// Placeholder estimate for units whose cost is unknown. Large enough to
    /// force sequential mode against any sane budget.
    pub fn unknown_estimate() -> Self {
        Self(BigUint::from(10u64).pow(12))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigUint::ZERO
    }

    pub fn checked_sum<'a>(amounts: impl IntoIterator<Item = &'a Credits>) -> Credits {
        let mut total = BigUint::ZERO;
        for a in amounts {
            total += &a.0;
        }
        Credits(total)
    }
}

impl From<u64> for Credits {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl FromStr for Credits {
    type Err = crate::error::WayfareError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        s.parse::<BigUint>()
            .map(Credits)
            .map_err(|_| crate::error::WayfareError::Config(format!("Invalid credit amount: {s}")))
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<&Credits> for Credits {
    type Output = Credits;

    fn add(self, rhs: &Credits) -> Credits {
        Credits(self.0 + &rhs.0)
    }
}

impl AddAssign<&Credits> for Credits {
    fn add_assign(&mut self, rhs: &Credits) {
        self.0 += &rhs.0;
    }
}

impl Serialize for Credits {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Credits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<BigUint>()
            .map(Credits)
            .map_err(|_| D::Error::custom(format!("invalid decimal credit string: {s}")))
    }
}

/// Resource accounting for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Sum of complexity over completed steps.
    pub complexity_completed: u64,
    /// Monotonically non-decreasing within a run.
    pub credits_spent: Credits,
    pub steps_run: u64,
    /// Wall-clock milliseconds, including time spent waiting on decisions.
    pub time_elapsed_ms: u64,
}

/// An unresolved branching choice, parked until external input resolves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredDecision {
    pub key: DecisionKey,
    /// Branch that hit the decision point. Navigators leave this empty; the
    /// orchestrator fills it in when registering the decision.
    #[serde(default)]
    pub branch_id: Option<BranchId>,
    /// The reachable positions to choose between.
    pub options: Vec<Location>,
    /// Opaque payload describing the choice for whoever resolves it.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// The outstanding decision set carried on a run.
pub type DecisionMap = HashMap<DecisionKey, DeferredDecision>;

/// Who owns a run. Carried through loader and persistence calls so
/// implementations can enforce access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_stack_current_is_top() {
        let root = Location::new(GraphObjectType::RoutineVersion, "R1", "start");
        let mut stack = LocationStack::new(root.clone());
        assert_eq!(stack.current(), Some(&root));

        let nested = Location::new(GraphObjectType::RoutineVersion, "R2", "n1");
        stack.push(nested.clone());
        assert_eq!(stack.current(), Some(&nested));
        assert_eq!(stack.depth(), 2);

        stack.pop();
        assert_eq!(stack.current(), Some(&root));
    }

    #[test]
    fn test_replace_current_keeps_path() {
        let mut stack = LocationStack::new(Location::new(
            GraphObjectType::ProjectVersion,
            "P1",
            "dir",
        ));
        stack.push(Location::new(GraphObjectType::RoutineVersion, "R1", "n1"));
        stack.replace_current(Location::new(GraphObjectType::RoutineVersion, "R1", "n2"));

        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.current().unwrap().location_id, "n2");
        assert_eq!(stack.locations()[0].object_id, "P1");
    }

    #[test]
    fn test_credits_decimal_string_round_trip() {
        let credits: Credits = "340282366920938463463374607431768211456".parse().unwrap();
        let json = serde_json::to_string(&credits).unwrap();
        assert_eq!(json, "\"340282366920938463463374607431768211456\"");

        let back: Credits = serde_json::from_str(&json).unwrap();
        assert_eq!(back, credits);
    }

    #[test]
    fn test_credits_rejects_non_decimal() {
        assert!("1.5".parse::<Credits>().is_err());
        assert!("-3".parse::<Credits>().is_err());
        assert!(serde_json::from_str::<Credits>("\"abc\"").is_err());
    }

    #[test]
    fn test_credits_ordering_and_sum() {
        let a = Credits::from(40);
        let b = Credits::from(60);
        let total = Credits::checked_sum([&a, &b]);
        assert_eq!(total, Credits::from(100));
        assert!(a < b);
        assert!(total > b);

        let mut spent = Credits::zero();
        spent += &a;
        spent += &a;
        spent += &a;
        assert_eq!(spent, Credits::from(120));
    }

    #[test]
    fn test_unknown_estimate_is_huge() {
        assert!(Credits::unknown_estimate() > Credits::from(1_000_000_000));
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_same_object() {
        let a = Location::new(GraphObjectType::RoutineVersion, "R1", "n1");
        let b = Location::new(GraphObjectType::RoutineVersion, "R1", "n2");
        let c = Location::new(GraphObjectType::RoutineVersion, "R2", "n1");
        assert!(a.same_object(&b));
        assert!(!a.same_object(&c));
    }
}
