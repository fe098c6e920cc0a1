//! Route graph: the stage topology as data
//!
//! A [`RouteGraph`] is a list of stages, each a list of edge templates. A
//! template names a source slot, a target (slot or the external recipient)
//! and a share rule. [`RouteGraph::generate_edges`] turns one stage into
//! concrete amounts from the holdings confirmed before that stage.
//!
//! # Standard topology
//!
//! ```text
//! seed ─┬─ d1.0 ─┬─ d2.0 ─┐
//!       │        ├─ d2.1 ─┴─ r1.0
//!       │        └─ d2.2 ─┐
//!       └─ d1.1 ─┬─ d2.3 ─┴─ r1.1
//!                ├─ d2.4 ─┐
//!                └─ d2.5 ─┴─ r1.2
//!
//! shuffle:  r1.0, r1.2 → r1.1 → s.0, s.1 → r1.2, r1.0
//! merge:    r1.2 → r2.0, r1.1 → r2.1, r1.0 → r2.2
//! weights:  r2.0 → r3.0, r2.2 → r3.2, r2.1 → r3.0 | r3.1 | r3.2
//! collect:  r3.* → c → recipient
//! ```

use crate::error::{Result, RouteError};
use crate::value;
use ledger_client::Amount;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(de::Error::custom)
            }
        }
    };
}

/// Named layer of the route; stages run in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageId {
    /// seed → two branches
    Split,
    /// each branch → three leaves
    FanOut,
    /// six leaves → three merge accounts, blending both branches
    Consolidate1,
    /// outer merge accounts → middle merge account
    ShuffleIn,
    /// middle merge account → stealth accounts
    ShuffleOut,
    /// stealth accounts → outer merge accounts, crossed
    ShuffleReturn,
    /// merge accounts → second merge tier
    Consolidate2,
    /// second merge tier → third tier with uneven weights
    Consolidate3,
    /// third tier → collector
    Culminate,
    /// collector → external recipient
    Payout,
}

impl StageId {
    /// All stages in execution order
    pub const ALL: [StageId; 10] = [
        StageId::Split,
        StageId::FanOut,
        StageId::Consolidate1,
        StageId::ShuffleIn,
        StageId::ShuffleOut,
        StageId::ShuffleReturn,
        StageId::Consolidate2,
        StageId::Consolidate3,
        StageId::Culminate,
        StageId::Payout,
    ];

    /// Stable name used in logs and persisted state
    pub fn name(&self) -> &'static str {
        match self {
            StageId::Split => "split",
            StageId::FanOut => "fan-out",
            StageId::Consolidate1 => "consolidate-1",
            StageId::ShuffleIn => "shuffle-in",
            StageId::ShuffleOut => "shuffle-out",
            StageId::ShuffleReturn => "shuffle-return",
            StageId::Consolidate2 => "consolidate-2",
            StageId::Consolidate3 => "consolidate-3",
            StageId::Culminate => "culminate",
            StageId::Payout => "payout",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageId {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self> {
        StageId::ALL
            .iter()
            .copied()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| RouteError::Topology(format!("Unknown stage: {}", s)))
    }
}

string_serde!(StageId);

/// Role of a slot in the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// Receives the inbound transfer
    Seed,
    /// First split
    Split,
    /// Fan-out leaves
    Leaf,
    /// First merge tier
    Merge,
    /// Ephemeral shuffle accounts
    Stealth,
    /// Second merge tier
    Blend,
    /// Third merge tier
    Weighted,
    /// Final collector before payout
    Collector,
}

impl Tier {
    fn prefix(&self) -> &'static str {
        match self {
            Tier::Seed => "seed",
            Tier::Split => "d1",
            Tier::Leaf => "d2",
            Tier::Merge => "r1",
            Tier::Stealth => "s",
            Tier::Blend => "r2",
            Tier::Weighted => "r3",
            Tier::Collector => "c",
        }
    }

    fn indexed(&self) -> bool {
        !matches!(self, Tier::Seed | Tier::Collector)
    }
}

/// Logical account position; an Account is bound to it on first use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot {
    /// Tier of the slot
    pub tier: Tier,
    /// Position within the tier
    pub index: u8,
}

impl Slot {
    /// The inbound account
    pub const SEED: Slot = Slot {
        tier: Tier::Seed,
        index: 0,
    };

    /// The collector account
    pub const COLLECTOR: Slot = Slot {
        tier: Tier::Collector,
        index: 0,
    };

    /// Create new slot
    pub const fn new(tier: Tier, index: u8) -> Self {
        Self { tier, index }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tier.indexed() {
            write!(f, "{}.{}", self.tier.prefix(), self.index)
        } else {
            f.write_str(self.tier.prefix())
        }
    }
}

impl FromStr for Slot {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, index) = match s.split_once('.') {
            Some((prefix, index)) => {
                let index = index
                    .parse::<u8>()
                    .map_err(|e| RouteError::Topology(format!("Invalid slot '{}': {}", s, e)))?;
                (prefix, Some(index))
            }
            None => (s, None),
        };

        const TIERS: [Tier; 8] = [
            Tier::Seed,
            Tier::Split,
            Tier::Leaf,
            Tier::Merge,
            Tier::Stealth,
            Tier::Blend,
            Tier::Weighted,
            Tier::Collector,
        ];
        let tier = TIERS
            .iter()
            .copied()
            .find(|tier| tier.prefix() == prefix)
            .ok_or_else(|| RouteError::Topology(format!("Invalid slot '{}'", s)))?;

        match (tier.indexed(), index) {
            (true, Some(index)) => Ok(Slot::new(tier, index)),
            (false, None) => Ok(Slot::new(tier, 0)),
            _ => Err(RouteError::Topology(format!("Invalid slot '{}'", s))),
        }
    }
}

string_serde!(Slot);

/// Where an edge delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    /// Another routing account
    Slot(Slot),
    /// The external recipient address of the run
    Recipient,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Slot(slot) => write!(f, "{}", slot),
            Target::Recipient => f.write_str("recipient"),
        }
    }
}

impl FromStr for Target {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "recipient" {
            Ok(Target::Recipient)
        } else {
            s.parse().map(Target::Slot)
        }
    }
}

string_serde!(Target);

/// `(stage, edge-index)` identifier of an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    /// Stage the edge belongs to
    pub stage: StageId,
    /// Position within the stage template
    pub index: u16,
}

impl EdgeKey {
    /// Create new edge key
    pub const fn new(stage: StageId, index: u16) -> Self {
        Self { stage, index }
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.index)
    }
}

impl FromStr for EdgeKey {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self> {
        let (stage, index) = s
            .split_once('/')
            .ok_or_else(|| RouteError::Topology(format!("Invalid edge key '{}'", s)))?;
        let index = index
            .parse::<u16>()
            .map_err(|e| RouteError::Topology(format!("Invalid edge key '{}': {}", s, e)))?;
        Ok(EdgeKey::new(stage.parse()?, index))
    }
}

string_serde!(EdgeKey);

/// How much of the source's holdings an edge carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Share {
    /// Everything the source holds
    Full,
    /// Share `index` of an equal `parts`-way split (remainder on the last share)
    Split {
        /// Number of shares
        parts: u32,
        /// Which share
        index: u32,
    },
    /// Exactly what arrived on an earlier edge
    Echo(EdgeKey),
}

/// One edge of a stage template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeTemplate {
    /// Sending slot
    pub from: Slot,
    /// Receiving side
    pub to: Target,
    /// Share rule
    pub share: Share,
}

impl EdgeTemplate {
    /// Forward everything `from` holds
    pub fn full(from: Slot, to: Slot) -> Self {
        Self {
            from,
            to: Target::Slot(to),
            share: Share::Full,
        }
    }

    /// Share `index` of a `parts`-way split
    pub fn split(from: Slot, to: Slot, parts: u32, index: u32) -> Self {
        Self {
            from,
            to: Target::Slot(to),
            share: Share::Split { parts, index },
        }
    }

    /// Forward what arrived on `of`
    pub fn echo(from: Slot, to: Slot, of: EdgeKey) -> Self {
        Self {
            from,
            to: Target::Slot(to),
            share: Share::Echo(of),
        }
    }

    /// Pay everything `from` holds to the recipient
    pub fn payout(from: Slot) -> Self {
        Self {
            from,
            to: Target::Recipient,
            share: Share::Full,
        }
    }
}

/// Edge templates of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTemplate {
    /// Stage identifier
    pub id: StageId,
    /// Edges, indexed by position
    pub edges: Vec<EdgeTemplate>,
}

impl StageTemplate {
    /// Create new stage template
    pub fn new(id: StageId, edges: Vec<EdgeTemplate>) -> Self {
        Self { id, edges }
    }

    /// Slots that receive in this stage
    pub fn target_slots(&self) -> BTreeSet<Slot> {
        self.edges
            .iter()
            .filter_map(|edge| match edge.to {
                Target::Slot(slot) => Some(slot),
                Target::Recipient => None,
            })
            .collect()
    }

    /// Slots that send in this stage
    pub fn source_slots(&self) -> BTreeSet<Slot> {
        self.edges.iter().map(|edge| edge.from).collect()
    }
}

/// Confirmed value per slot and per edge, the input of edge generation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Holdings {
    balances: BTreeMap<Slot, Amount>,
    arrivals: BTreeMap<EdgeKey, Amount>,
}

impl Holdings {
    /// Empty holdings
    pub fn new() -> Self {
        Self::default()
    }

    /// Add value to a slot
    pub fn credit(&mut self, slot: Slot, amount: Amount) {
        *self.balances.entry(slot).or_insert(0) += amount;
    }

    /// Remove value from a slot, saturating at zero
    pub fn debit(&mut self, slot: Slot, amount: Amount) {
        let balance = self.balances.entry(slot).or_insert(0);
        *balance = balance.saturating_sub(amount);
    }

    /// Record the net amount confirmed on an edge
    pub fn record_arrival(&mut self, edge: EdgeKey, amount: Amount) {
        self.arrivals.insert(edge, amount);
    }

    /// Value held by a slot
    pub fn balance(&self, slot: &Slot) -> Amount {
        self.balances.get(slot).copied().unwrap_or(0)
    }

    /// Net amount confirmed on an edge (zero if skipped or unknown)
    pub fn arrival(&self, edge: &EdgeKey) -> Amount {
        self.arrivals.get(edge).copied().unwrap_or(0)
    }
}

/// A concrete edge with its gross (pre-fee) amount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedEdge {
    /// Edge identifier
    pub key: EdgeKey,
    /// Sending slot
    pub from: Slot,
    /// Receiving side
    pub to: Target,
    /// Value leaving the source, fees included
    pub gross: Amount,
    /// Target has no downstream dependents
    pub leaf: bool,
}

/// Static, layered route template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteGraph {
    stages: Vec<StageTemplate>,
}

impl RouteGraph {
    /// Build a graph and check its invariants
    pub fn new(stages: Vec<StageTemplate>) -> Result<Self> {
        let graph = Self { stages };
        graph.validate()?;
        Ok(graph)
    }

    /// The reference ten-stage, 32-edge topology
    pub fn standard() -> Self {
        let d1 = |i| Slot::new(Tier::Split, i);
        let d2 = |i| Slot::new(Tier::Leaf, i);
        let r1 = |i| Slot::new(Tier::Merge, i);
        let s = |i| Slot::new(Tier::Stealth, i);
        let r2 = |i| Slot::new(Tier::Blend, i);
        let r3 = |i| Slot::new(Tier::Weighted, i);
        let c = Slot::COLLECTOR;

        let mut fan_out = Vec::with_capacity(6);
        for branch in 0..2u8 {
            for leaf in 0..3u8 {
                fan_out.push(EdgeTemplate::split(d1(branch), d2(branch * 3 + leaf), 3, u32::from(leaf)));
            }
        }

        Self {
            stages: vec![
                StageTemplate::new(
                    StageId::Split,
                    vec![
                        EdgeTemplate::split(Slot::SEED, d1(0), 2, 0),
                        EdgeTemplate::split(Slot::SEED, d1(1), 2, 1),
                    ],
                ),
                StageTemplate::new(StageId::FanOut, fan_out),
                StageTemplate::new(
                    StageId::Consolidate1,
                    vec![
                        EdgeTemplate::full(d2(0), r1(0)),
                        EdgeTemplate::full(d2(1), r1(0)),
                        EdgeTemplate::full(d2(2), r1(1)),
                        EdgeTemplate::full(d2(3), r1(1)),
                        EdgeTemplate::full(d2(4), r1(2)),
                        EdgeTemplate::full(d2(5), r1(2)),
                    ],
                ),
                StageTemplate::new(
                    StageId::ShuffleIn,
                    vec![
                        EdgeTemplate::full(r1(0), r1(1)),
                        EdgeTemplate::full(r1(2), r1(1)),
                    ],
                ),
                StageTemplate::new(
                    StageId::ShuffleOut,
                    vec![
                        EdgeTemplate::echo(r1(1), s(0), EdgeKey::new(StageId::ShuffleIn, 0)),
                        EdgeTemplate::echo(r1(1), s(1), EdgeKey::new(StageId::ShuffleIn, 1)),
                    ],
                ),
                StageTemplate::new(
                    StageId::ShuffleReturn,
                    vec![
                        EdgeTemplate::full(s(0), r1(2)),
                        EdgeTemplate::full(s(1), r1(0)),
                    ],
                ),
                StageTemplate::new(
                    StageId::Consolidate2,
                    vec![
                        EdgeTemplate::full(r1(2), r2(0)),
                        EdgeTemplate::full(r1(1), r2(1)),
                        EdgeTemplate::full(r1(0), r2(2)),
                    ],
                ),
                StageTemplate::new(
                    StageId::Consolidate3,
                    vec![
                        EdgeTemplate::full(r2(0), r3(0)),
                        EdgeTemplate::full(r2(2), r3(2)),
                        EdgeTemplate::split(r2(1), r3(0), 3, 0),
                        EdgeTemplate::split(r2(1), r3(1), 3, 1),
                        EdgeTemplate::split(r2(1), r3(2), 3, 2),
                    ],
                ),
                StageTemplate::new(
                    StageId::Culminate,
                    vec![
                        EdgeTemplate::full(r3(0), c),
                        EdgeTemplate::full(r3(1), c),
                        EdgeTemplate::full(r3(2), c),
                    ],
                ),
                StageTemplate::new(
                    StageId::Payout,
                    vec![EdgeTemplate::payout(c)],
                ),
            ],
        }
    }

    /// Stages in execution order
    pub fn stages(&self) -> &[StageTemplate] {
        &self.stages
    }

    /// Template of one stage
    pub fn stage(&self, id: StageId) -> Option<&StageTemplate> {
        self.stages.iter().find(|stage| stage.id == id)
    }

    /// Total number of edges across all stages
    pub fn edge_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.edges.len()).sum()
    }

    /// Whether nothing after `stage` spends from `target`
    pub fn is_leaf(&self, stage: StageId, target: &Target) -> bool {
        match target {
            Target::Recipient => true,
            Target::Slot(slot) => !self
                .stages
                .iter()
                .filter(|later| later.id > stage)
                .any(|later| later.edges.iter().any(|edge| edge.from == *slot)),
        }
    }

    /// Concrete edges of `stage` given the holdings confirmed before it
    pub fn generate_edges(&self, stage: StageId, holdings: &Holdings) -> Result<Vec<PlannedEdge>> {
        let template = self
            .stage(stage)
            .ok_or_else(|| RouteError::Topology(format!("Stage {} not in graph", stage)))?;

        let mut split_cache: BTreeMap<(Slot, u32), Vec<Amount>> = BTreeMap::new();
        let mut planned = Vec::with_capacity(template.edges.len());

        for (position, edge) in template.edges.iter().enumerate() {
            let available = holdings.balance(&edge.from);
            let gross = match edge.share {
                Share::Full => available,
                Share::Split { parts, index } => split_cache
                    .entry((edge.from, parts))
                    .or_insert_with(|| value::split(available, parts))
                    .get(index as usize)
                    .copied()
                    .unwrap_or(0),
                Share::Echo(of) => value::clamp(holdings.arrival(&of), available),
            };

            planned.push(PlannedEdge {
                key: EdgeKey::new(stage, position as u16),
                from: edge.from,
                to: edge.to,
                gross,
                leaf: self.is_leaf(stage, &edge.to),
            });
        }

        Ok(planned)
    }

    /// Check the structural invariants of the graph
    pub fn validate(&self) -> Result<()> {
        let mut funded: BTreeSet<Slot> = BTreeSet::from([Slot::SEED]);
        let mut previous: Option<StageId> = None;
        let mut payouts = 0usize;

        for (position, stage) in self.stages.iter().enumerate() {
            if let Some(prev) = previous {
                if stage.id <= prev {
                    return Err(RouteError::Topology(format!(
                        "Stage {} is out of order after {}",
                        stage.id, prev
                    )));
                }
            }
            previous = Some(stage.id);

            if stage.edges.is_empty() {
                return Err(RouteError::Topology(format!("Stage {} has no edges", stage.id)));
            }

            let sources = stage.source_slots();
            let targets = stage.target_slots();
            if let Some(slot) = sources.intersection(&targets).next() {
                return Err(RouteError::Topology(format!(
                    "Slot {} both sends and receives in stage {}",
                    slot, stage.id
                )));
            }

            for source in &sources {
                if !funded.contains(source) {
                    return Err(RouteError::Topology(format!(
                        "Slot {} spends in stage {} before receiving",
                        source, stage.id
                    )));
                }
                self.validate_shares(stage, *source)?;
            }

            for edge in &stage.edges {
                if edge.to == Target::Recipient {
                    payouts += 1;
                    if position + 1 != self.stages.len() {
                        return Err(RouteError::Topology(format!(
                            "Payout edge in stage {} is not in the last stage",
                            stage.id
                        )));
                    }
                }
                if let Share::Echo(of) = edge.share {
                    self.validate_echo(stage.id, edge, of)?;
                }
            }

            funded.extend(targets);
        }

        if payouts != 1 {
            return Err(RouteError::Topology(format!(
                "Expected exactly one payout edge, found {}",
                payouts
            )));
        }

        Ok(())
    }

    fn validate_shares(&self, stage: &StageTemplate, source: Slot) -> Result<()> {
        let edges: Vec<&EdgeTemplate> = stage.edges.iter().filter(|e| e.from == source).collect();
        let fulls = edges.iter().filter(|e| e.share == Share::Full).count();
        let echoes = edges.iter().filter(|e| matches!(e.share, Share::Echo(_))).count();
        let splits: Vec<(u32, u32)> = edges
            .iter()
            .filter_map(|e| match e.share {
                Share::Split { parts, index } => Some((parts, index)),
                _ => None,
            })
            .collect();

        let consistent = match (fulls, echoes, splits.len()) {
            (1, 0, 0) => true,
            (0, n, 0) if n > 0 => true,
            (0, 0, n) if n > 0 => {
                let parts = splits[0].0;
                let indices: BTreeSet<u32> = splits.iter().map(|(_, index)| *index).collect();
                splits.iter().all(|(p, _)| *p == parts)
                    && parts as usize == n
                    && indices == (0..parts).collect()
            }
            _ => false,
        };

        if consistent {
            Ok(())
        } else {
            Err(RouteError::Topology(format!(
                "Slot {} mixes or misuses share rules in stage {}",
                source, stage.id
            )))
        }
    }

    fn validate_echo(&self, stage: StageId, edge: &EdgeTemplate, of: EdgeKey) -> Result<()> {
        if of.stage >= stage {
            return Err(RouteError::Topology(format!(
                "Echo in stage {} refers to later edge {}",
                stage, of
            )));
        }
        let referenced = self
            .stage(of.stage)
            .and_then(|s| s.edges.get(of.index as usize))
            .ok_or_else(|| RouteError::Topology(format!("Echo refers to unknown edge {}", of)))?;
        if referenced.to != Target::Slot(edge.from) {
            return Err(RouteError::Topology(format!(
                "Echo from {} refers to edge {} which does not deliver to it",
                edge.from, of
            )));
        }
        Ok(())
    }
}

impl Default for RouteGraph {
    fn default() -> Self {
        Self::standard()
    }
}
