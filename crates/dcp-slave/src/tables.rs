//! Configuration received from the master.
//!
//! The master assigns variables to positions inside data PDUs, chooses how
//! often outputs are sent and in which phase each data id is active. All of
//! it is cleared by `CFG_config_clear` and on deregistration.

use crate::description::{fraction_to_duration, SlaveDescription};
use dcp_common::{DataType, DcpError, Scope};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Seconds per step as `numerator / denominator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeResolution {
    /// Numerator.
    pub numerator: u32,
    /// Denominator.
    pub denominator: u32,
    /// A resolution is in effect, either set by the master or taken from
    /// the description.
    pub set: bool,
    /// The description fixes the resolution; `CFG_set_time_res` is refused.
    pub fixed: bool,
}

impl TimeResolution {
    /// Initial resolution: the first fixed or recommended one of the
    /// description, otherwise unset.
    #[must_use]
    pub fn from_description(description: &SlaveDescription) -> Self {
        description
            .time_res
            .resolutions
            .iter()
            .find(|r| r.fixed || r.recommended)
            .map_or_else(Self::default, |r| Self {
                numerator: r.numerator,
                denominator: r.denominator,
                set: true,
                fixed: r.fixed,
            })
    }

    /// Set by the master.
    pub fn assign(&mut self, numerator: u32, denominator: u32) {
        self.numerator = numerator;
        self.denominator = denominator;
        self.set = true;
    }

    /// Length of one step.
    #[must_use]
    pub fn period(&self) -> Duration {
        fraction_to_duration(self.numerator, self.denominator)
    }
}

/// A variable fed from a data PDU position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEntry {
    /// Value reference written.
    pub vr: u64,
    /// Wire type the master sends.
    pub source_type: DataType,
}

/// Outputs sharing one step count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputCounter {
    /// Send every `steps` steps.
    pub steps: u32,
    /// Steps left until the next send.
    pub remaining: u32,
    /// Data ids sent together.
    pub data_ids: Vec<u16>,
}

/// A reason why `STC_configure` must be refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incomplete {
    /// Input positions of a data id are not contiguous.
    GapInput {
        /// Data id.
        data_id: u16,
        /// Unassigned positions below the highest one.
        missing: Vec<u16>,
    },
    /// Output positions of a data id are not contiguous.
    GapOutput {
        /// Data id.
        data_id: u16,
        /// Unassigned positions below the highest one.
        missing: Vec<u16>,
    },
    /// Tunable parameter positions of a param id are not contiguous.
    GapTunable {
        /// Param id.
        param_id: u16,
        /// Unassigned positions below the highest one.
        missing: Vec<u16>,
    },
    /// No source network information for an input data id.
    NetworkInput(u16),
    /// No target network information for an output data id.
    NetworkOutput(u16),
    /// No network information for a param id.
    NetworkTunable(u16),
    /// No step count for an output data id.
    Steps(u16),
    /// The time resolution was never set.
    TimeResolution,
    /// A data id belongs to no scope.
    Scope(u16),
}

impl Incomplete {
    /// Error code reported to the master.
    #[must_use]
    pub fn error(&self) -> DcpError {
        match self {
            Self::GapInput { .. } => DcpError::IncompleteConfigGapInputPos,
            Self::GapOutput { .. } => DcpError::IncompleteConfigGapOutputPos,
            Self::GapTunable { .. } => DcpError::IncompleteConfigGapTunablePos,
            Self::NetworkInput(_) => DcpError::IncompleteConfigNwInfoInput,
            Self::NetworkOutput(_) => DcpError::IncompleteConfigNwInfoOutput,
            Self::NetworkTunable(_) => DcpError::IncompleteConfigNwInfoTunable,
            Self::Steps(_) => DcpError::IncompleteConfigSteps,
            Self::TimeResolution => DcpError::IncompleteConfigTimeResolution,
            Self::Scope(_) => DcpError::IncompleteConfigScope,
        }
    }
}

fn gaps<V>(positions: &BTreeMap<u16, V>) -> Option<Vec<u16>> {
    let max = *positions.keys().next_back()?;
    if usize::from(max) < positions.len() {
        return None;
    }
    Some((0..max).filter(|pos| !positions.contains_key(pos)).collect())
}

/// Everything configured through `CFG_*` PDUs.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationTables {
    /// data id -> position -> input.
    pub inputs: BTreeMap<u16, BTreeMap<u16, InputEntry>>,
    /// data id -> position -> output vr.
    pub outputs: BTreeMap<u16, BTreeMap<u16, u64>>,
    /// param id -> position -> tunable parameter.
    pub parameters: BTreeMap<u16, BTreeMap<u16, InputEntry>>,
    /// Steps per output data id.
    pub steps: HashMap<u16, u32>,
    /// Data ids active while running.
    pub running_scope: BTreeSet<u16>,
    /// Data ids active during initialization.
    pub initialization_scope: BTreeSet<u16>,
    /// Input data ids with source network information.
    pub source_network: BTreeSet<u16>,
    /// Output data ids with target network information.
    pub target_network: BTreeSet<u16>,
    /// Param ids with network information.
    pub param_network: BTreeSet<u16>,
    /// Output step-down counters built at `STC_configure`.
    pub output_counters: Vec<OutputCounter>,
}

impl ConfigurationTables {
    /// Create empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all configuration.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Assign `entry` to `pos` of input `data_id`.
    pub fn config_input(&mut self, data_id: u16, pos: u16, entry: InputEntry) {
        self.inputs.entry(data_id).or_default().insert(pos, entry);
    }

    /// Assign output `vr` to `pos` of `data_id`.
    pub fn config_output(&mut self, data_id: u16, pos: u16, vr: u64) {
        self.outputs.entry(data_id).or_default().insert(pos, vr);
    }

    /// Assign tunable parameter `entry` to `pos` of `param_id`.
    pub fn config_tunable(&mut self, param_id: u16, pos: u16, entry: InputEntry) {
        self.parameters.entry(param_id).or_default().insert(pos, entry);
    }

    /// Put `data_id` into the scope lists named by `scope`.
    pub fn set_scope(&mut self, data_id: u16, scope: Scope) {
        if scope.includes_run() {
            self.running_scope.insert(data_id);
        } else {
            self.running_scope.remove(&data_id);
        }
        if scope.includes_initialization() {
            self.initialization_scope.insert(data_id);
        } else {
            self.initialization_scope.remove(&data_id);
        }
    }

    /// Inputs of `data_id` in position order.
    pub fn input_layout(&self, data_id: u16) -> impl Iterator<Item = InputEntry> + '_ {
        self.inputs
            .get(&data_id)
            .into_iter()
            .flat_map(|positions| positions.values().copied())
    }

    /// Tunable parameters of `param_id` in position order.
    pub fn parameter_layout(&self, param_id: u16) -> impl Iterator<Item = InputEntry> + '_ {
        self.parameters
            .get(&param_id)
            .into_iter()
            .flat_map(|positions| positions.values().copied())
    }

    /// Output vrs of `data_id` in position order.
    pub fn output_layout(&self, data_id: u16) -> impl Iterator<Item = u64> + '_ {
        self.outputs
            .get(&data_id)
            .into_iter()
            .flat_map(|positions| positions.values().copied())
    }

    /// Output data ids in the initialization scope.
    #[must_use]
    pub fn initialization_outputs(&self) -> Vec<u16> {
        self.outputs
            .keys()
            .copied()
            .filter(|id| self.initialization_scope.contains(id))
            .collect()
    }

    /// Output data ids in the running scope.
    #[must_use]
    pub fn running_outputs(&self) -> Vec<u16> {
        self.outputs
            .keys()
            .copied()
            .filter(|id| self.running_scope.contains(id))
            .collect()
    }

    /// Everything that prevents `STC_configure`, in reporting order.
    #[must_use]
    pub fn completeness_errors(&self, time_resolution_set: bool) -> Vec<Incomplete> {
        let mut found = Vec::new();

        for (&data_id, positions) in &self.inputs {
            if let Some(missing) = gaps(positions) {
                found.push(Incomplete::GapInput { data_id, missing });
            }
        }
        for (&data_id, positions) in &self.outputs {
            if let Some(missing) = gaps(positions) {
                found.push(Incomplete::GapOutput { data_id, missing });
            }
        }
        for (&param_id, positions) in &self.parameters {
            if let Some(missing) = gaps(positions) {
                found.push(Incomplete::GapTunable { param_id, missing });
            }
        }
        found.extend(
            self.inputs
                .keys()
                .filter(|id| !self.source_network.contains(id))
                .map(|&id| Incomplete::NetworkInput(id)),
        );
        found.extend(
            self.outputs
                .keys()
                .filter(|id| !self.target_network.contains(id))
                .map(|&id| Incomplete::NetworkOutput(id)),
        );
        found.extend(
            self.parameters
                .keys()
                .filter(|id| !self.param_network.contains(id))
                .map(|&id| Incomplete::NetworkTunable(id)),
        );
        found.extend(
            self.outputs
                .keys()
                .filter(|id| !self.steps.contains_key(id))
                .map(|&id| Incomplete::Steps(id)),
        );
        if !time_resolution_set {
            found.push(Incomplete::TimeResolution);
        }
        found.extend(
            self.inputs
                .keys()
                .chain(self.outputs.keys())
                .filter(|id| {
                    !self.running_scope.contains(id) && !self.initialization_scope.contains(id)
                })
                .map(|&id| Incomplete::Scope(id)),
        );
        found
    }

    /// Group running-scope outputs by step count into fresh counters.
    pub fn build_output_counters(&mut self) {
        let mut by_steps: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
        for data_id in self.running_outputs() {
            let steps = self.steps.get(&data_id).copied().unwrap_or(1).max(1);
            by_steps.entry(steps).or_default().push(data_id);
        }
        self.output_counters = by_steps
            .into_iter()
            .map(|(steps, data_ids)| OutputCounter {
                steps,
                remaining: steps,
                data_ids,
            })
            .collect();
    }

    /// Count one step down and return the data ids due for sending.
    pub fn tick_outputs(&mut self) -> Vec<u16> {
        let mut due = Vec::new();
        for counter in &mut self.output_counters {
            counter.remaining = counter.remaining.saturating_sub(1);
            if counter.remaining == 0 {
                due.extend_from_slice(&counter.data_ids);
                counter.remaining = counter.steps;
            }
        }
        due
    }
}
