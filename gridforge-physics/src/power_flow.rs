//! # DC Power Flow — linear network solution with overload flags
//!
//! Classic DC approximation: flat voltage profile, reactance-only lines,
//! angles solved from `B·θ = P` with the first bus as slack. The reduced
//! susceptance matrix is rebuilt only when the topology changes (a line
//! switched in or out); per-tick work is one Gaussian solve over a handful
//! of buses.
//!
//! Bus injections come from the bound generator devices' power telemetry
//! plus configured bus loads. Results are published to the solver's
//! monitor device: per-line |flow| MW in `input_registers[i]` and the
//! overload flag in `discrete_inputs[i]`.

use crate::{word, PhysicsEngine};
use gridforge_core::config::GridSpec;
use gridforge_core::{CoreError, CoreResult, MemKey, MemValue, StateFabric};
use std::collections::HashMap;
use tracing::{debug, error, warn};

/// Power telemetry register read from each generator device.
const GENERATOR_POWER_REG: MemKey = MemKey::holding(5);

#[derive(Debug, Clone)]
struct Bus {
    name: String,
    load_mw: f64,
    gen_mw: f64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LineState {
    pub name: String,
    pub from_bus: String,
    pub to_bus: String,
    pub flow_mw: f64,
    pub overload: bool,
    pub in_service: bool,
}

#[derive(Debug, Clone)]
struct Line {
    name: String,
    from: usize,
    to: usize,
    reactance_pu: f64,
    rating_mva: f64,
    flow_mw: f64,
    overload: bool,
    in_service: bool,
}

pub struct PowerFlowSolver {
    device: String,
    base_mva: f64,
    buses: Vec<Bus>,
    lines: Vec<Line>,
    /// generator device → bus index
    bindings: Vec<(String, usize)>,
    b_reduced: Vec<Vec<f64>>,
    theta: Vec<f64>,
    dirty: bool,
}

impl PowerFlowSolver {
    pub fn new(device: &str, spec: &GridSpec) -> CoreResult<Self> {
        let mut bus_index: HashMap<String, usize> = HashMap::new();
        let mut buses = Vec::with_capacity(spec.buses.len());
        for bus in &spec.buses {
            bus_index.insert(bus.name.clone(), buses.len());
            buses.push(Bus {
                name: bus.name.clone(),
                load_mw: bus.load_mw,
                gen_mw: 0.0,
            });
        }

        let mut lines = Vec::with_capacity(spec.lines.len());
        for line in &spec.lines {
            let from = *bus_index.get(&line.from_bus).ok_or_else(|| {
                CoreError::InvalidConfig(format!(
                    "line '{}' references unknown bus '{}'",
                    line.name, line.from_bus
                ))
            })?;
            let to = *bus_index.get(&line.to_bus).ok_or_else(|| {
                CoreError::InvalidConfig(format!(
                    "line '{}' references unknown bus '{}'",
                    line.name, line.to_bus
                ))
            })?;
            if line.reactance_pu <= 0.0 {
                return Err(CoreError::InvalidConfig(format!(
                    "line '{}' has non-positive reactance",
                    line.name
                )));
            }
            lines.push(Line {
                name: line.name.clone(),
                from,
                to,
                reactance_pu: line.reactance_pu,
                rating_mva: line.rating_mva,
                flow_mw: 0.0,
                overload: false,
                in_service: true,
            });
        }

        let mut bindings = Vec::with_capacity(spec.generators.len());
        for gen in &spec.generators {
            let bus = *bus_index.get(&gen.bus).ok_or_else(|| {
                CoreError::InvalidConfig(format!(
                    "generator '{}' references unknown bus '{}'",
                    gen.device, gen.bus
                ))
            })?;
            bindings.push((gen.device.clone(), bus));
        }

        Ok(Self {
            device: device.to_string(),
            base_mva: spec.base_mva,
            buses,
            lines,
            bindings,
            b_reduced: Vec::new(),
            theta: Vec::new(),
            dirty: true,
        })
    }

    pub fn line_states(&self) -> Vec<LineState> {
        self.lines
            .iter()
            .map(|l| LineState {
                name: l.name.clone(),
                from_bus: self.buses[l.from].name.clone(),
                to_bus: self.buses[l.to].name.clone(),
                flow_mw: l.flow_mw,
                overload: l.overload,
                in_service: l.in_service,
            })
            .collect()
    }

    /// Switch a line in or out. Marks the susceptance matrix for rebuild.
    pub fn set_line_service(&mut self, name: &str, in_service: bool) -> CoreResult<()> {
        let line = self
            .lines
            .iter_mut()
            .find(|l| l.name == name)
            .ok_or_else(|| CoreError::InvalidConfig(format!("unknown line '{name}'")))?;
        if line.in_service != in_service {
            line.in_service = in_service;
            line.flow_mw = 0.0;
            line.overload = false;
            self.dirty = true;
            warn!(line = name, in_service, "Line service state changed");
        }
        Ok(())
    }

    pub fn set_bus_load(&mut self, bus: &str, load_mw: f64) -> CoreResult<()> {
        let bus = self
            .buses
            .iter_mut()
            .find(|b| b.name == bus)
            .ok_or_else(|| CoreError::InvalidConfig(format!("unknown bus '{bus}'")))?;
        bus.load_mw = load_mw;
        Ok(())
    }

    fn rebuild_b(&mut self) {
        let n = self.buses.len();
        if n < 2 {
            self.b_reduced.clear();
            return;
        }
        // Full susceptance matrix, then drop the slack row/column (bus 0).
        let mut b = vec![vec![0.0f64; n]; n];
        for line in self.lines.iter().filter(|l| l.in_service) {
            let susceptance = 1.0 / line.reactance_pu;
            b[line.from][line.from] += susceptance;
            b[line.to][line.to] += susceptance;
            b[line.from][line.to] -= susceptance;
            b[line.to][line.from] -= susceptance;
        }
        self.b_reduced = (1..n)
            .map(|i| (1..n).map(|j| b[i][j]).collect())
            .collect();
        self.dirty = false;
        debug!(buses = n, lines = self.lines.len(), "Susceptance matrix rebuilt");
    }

    /// Gaussian elimination with partial pivoting. Returns `None` when the
    /// reduced system is singular (an islanded bus).
    fn solve(matrix: &[Vec<f64>], rhs: &[f64]) -> Option<Vec<f64>> {
        let n = rhs.len();
        let mut a: Vec<Vec<f64>> = matrix.to_vec();
        let mut x: Vec<f64> = rhs.to_vec();

        for col in 0..n {
            let pivot_row = (col..n)
                .max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))?;
            if a[pivot_row][col].abs() < 1e-12 {
                return None;
            }
            a.swap(col, pivot_row);
            x.swap(col, pivot_row);

            for row in (col + 1)..n {
                let factor = a[row][col] / a[col][col];
                for k in col..n {
                    a[row][k] -= factor * a[col][k];
                }
                x[row] -= factor * x[col];
            }
        }
        for col in (0..n).rev() {
            for row in 0..col {
                let factor = a[row][col] / a[col][col];
                x[row] -= factor * x[col];
            }
            x[col] /= a[col][col];
        }
        Some(x)
    }
}

impl PhysicsEngine for PowerFlowSolver {
    fn device_name(&self) -> &str {
        &self.device
    }

    fn read_controls(&mut self, fabric: &StateFabric) -> CoreResult<()> {
        for bus in &mut self.buses {
            bus.gen_mw = 0.0;
        }
        for (device, bus) in &self.bindings {
            if let Ok(Some(MemValue::Word(mw))) = fabric.read(device, GENERATOR_POWER_REG)
            {
                self.buses[*bus].gen_mw += mw as f64;
            }
        }
        Ok(())
    }

    fn update(&mut self, dt: f64) {
        if dt <= 0.0 {
            warn!(device = %self.device, dt, "Invalid time delta, skipping update");
            return;
        }
        let n = self.buses.len();
        if n < 2 {
            return;
        }
        if self.dirty {
            self.rebuild_b();
        }

        // Per-unit injections for every bus except the slack.
        let rhs: Vec<f64> = self
            .buses
            .iter()
            .skip(1)
            .map(|b| (b.gen_mw - b.load_mw) / self.base_mva)
            .collect();

        let Some(theta_reduced) = Self::solve(&self.b_reduced, &rhs) else {
            error!(device = %self.device, "Power flow singular, network islanded");
            for line in &mut self.lines {
                line.flow_mw = 0.0;
                line.overload = false;
            }
            return;
        };

        self.theta = std::iter::once(0.0).chain(theta_reduced).collect();
        for line in &mut self.lines {
            if !line.in_service {
                continue;
            }
            let angle_diff = self.theta[line.from] - self.theta[line.to];
            line.flow_mw = angle_diff / line.reactance_pu * self.base_mva;
            let was_overloaded = line.overload;
            line.overload = line.flow_mw.abs() > line.rating_mva;
            if line.overload && !was_overloaded {
                error!(
                    line = %line.name,
                    flow_mw = line.flow_mw,
                    rating = line.rating_mva,
                    "Line overload"
                );
            }
        }
    }

    fn write_telemetry(&self, fabric: &StateFabric) -> CoreResult<()> {
        let mut writes = Vec::with_capacity(self.lines.len() * 2);
        for (i, line) in self.lines.iter().enumerate() {
            writes.push((MemKey::input(i as u16), MemValue::Word(word(line.flow_mw.abs()))));
            writes.push((MemKey::discrete(i as u16), MemValue::Bit(line.overload)));
        }
        fabric.write_bulk(&self.device, &writes)
    }
}
