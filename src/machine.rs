use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, ops::Range, path::Path};

/// Ledger unit indices at or above this value name async resources.
pub const ASYNC_UNIT_BASE: i32 = 0x10000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstrKind {
    Load,
    Store,
    Branch,
    Move,
    IntArith,
    FpArith,
    Prefetch,
    Nop,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecStyle {
    Scalar,
    Vector,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitType {
    Int,
    Fp,
}

/// Instruction class tag carried by every micro-op.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstructionClass {
    pub kind: InstrKind,
    pub style: ExecStyle,
    pub unit_type: UnitType,
    /// operand width in bits
    pub width: u16,
    /// number of vector lanes, 1 for scalar code
    #[serde(default = "one")]
    pub vec_width: u16,
}

fn one() -> u16 {
    1
}

impl InstructionClass {
    pub fn scalar(kind: InstrKind, unit_type: UnitType, width: u16) -> Self {
        Self {
            kind,
            style: ExecStyle::Scalar,
            unit_type,
            width,
            vec_width: 1,
        }
    }
}

impl fmt::Display for InstructionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}/{:?}/{}x{}",
            self.kind, self.style, self.unit_type, self.width, self.vec_width
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UnitClassConfig {
    /// unit class name, e.g. ALU
    pub name: String,
    /// number of identical instances
    pub count: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RestrictionConfig {
    pub name: String,
    /// instruction kinds covered by the rule
    pub kinds: Vec<InstrKind>,
    /// at most this many covered instructions issue in one cycle
    pub max_per_cycle: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TemplateConfig {
    /// unit classes occupied at each relative cycle; a repeated name takes
    /// more than one instance of the class
    pub cycles: Vec<Vec<String>>,
    /// async resource usage per issue
    #[serde(default)]
    pub async_usage: BTreeMap<String, u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InstructionConfig {
    pub kind: InstrKind,
    pub style: Option<ExecStyle>,
    pub unit_type: Option<UnitType>,
    pub width: Option<u16>,
    pub latency: u32,
    /// no templates means the instruction takes no unit
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BypassConfig {
    pub sources: Vec<InstrKind>,
    pub sinks: Vec<InstrKind>,
    pub latency: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MemoryLevel {
    pub name: String,
    /// level that serves misses of this one
    pub next: String,
    /// cycles per miss
    pub miss_penalty: f64,
    /// bytes per entry
    pub entry_size: u32,
    /// bytes per cycle; negative is unlimited, zero is not meaningful
    pub bandwidth: f64,
}

/// Machine resource model as written in a TOML file.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MachineConfig {
    pub name: String,
    /// vector register length in bits
    #[serde(default)]
    pub vector_length: u32,
    pub units: Vec<UnitClassConfig>,
    #[serde(default)]
    pub async_resources: Vec<UnitClassConfig>,
    #[serde(default)]
    pub restrictions: Vec<RestrictionConfig>,
    pub instructions: Vec<InstructionConfig>,
    #[serde(default)]
    pub bypasses: Vec<BypassConfig>,
    #[serde(default)]
    pub memory_levels: Vec<MemoryLevel>,
}

#[derive(Debug, Clone)]
pub struct UnitClass {
    pub name: String,
    pub count: u32,
    /// global index of the first instance
    pub first: usize,
}

#[derive(Debug, Clone)]
pub struct AsyncResource {
    pub name: String,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct Restriction {
    /// ids start at 1, the ledger records rule `id` under unit `-id`
    pub id: u32,
    pub name: String,
    pub kinds: Vec<InstrKind>,
    pub max_per_cycle: u32,
}

/// One way to issue an instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    /// per relative cycle, (unit class, instances needed)
    pub cycles: Vec<Vec<(usize, u32)>>,
    /// (async resource, amount)
    pub async_usage: Vec<(usize, u32)>,
}

impl Template {
    /// Total unit-cycles this template asks of `class`.
    pub fn demand(&self, class: usize) -> u32 {
        self.cycles
            .iter()
            .flatten()
            .filter(|(c, _)| *c == class)
            .map(|(_, n)| n)
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct InstructionDescription {
    pub kind: InstrKind,
    pub style: Option<ExecStyle>,
    pub unit_type: Option<UnitType>,
    pub width: Option<u16>,
    pub latency: u32,
    pub templates: Vec<Template>,
}

/// Resolved machine model, shared read-only by every scheduling run.
#[derive(Debug, Clone)]
pub struct Machine {
    pub name: String,
    pub vector_length: u32,
    unit_classes: Vec<UnitClass>,
    num_units: usize,
    async_resources: Vec<AsyncResource>,
    restrictions: Vec<Restriction>,
    instructions: Vec<InstructionDescription>,
    bypasses: Vec<BypassConfig>,
    memory_levels: Vec<MemoryLevel>,
}

impl Machine {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Machine> {
        let config: MachineConfig = toml::from_str(&std::fs::read_to_string(path)?)?;
        Ok(Machine::from_config(config)?)
    }

    pub fn from_config(config: MachineConfig) -> Result<Machine> {
        let mut unit_classes = vec![];
        let mut first = 0;
        for unit in &config.units {
            unit_classes.push(UnitClass {
                name: unit.name.clone(),
                count: unit.count,
                first,
            });
            first += unit.count as usize;
        }
        let async_resources: Vec<AsyncResource> = config
            .async_resources
            .iter()
            .map(|r| AsyncResource {
                name: r.name.clone(),
                count: r.count,
            })
            .collect();

        let class_index = |name: &str| {
            unit_classes
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| Error::UnknownUnit(name.to_string()))
        };
        let async_index = |name: &str| {
            async_resources
                .iter()
                .position(|r| r.name == name)
                .ok_or_else(|| Error::UnknownUnit(name.to_string()))
        };

        let mut instructions = vec![];
        for instr in &config.instructions {
            let mut templates = vec![];
            for template in &instr.templates {
                let mut cycles = vec![];
                for names in &template.cycles {
                    let mut uses: Vec<(usize, u32)> = vec![];
                    for name in names {
                        let class = class_index(name)?;
                        match uses.iter_mut().find(|(c, _)| *c == class) {
                            Some((_, n)) => *n += 1,
                            None => uses.push((class, 1)),
                        }
                    }
                    cycles.push(uses);
                }
                let mut async_usage = vec![];
                for (name, amount) in &template.async_usage {
                    async_usage.push((async_index(name)?, *amount));
                }
                templates.push(Template {
                    cycles,
                    async_usage,
                });
            }
            instructions.push(InstructionDescription {
                kind: instr.kind,
                style: instr.style,
                unit_type: instr.unit_type,
                width: instr.width,
                latency: instr.latency,
                templates,
            });
        }

        let restrictions = config
            .restrictions
            .iter()
            .enumerate()
            .map(|(i, r)| Restriction {
                id: i as u32 + 1,
                name: r.name.clone(),
                kinds: r.kinds.clone(),
                max_per_cycle: r.max_per_cycle,
            })
            .collect();

        Ok(Machine {
            name: config.name,
            vector_length: config.vector_length,
            num_units: first,
            unit_classes,
            async_resources,
            restrictions,
            instructions,
            bypasses: config.bypasses,
            memory_levels: config.memory_levels,
        })
    }

    pub fn num_units(&self) -> usize {
        self.num_units
    }

    pub fn unit_classes(&self) -> &[UnitClass] {
        &self.unit_classes
    }

    /// Global unit indices of every instance of `class`.
    pub fn units_of_class(&self, class: usize) -> Range<usize> {
        let c = &self.unit_classes[class];
        c.first..c.first + c.count as usize
    }

    pub fn class_of_unit(&self, unit: usize) -> Option<usize> {
        self.unit_classes
            .iter()
            .position(|c| unit >= c.first && unit < c.first + c.count as usize)
    }

    /// Class name and instance index of a global unit index.
    pub fn name_for_unit(&self, unit: usize) -> Option<(&str, u32)> {
        let class = self.class_of_unit(unit)?;
        let c = &self.unit_classes[class];
        Some((c.name.as_str(), (unit - c.first) as u32))
    }

    pub fn async_resources(&self) -> &[AsyncResource] {
        &self.async_resources
    }

    pub fn restrictions(&self) -> &[Restriction] {
        &self.restrictions
    }

    pub fn restriction_with_id(&self, id: u32) -> Option<&Restriction> {
        self.restrictions.iter().find(|r| r.id == id)
    }

    /// Restriction rules covering `kind`.
    pub fn restrictions_for(&self, kind: InstrKind) -> impl Iterator<Item = &Restriction> {
        self.restrictions
            .iter()
            .filter(move |r| r.kinds.contains(&kind))
    }

    pub fn memory_levels(&self) -> &[MemoryLevel] {
        &self.memory_levels
    }

    /// Find the description of `class`, falling back from an exact match to
    /// the same kind and unit type, then to the same kind alone.
    pub fn instruction(&self, class: &InstructionClass) -> Result<&InstructionDescription> {
        let exact = self.instructions.iter().find(|d| {
            d.kind == class.kind
                && d.style.is_none_or(|s| s == class.style)
                && d.unit_type.is_none_or(|u| u == class.unit_type)
                && d.width.is_none_or(|w| w == class.width)
        });
        exact
            .or_else(|| {
                self.instructions
                    .iter()
                    .find(|d| d.kind == class.kind && d.unit_type == Some(class.unit_type))
            })
            .or_else(|| self.instructions.iter().find(|d| d.kind == class.kind))
            .ok_or_else(|| Error::UnknownInstruction(class.to_string()))
    }

    pub fn bypass_latency(&self, source: InstrKind, sink: InstrKind) -> Option<u32> {
        self.bypasses
            .iter()
            .find(|b| b.sources.contains(&source) && b.sinks.contains(&sink))
            .map(|b| b.latency)
    }

    /// Readable name of a ledger unit index: a unit instance, an async
    /// resource or a restriction rule.
    pub fn ledger_unit_name(&self, unit: i32) -> String {
        if unit >= ASYNC_UNIT_BASE {
            match self.async_resources.get((unit - ASYNC_UNIT_BASE) as usize) {
                Some(r) => r.name.clone(),
                None => format!("async{}", unit - ASYNC_UNIT_BASE),
            }
        } else if unit >= 0 {
            match self.name_for_unit(unit as usize) {
                Some((name, idx)) => format!("{name}[{idx}]"),
                None => format!("unit{unit}"),
            }
        } else {
            match self.restriction_with_id((-unit) as u32) {
                Some(r) => r.name.clone(),
                None => format!("rule{}", -unit),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::{ExecStyle, InstrKind, InstructionClass, Machine, MachineConfig, UnitType};

    pub(crate) const TEST_MACHINE: &str = r#"
name = "test"
vector_length = 256

[[units]]
name = "ALU"
count = 2

[[units]]
name = "MEM"
count = 1

[[async_resources]]
name = "LoadPort"
count = 2

[[restrictions]]
name = "MemIssue"
kinds = ["Load", "Store"]
max_per_cycle = 1

[[instructions]]
kind = "IntArith"
latency = 1
[[instructions.templates]]
cycles = [["ALU"]]

[[instructions]]
kind = "FpArith"
unit_type = "Fp"
style = "Vector"
latency = 4
[[instructions.templates]]
cycles = [["ALU", "ALU"]]

[[instructions]]
kind = "FpArith"
width = 32
latency = 3
[[instructions.templates]]
cycles = [["ALU"]]

[[instructions]]
kind = "Load"
latency = 3
[[instructions.templates]]
cycles = [["MEM"]]
async_usage = { LoadPort = 1 }

[[instructions]]
kind = "Store"
latency = 1
[[instructions.templates]]
cycles = [["MEM"]]

[[instructions]]
kind = "Branch"
latency = 1
[[instructions.templates]]
cycles = [["ALU"]]

[[instructions]]
kind = "Move"
latency = 1
[[instructions.templates]]
cycles = [["ALU"]]

[[bypasses]]
sources = ["IntArith"]
sinks = ["Store"]
latency = 0

[[memory_levels]]
name = "L1"
next = "L2"
miss_penalty = 10.0
entry_size = 64
bandwidth = 16.0

[[memory_levels]]
name = "L2"
next = "Mem"
miss_penalty = 100.0
entry_size = 64
bandwidth = 0.0
"#;

    pub(crate) fn test_machine() -> Machine {
        let config: MachineConfig = toml::from_str(TEST_MACHINE).unwrap();
        Machine::from_config(config).unwrap()
    }

    #[test]
    fn test_units_are_flattened() {
        let machine = test_machine();
        assert_eq!(machine.num_units(), 3);
        assert_eq!(machine.units_of_class(1), 2..3);
        assert_eq!(machine.name_for_unit(1), Some(("ALU", 1)));
        assert_eq!(machine.name_for_unit(2), Some(("MEM", 0)));
        assert_eq!(machine.name_for_unit(3), None);
        assert_eq!(machine.ledger_unit_name(1), "ALU[1]");
        assert_eq!(machine.ledger_unit_name(super::ASYNC_UNIT_BASE), "LoadPort");
        assert_eq!(machine.ledger_unit_name(-1), "MemIssue");
    }

    #[test]
    fn test_instruction_lookup_falls_back() {
        let machine = test_machine();
        let vec_fp = InstructionClass {
            kind: InstrKind::FpArith,
            style: ExecStyle::Vector,
            unit_type: UnitType::Fp,
            width: 64,
            vec_width: 4,
        };
        assert_eq!(machine.instruction(&vec_fp).unwrap().latency, 4);
        let narrow_fp = InstructionClass::scalar(InstrKind::FpArith, UnitType::Fp, 32);
        assert_eq!(machine.instruction(&narrow_fp).unwrap().latency, 3);
        // same kind and unit type
        let scalar_fp = InstructionClass::scalar(InstrKind::FpArith, UnitType::Fp, 64);
        assert_eq!(machine.instruction(&scalar_fp).unwrap().latency, 4);
        // same kind
        let int_fp = InstructionClass::scalar(InstrKind::FpArith, UnitType::Int, 64);
        assert_eq!(machine.instruction(&int_fp).unwrap().latency, 4);
        let prefetch = InstructionClass::scalar(InstrKind::Prefetch, UnitType::Int, 64);
        assert!(machine.instruction(&prefetch).is_err());
    }

    #[test]
    fn test_templates_resolve() {
        let machine = test_machine();
        let load = InstructionClass::scalar(InstrKind::Load, UnitType::Int, 64);
        let desc = machine.instruction(&load).unwrap();
        assert_eq!(desc.templates[0].cycles, vec![vec![(1, 1)]]);
        assert_eq!(desc.templates[0].async_usage, vec![(0, 1)]);
        assert_eq!(machine.restrictions_for(InstrKind::Store).count(), 1);
        assert_eq!(machine.restrictions_for(InstrKind::IntArith).count(), 0);
        assert_eq!(
            machine.bypass_latency(InstrKind::IntArith, InstrKind::Store),
            Some(0)
        );
    }

    #[test]
    fn test_unknown_unit_is_rejected() {
        let text = TEST_MACHINE.replace("cycles = [[\"MEM\"]]\nasync", "cycles = [[\"AGU\"]]\nasync");
        let config: MachineConfig = toml::from_str(&text).unwrap();
        assert!(Machine::from_config(config).is_err());
    }

    #[test]
    fn test_shipped_machine() {
        let machine = Machine::from_file("configs/generic_machine.toml").unwrap();
        assert!(machine.num_units() > 0);
        assert!(!machine.memory_levels().is_empty());
    }
}
