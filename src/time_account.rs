use crate::{ASYNC_UNIT_BASE, Machine};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, btree_map::Entry},
    fmt,
    ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Sub, SubAssign},
};

/// Unit index recorded when the unit behind extra scheduling time is unknown.
pub const DEFAULT_UNIT: i32 = 0x7ffff;

const UNIT_SHIFT: u32 = 4;
const UNIT_BITS: u32 = 20;
const UNIT_MASK: u32 = (1 << UNIT_BITS) - 1;
const SUB_FAMILY_MASK: u32 = 0xf;
const CATEGORY_SHIFT: u32 = 24;

/// Ledger categories. The discriminant lands in the top byte of a key.
#[repr(u8)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeCategory {
    MemLatExecution = 0x01,
    MemBandwidthExecution = 0x02,
    SchedulingTotal = 0x03,
    LackOfResourcesLost = 0x04,
    InstrParallelismLost = 0x05,
    VectorizationLost = 0x06,
    MinimumApplication = 0x08,
    MinimumResources = 0x09,
    RetiredUops = 0x0a,
    RetiredUopsType = 0x0b,
    MemoryOverlap = 0x0c,
    MemoryStall = 0x0d,
    MemoryBandwidthTotal = 0x0e,
    ImprovementFromFpga = 0x0f,
    FpgaComputation = 0x10,
    FpgaTransfer = 0x11,
    MemoryReferences = 0x12,
    CacheMisses = 0x13,
    NonStreamable = 0x14,
    StreamBin = 0x15,
    MemoryPenaltyTotal = 0x20,
    ApplicationDependency = 0x21,
    LackOfResourcesTotal = 0x22,
    SchedulingExtraTotal = 0x23,
    MemoryPenaltyLevel = 0x24,
    MemoryBandwidthLevel = 0x25,
    BandwidthRequiredLevel = 0x26,
    LackOfResources = 0x30,
    SchedulingExtra = 0x31,
    Vectorization = 0x32,
    MemoryFootprintLevel = 0x34,
    MissCountLevel = 0x35,
    ResourceUsage = 0x40,
}

impl TimeCategory {
    const ALL: [TimeCategory; 33] = [
        TimeCategory::MemLatExecution,
        TimeCategory::MemBandwidthExecution,
        TimeCategory::SchedulingTotal,
        TimeCategory::LackOfResourcesLost,
        TimeCategory::InstrParallelismLost,
        TimeCategory::VectorizationLost,
        TimeCategory::MinimumApplication,
        TimeCategory::MinimumResources,
        TimeCategory::RetiredUops,
        TimeCategory::RetiredUopsType,
        TimeCategory::MemoryOverlap,
        TimeCategory::MemoryStall,
        TimeCategory::MemoryBandwidthTotal,
        TimeCategory::ImprovementFromFpga,
        TimeCategory::FpgaComputation,
        TimeCategory::FpgaTransfer,
        TimeCategory::MemoryReferences,
        TimeCategory::CacheMisses,
        TimeCategory::NonStreamable,
        TimeCategory::StreamBin,
        TimeCategory::MemoryPenaltyTotal,
        TimeCategory::ApplicationDependency,
        TimeCategory::LackOfResourcesTotal,
        TimeCategory::SchedulingExtraTotal,
        TimeCategory::MemoryPenaltyLevel,
        TimeCategory::MemoryBandwidthLevel,
        TimeCategory::BandwidthRequiredLevel,
        TimeCategory::LackOfResources,
        TimeCategory::SchedulingExtra,
        TimeCategory::Vectorization,
        TimeCategory::MemoryFootprintLevel,
        TimeCategory::MissCountLevel,
        TimeCategory::ResourceUsage,
    ];

    pub fn from_code(code: u8) -> Option<TimeCategory> {
        Self::ALL.iter().copied().find(|c| *c as u8 == code)
    }

    /// Merging sums values of aggregating categories. Other categories only
    /// get a zero placeholder so they stay visible in the merged ledger.
    pub fn aggregates(self) -> bool {
        !matches!(
            self,
            TimeCategory::ImprovementFromFpga
                | TimeCategory::FpgaComputation
                | TimeCategory::FpgaTransfer
                | TimeCategory::MemoryFootprintLevel
        )
    }

    pub fn computes_percent(self) -> bool {
        !matches!(
            self,
            TimeCategory::BandwidthRequiredLevel
                | TimeCategory::ImprovementFromFpga
                | TimeCategory::FpgaComputation
                | TimeCategory::FpgaTransfer
        )
    }

    pub fn display_by_default(self, verbose: bool) -> bool {
        match self {
            TimeCategory::BandwidthRequiredLevel | TimeCategory::SchedulingExtra => verbose,
            _ => true,
        }
    }

    pub fn acts_as_threshold(self) -> bool {
        !matches!(
            self,
            TimeCategory::RetiredUopsType
                | TimeCategory::MemoryPenaltyLevel
                | TimeCategory::MemoryBandwidthLevel
                | TimeCategory::BandwidthRequiredLevel
                | TimeCategory::SchedulingExtra
                | TimeCategory::MemoryFootprintLevel
                | TimeCategory::LackOfResources
                | TimeCategory::Vectorization
        )
    }

    fn is_lost_time(self) -> bool {
        matches!(
            self,
            TimeCategory::LackOfResourcesLost
                | TimeCategory::InstrParallelismLost
                | TimeCategory::VectorizationLost
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubFamily {
    Total = 0,
    Irregular = 1,
    Fragmentation = 2,
}

impl SubFamily {
    fn from_bits(bits: u32) -> Option<SubFamily> {
        match bits {
            0 => Some(SubFamily::Total),
            1 => Some(SubFamily::Irregular),
            2 => Some(SubFamily::Fragmentation),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RetiredUopType {
    Invalid = 0,
    LoopCond,
    AddrGen,
    StackTmp,
    RegMove,
    FpWork,
    IntWork,
    MemWork,
    Branches,
    Prefetch,
    Nop,
}

impl RetiredUopType {
    const ALL: [RetiredUopType; 11] = [
        RetiredUopType::Invalid,
        RetiredUopType::LoopCond,
        RetiredUopType::AddrGen,
        RetiredUopType::StackTmp,
        RetiredUopType::RegMove,
        RetiredUopType::FpWork,
        RetiredUopType::IntWork,
        RetiredUopType::MemWork,
        RetiredUopType::Branches,
        RetiredUopType::Prefetch,
        RetiredUopType::Nop,
    ];

    pub fn from_index(index: i32) -> Option<RetiredUopType> {
        Self::ALL.get(usize::try_from(index).ok()?).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            RetiredUopType::Invalid => "Invalid",
            RetiredUopType::LoopCond => "LoopCond",
            RetiredUopType::AddrGen => "AddrGen",
            RetiredUopType::StackTmp => "StackTmp",
            RetiredUopType::RegMove => "RegMove",
            RetiredUopType::FpWork => "FpWork",
            RetiredUopType::IntWork => "IntWork",
            RetiredUopType::MemWork => "MemWork",
            RetiredUopType::Branches => "Branches",
            RetiredUopType::Prefetch => "Prefetch",
            RetiredUopType::Nop => "Nop",
        }
    }
}

/// Packed ledger key: category in bits 24..32, signed unit index in bits
/// 4..24, sub-family in bits 0..4.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TimeKey(u32);

impl TimeKey {
    pub fn new(category: TimeCategory, unit: i32, sub: SubFamily) -> TimeKey {
        assert!(
            (-(1 << (UNIT_BITS - 1))..(1 << (UNIT_BITS - 1))).contains(&unit),
            "unit index {unit} does not fit a ledger key"
        );
        TimeKey(
            ((category as u32) << CATEGORY_SHIFT)
                | (((unit as u32) & UNIT_MASK) << UNIT_SHIFT)
                | sub as u32,
        )
    }

    /// Key of a category that has no unit.
    pub fn of(category: TimeCategory) -> TimeKey {
        TimeKey::new(category, 0, SubFamily::Total)
    }

    pub fn for_unit(category: TimeCategory, unit: i32) -> TimeKey {
        TimeKey::new(category, unit, SubFamily::Total)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn category(self) -> Option<TimeCategory> {
        TimeCategory::from_code((self.0 >> CATEGORY_SHIFT) as u8)
    }

    pub fn unit(self) -> i32 {
        let field = (self.0 >> UNIT_SHIFT) & UNIT_MASK;
        // sign extend the 20-bit field
        ((field << (32 - UNIT_BITS)) as i32) >> (32 - UNIT_BITS)
    }

    pub fn sub_family(self) -> Option<SubFamily> {
        SubFamily::from_bits(self.0 & SUB_FAMILY_MASK)
    }

    pub fn long_name(self, machine: &Machine) -> String {
        let unit = self.unit();
        let level = |m: &Machine| {
            m.memory_levels()
                .get(unit.max(0) as usize)
                .map(|l| (l.name.clone(), l.next.clone()))
                .unwrap_or_else(|| (format!("L{unit}"), "?".to_string()))
        };
        let Some(category) = self.category() else {
            return format!("Unknown category {:#x}", self.0);
        };
        match category {
            TimeCategory::MemLatExecution => "Memory latency execution time".to_string(),
            TimeCategory::MemBandwidthExecution => "Memory bandwidth execution time".to_string(),
            TimeCategory::SchedulingTotal => "Total scheduling time".to_string(),
            TimeCategory::MinimumApplication => "Infinite resources time".to_string(),
            TimeCategory::MinimumResources => "No dependencies time".to_string(),
            TimeCategory::MemoryOverlap => "Memory overlap time".to_string(),
            TimeCategory::MemoryStall => "Memory stall time".to_string(),
            TimeCategory::RetiredUops => "Retired micro-ops".to_string(),
            TimeCategory::RetiredUopsType => format!(
                "Retired {} micro-ops",
                RetiredUopType::from_index(unit).map_or("Unknown", |t| t.name())
            ),
            TimeCategory::MemoryReferences => "Num memory accesses".to_string(),
            TimeCategory::CacheMisses => "Num cache misses".to_string(),
            TimeCategory::NonStreamable => "Non-streamable accesses".to_string(),
            TimeCategory::StreamBin => format!("Stream bin {unit} streams"),
            TimeCategory::ImprovementFromFpga => "Performance gain from FPGA".to_string(),
            TimeCategory::FpgaComputation => "FPGA computation cost".to_string(),
            TimeCategory::FpgaTransfer => "FPGA data transfer cost".to_string(),
            TimeCategory::LackOfResourcesLost => {
                "Maximum improvement from additional CPU resources".to_string()
            }
            TimeCategory::InstrParallelismLost => {
                "Maximum improvement from additional instruction parallelism".to_string()
            }
            TimeCategory::VectorizationLost => {
                "Maximum improvement from ideal vectorization".to_string()
            }
            TimeCategory::MemoryPenaltyTotal => "Memory penalty total time".to_string(),
            TimeCategory::MemoryBandwidthTotal => "Memory bandwidth total delays".to_string(),
            TimeCategory::ApplicationDependency => "Application dependency time".to_string(),
            TimeCategory::LackOfResourcesTotal => "Lack of resources total time".to_string(),
            TimeCategory::SchedulingExtraTotal => "Scheduling total extra time".to_string(),
            TimeCategory::MemoryPenaltyLevel => format!("Memory penalty {}", level(machine).0),
            TimeCategory::MemoryBandwidthLevel => {
                let (name, next) = level(machine);
                format!("Bandwidth delays {next}-{name}")
            }
            TimeCategory::BandwidthRequiredLevel => {
                let (name, next) = level(machine);
                format!("Bandwidth requirements {next}-{name}")
            }
            TimeCategory::MissCountLevel => match self.sub_family() {
                Some(SubFamily::Irregular) => {
                    format!("Irregular access misses {}", level(machine).0)
                }
                Some(SubFamily::Fragmentation) => {
                    format!("Non stride one misses {}", level(machine).0)
                }
                _ => format!("Miss count {}", level(machine).0),
            },
            TimeCategory::MemoryFootprintLevel => format!("Footprint {}", level(machine).0),
            TimeCategory::LackOfResources => unit_phrase(
                machine,
                unit,
                "Bottleneck on async resource ",
                "Bottleneck on unit ",
                "Restriction from rule ",
            ),
            TimeCategory::Vectorization => unit_phrase(
                machine,
                unit,
                "Vectorization bottleneck on async resource ",
                "Vectorization bottleneck on unit ",
                "Vectorization restriction from rule ",
            ),
            TimeCategory::ResourceUsage => {
                if (0..ASYNC_UNIT_BASE).contains(&unit) {
                    format!("Cycles unit {} was in use", machine.ledger_unit_name(unit))
                } else {
                    format!("Usage of {}", machine.ledger_unit_name(unit))
                }
            }
            TimeCategory::SchedulingExtra => {
                if unit == DEFAULT_UNIT {
                    "Extra time due to undetermined unit".to_string()
                } else {
                    unit_phrase(
                        machine,
                        unit,
                        "Extra time due to async resource ",
                        "Extra time due to unit ",
                        "Extra time due to rule ",
                    )
                }
            }
        }
    }

    pub fn short_name(self, machine: &Machine) -> String {
        let unit = self.unit();
        let level = |m: &Machine| {
            m.memory_levels()
                .get(unit.max(0) as usize)
                .map(|l| (l.name.clone(), l.next.clone()))
                .unwrap_or_else(|| (format!("L{unit}"), "?".to_string()))
        };
        let Some(category) = self.category() else {
            return format!("{:#x}", self.0);
        };
        let prefixed = |prefix: &str, restrict: &str| {
            if unit < 0 {
                format!("{restrict}{}", machine.ledger_unit_name(unit))
            } else {
                format!("{prefix}{}", machine.ledger_unit_name(unit))
            }
        };
        match category {
            TimeCategory::MemLatExecution => "MemLatExecTime".to_string(),
            TimeCategory::MemBandwidthExecution => "MemBdwthExecTime".to_string(),
            TimeCategory::SchedulingTotal => "CPU_Time".to_string(),
            TimeCategory::MinimumApplication => "InfCpuRes".to_string(),
            TimeCategory::MinimumResources => "NoDepend".to_string(),
            TimeCategory::ImprovementFromFpga => "FPGA_Gain".to_string(),
            TimeCategory::FpgaComputation => "FpgaCpuCost".to_string(),
            TimeCategory::FpgaTransfer => "FpgaBdwthCost".to_string(),
            TimeCategory::LackOfResourcesLost => "GainExtraRes".to_string(),
            TimeCategory::MemoryOverlap => "MemoryOverlap".to_string(),
            TimeCategory::MemoryStall => "MemoryStalls".to_string(),
            TimeCategory::RetiredUops => "RetiredUops".to_string(),
            TimeCategory::RetiredUopsType => RetiredUopType::from_index(unit)
                .map_or("Unknown", |t| t.name())
                .to_string(),
            TimeCategory::MemoryReferences => "MemoryAccesses".to_string(),
            TimeCategory::CacheMisses => "CacheMisses".to_string(),
            TimeCategory::NonStreamable => "NotAStream".to_string(),
            TimeCategory::StreamBin => format!("Bin{unit}Streams"),
            TimeCategory::InstrParallelismLost => "GainExtraILP".to_string(),
            TimeCategory::VectorizationLost => "GainVectorize".to_string(),
            TimeCategory::MemoryPenaltyTotal => "MemoryTime".to_string(),
            TimeCategory::MemoryBandwidthTotal => "BdwthDelays".to_string(),
            TimeCategory::ApplicationDependency => "AppDepTime".to_string(),
            TimeCategory::LackOfResourcesTotal => "CPUBottleneck".to_string(),
            TimeCategory::SchedulingExtraTotal => "SchedExtraTime".to_string(),
            TimeCategory::MemoryPenaltyLevel => format!("Penalty_{}", level(machine).0),
            TimeCategory::MemoryBandwidthLevel => {
                let (name, next) = level(machine);
                format!("{next}-{name}_BdwthDelay")
            }
            TimeCategory::BandwidthRequiredLevel => {
                let (name, next) = level(machine);
                format!("{next}-{name}_ReqBdwth")
            }
            TimeCategory::MissCountLevel => match self.sub_family() {
                Some(SubFamily::Irregular) => format!("IrregMiss_{}", level(machine).0),
                Some(SubFamily::Fragmentation) => format!("FragMiss_{}", level(machine).0),
                _ => format!("Misses_{}", level(machine).0),
            },
            TimeCategory::MemoryFootprintLevel => format!("{}_FootPrint", level(machine).0),
            TimeCategory::LackOfResources => prefixed("CPU_", "RESTRICT_"),
            TimeCategory::Vectorization => prefixed("V_CPU_", "V_RESTRICT_"),
            TimeCategory::ResourceUsage => prefixed("InUse_", "InUse_"),
            TimeCategory::SchedulingExtra => {
                if unit == DEFAULT_UNIT {
                    "SET_Unknown".to_string()
                } else {
                    prefixed("SET_", "SET_RESTRICT_")
                }
            }
        }
    }
}

fn unit_phrase(machine: &Machine, unit: i32, async_: &str, unit_: &str, rule: &str) -> String {
    let name = machine.ledger_unit_name(unit);
    if unit >= ASYNC_UNIT_BASE {
        format!("{async_}{name}")
    } else if unit >= 0 {
        format!("{unit_}{name}")
    } else {
        format!("{rule}{name}")
    }
}

impl fmt::Display for TimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category() {
            Some(c) => write!(f, "{:?}[{}]", c, self.unit()),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

/// Cycle attribution ledger.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct TimeAccount {
    data: BTreeMap<TimeKey, f64>,
}

impl TimeAccount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TimeKey, f64)> + '_ {
        self.data.iter().map(|(k, v)| (*k, *v))
    }

    pub fn get(&self, key: TimeKey) -> Option<f64> {
        self.data.get(&key).copied()
    }

    /// Value of `key`, zero when absent.
    pub fn value(&self, key: TimeKey) -> f64 {
        self.get(key).unwrap_or(0.0)
    }

    /// Insert or accumulate.
    pub fn add_value(&mut self, key: TimeKey, amount: f64) {
        *self.data.entry(key).or_insert(0.0) += amount;
    }

    fn add(&mut self, category: TimeCategory, amount: f64) {
        self.add_value(TimeKey::of(category), amount);
    }

    pub fn add_execution_time(&mut self, cycles: f64) {
        self.add(TimeCategory::SchedulingTotal, cycles);
    }

    pub fn add_resource_usage(&mut self, unit: i32, cycles: f64) {
        self.add_value(TimeKey::for_unit(TimeCategory::ResourceUsage, unit), cycles);
    }

    pub fn add_dependency_time(&mut self, cycles: f64) {
        self.add(TimeCategory::ApplicationDependency, cycles);
        self.add(TimeCategory::SchedulingTotal, cycles);
        self.add(TimeCategory::MemLatExecution, cycles);
    }

    pub fn add_resources_time(&mut self, unit: i32, cycles: f64) {
        self.add_value(TimeKey::for_unit(TimeCategory::LackOfResources, unit), cycles);
        self.add(TimeCategory::LackOfResourcesTotal, cycles);
        self.add(TimeCategory::SchedulingTotal, cycles);
        self.add(TimeCategory::MemLatExecution, cycles);
    }

    /// Time the scheduler added above both lower bounds.
    pub fn add_scheduling_time(&mut self, unit: i32, cycles: f64, verbose: bool) {
        let family = if verbose {
            TimeCategory::SchedulingExtra
        } else {
            TimeCategory::LackOfResources
        };
        self.add_value(TimeKey::for_unit(family, unit), cycles);
        self.add(TimeCategory::SchedulingExtraTotal, cycles);
        self.add(TimeCategory::SchedulingTotal, cycles);
        self.add(TimeCategory::MemLatExecution, cycles);
    }

    pub fn add_application_minimum_time(&mut self, cycles: f64) {
        self.add(TimeCategory::MinimumApplication, cycles);
        self.add(TimeCategory::LackOfResourcesLost, -cycles);
    }

    pub fn add_resources_minimum_time(&mut self, cycles: f64) {
        self.add(TimeCategory::MinimumResources, cycles);
        self.add(TimeCategory::InstrParallelismLost, -cycles);
    }

    pub fn add_ideal_vectorization_time(&mut self, unit: i32, cycles: f64) {
        self.add_value(TimeKey::for_unit(TimeCategory::Vectorization, unit), cycles);
        self.add(TimeCategory::VectorizationLost, -cycles);
    }

    pub fn add_memory_overlap_time(&mut self, cycles: f64) {
        self.add(TimeCategory::MemoryOverlap, cycles);
    }

    pub fn add_memory_stall_time(&mut self, cycles: f64) {
        self.add(TimeCategory::MemoryStall, cycles);
        self.add(TimeCategory::MemLatExecution, cycles);
    }

    pub fn add_retired_uops(&mut self, kind: RetiredUopType, count: f64) {
        self.add_value(
            TimeKey::for_unit(TimeCategory::RetiredUopsType, kind as i32),
            count,
        );
        self.add(TimeCategory::RetiredUops, count);
    }

    pub fn add_memory_references(&mut self, count: f64) {
        self.add(TimeCategory::MemoryReferences, count);
    }

    pub fn add_cache_misses(&mut self, count: f64) {
        self.add(TimeCategory::CacheMisses, count);
    }

    pub fn add_non_streamable(&mut self, count: f64) {
        self.add(TimeCategory::NonStreamable, count);
    }

    pub fn add_stream_bin(&mut self, bin: i32, count: f64) {
        self.add_value(TimeKey::for_unit(TimeCategory::StreamBin, bin), count);
    }

    pub fn add_fpga_computation_time(&mut self, cycles: f64) {
        self.add(TimeCategory::FpgaComputation, cycles);
        self.add(TimeCategory::ImprovementFromFpga, -cycles);
    }

    /// Transfer cost only reduces an improvement opened by a computation cost.
    pub fn add_fpga_transfer_time(&mut self, cycles: f64) {
        self.add(TimeCategory::FpgaTransfer, cycles);
        if let Some(gain) = self.data.get_mut(&TimeKey::of(TimeCategory::ImprovementFromFpga)) {
            *gain -= cycles;
        }
    }

    pub fn add_non_fpga_compute_time(&mut self, cycles: f64) {
        if let Some(gain) = self.data.get_mut(&TimeKey::of(TimeCategory::ImprovementFromFpga)) {
            if *gain < 0.0 {
                *gain += cycles;
            }
        }
    }

    pub fn add_memory_footprint_level(&mut self, level: i32, footprint: f64) {
        self.add_value(
            TimeKey::for_unit(TimeCategory::MemoryFootprintLevel, level),
            footprint,
        );
    }

    /// Record misses at `level` and the penalty and bandwidth they imply.
    pub fn add_miss_count_level(&mut self, machine: &Machine, level: i32, misses: f64) {
        self.add_level_misses(machine, level, misses, true);
    }

    /// Same as [`TimeAccount::add_miss_count_level`] without charging the
    /// memory latency execution total.
    pub fn add_reuse_miss_count_level(&mut self, machine: &Machine, level: i32, misses: f64) {
        self.add_level_misses(machine, level, misses, false);
    }

    fn add_level_misses(&mut self, machine: &Machine, level: i32, misses: f64, charge: bool) {
        let Some(mhl) = machine.memory_levels().get(level.max(0) as usize) else {
            warn!("Memory level {level} is not declared by machine {}", machine.name);
            return;
        };
        self.add_value(TimeKey::for_unit(TimeCategory::MissCountLevel, level), misses);
        let cycles = misses * mhl.miss_penalty;
        let bandwidth = if mhl.entry_size > 0 {
            misses * mhl.entry_size as f64
        } else {
            0.0
        };
        self.add_value(TimeKey::for_unit(TimeCategory::MemoryPenaltyLevel, level), cycles);
        self.add(TimeCategory::MemoryPenaltyTotal, cycles);
        if charge {
            self.add(TimeCategory::MemLatExecution, cycles);
        }
        if bandwidth > 0.0 {
            self.add_value(
                TimeKey::for_unit(TimeCategory::BandwidthRequiredLevel, level),
                bandwidth,
            );
        }
    }

    pub fn add_total_miss_count_level(&mut self, level: i32, misses: f64) {
        self.add_value(TimeKey::for_unit(TimeCategory::MissCountLevel, level), misses);
    }

    pub fn add_irregular_miss_count_level(&mut self, level: i32, misses: f64) {
        self.add_value(
            TimeKey::new(TimeCategory::MissCountLevel, level, SubFamily::Irregular),
            misses,
        );
    }

    pub fn add_fragmentation_miss_count_level(&mut self, level: i32, misses: f64) {
        self.add_value(
            TimeKey::new(TimeCategory::MissCountLevel, level, SubFamily::Fragmentation),
            misses,
        );
    }

    /// Derive bandwidth delays per memory level from the required bytes and
    /// the level's peak bandwidth. The total delay is the worst level.
    pub fn compute_bandwidth_time(&mut self, machine: &Machine) {
        let cpu_time = self.total_cpu_time();
        let mut max_penalty = 0.0f64;
        let mut memlat_penalty = 0.0;
        for (i, mhl) in machine.memory_levels().iter().enumerate() {
            let level = i as i32;
            let required = self.value(TimeKey::for_unit(TimeCategory::BandwidthRequiredLevel, level));
            if required <= 0.0 || mhl.bandwidth < 0.0 {
                continue;
            }
            if mhl.bandwidth == 0.0 {
                memlat_penalty +=
                    self.value(TimeKey::for_unit(TimeCategory::MemoryPenaltyLevel, level));
                continue;
            }
            let penalty = required / mhl.bandwidth;
            if penalty > cpu_time {
                let delay = penalty - cpu_time;
                self.data.insert(
                    TimeKey::for_unit(TimeCategory::MemoryBandwidthLevel, level),
                    delay,
                );
                max_penalty = max_penalty.max(delay);
            }
        }
        if max_penalty > 0.0 {
            self.data
                .insert(TimeKey::of(TimeCategory::MemoryBandwidthTotal), max_penalty);
        }
        let total = max_penalty + cpu_time + memlat_penalty;
        if total > 0.01 {
            self.data
                .insert(TimeKey::of(TimeCategory::MemBandwidthExecution), total);
        }
    }

    pub fn total_cpu_time(&self) -> f64 {
        self.value(TimeKey::of(TimeCategory::SchedulingTotal))
    }

    pub fn no_dependency_time(&self) -> f64 {
        self.value(TimeKey::of(TimeCategory::MinimumResources))
    }

    /// Value as it should be shown: lost time is relative to the total
    /// scheduling time and bandwidth requirements are per cycle.
    pub fn display_value(&self, key: TimeKey) -> f64 {
        let Some(value) = self.get(key) else {
            return 0.0;
        };
        match key.category() {
            Some(c) if c.is_lost_time() => value + self.total_cpu_time(),
            Some(TimeCategory::BandwidthRequiredLevel) => {
                let cpu = self.total_cpu_time();
                if cpu > 0.5 { value / cpu } else { 0.0 }
            }
            _ => value,
        }
    }

    fn merge(&mut self, other: &TimeAccount, sign: f64) {
        for (key, value) in &other.data {
            let aggregates = key.category().is_none_or(|c| c.aggregates());
            match self.data.entry(*key) {
                Entry::Occupied(mut e) => {
                    if aggregates {
                        *e.get_mut() += sign * value;
                    }
                }
                Entry::Vacant(e) => {
                    e.insert(if aggregates { sign * value } else { 0.0 });
                }
            }
        }
    }

    fn scale(&mut self, factor: f64) {
        for value in self.data.values_mut() {
            *value *= factor;
        }
    }
}

impl AddAssign<&TimeAccount> for TimeAccount {
    fn add_assign(&mut self, other: &TimeAccount) {
        self.merge(other, 1.0);
    }
}

impl SubAssign<&TimeAccount> for TimeAccount {
    fn sub_assign(&mut self, other: &TimeAccount) {
        self.merge(other, -1.0);
    }
}

impl Add<&TimeAccount> for TimeAccount {
    type Output = TimeAccount;

    fn add(mut self, other: &TimeAccount) -> TimeAccount {
        self += other;
        self
    }
}

impl Sub<&TimeAccount> for TimeAccount {
    type Output = TimeAccount;

    fn sub(mut self, other: &TimeAccount) -> TimeAccount {
        self -= other;
        self
    }
}

impl MulAssign<f64> for TimeAccount {
    fn mul_assign(&mut self, factor: f64) {
        self.scale(factor);
    }
}

impl Mul<f64> for TimeAccount {
    type Output = TimeAccount;

    fn mul(mut self, factor: f64) -> TimeAccount {
        self *= factor;
        self
    }
}

impl DivAssign<f64> for TimeAccount {
    fn div_assign(&mut self, factor: f64) {
        if factor == 0.0 {
            error!("Time account divided by zero, values left unchanged");
            return;
        }
        self.scale(1.0 / factor);
    }
}

impl Div<f64> for TimeAccount {
    type Output = TimeAccount;

    fn div(mut self, factor: f64) -> TimeAccount {
        self /= factor;
        self
    }
}
