use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Hardware engines reported as `<load>%` with an optional `@<MHz>` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Engine {
    #[serde(rename = "EMC_FREQ")]
    Emc,
    #[serde(rename = "GR3D_FREQ")]
    Gr3d,
    #[serde(rename = "VIC_FREQ")]
    Vic,
}

impl Engine {
    pub fn label(self) -> &'static str {
        match self {
            Engine::Emc => "EMC_FREQ",
            Engine::Gr3d => "GR3D_FREQ",
            Engine::Vic => "VIC_FREQ",
        }
    }
}

/// Single-valued fields: the APE clock, MTS load split and thermal zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Sensor {
    #[serde(rename = "APE")]
    Ape,
    #[serde(rename = "MTS_fg")]
    MtsFg,
    #[serde(rename = "MTS_bg")]
    MtsBg,
    #[serde(rename = "PLL")]
    Pll,
    #[serde(rename = "MCPU")]
    Mcpu,
    #[serde(rename = "PMIC")]
    Pmic,
    #[serde(rename = "Tboard")]
    Tboard,
    #[serde(rename = "GPU")]
    Gpu,
    #[serde(rename = "BCPU")]
    Bcpu,
    #[serde(rename = "thermal")]
    Thermal,
    #[serde(rename = "Tdiode")]
    Tdiode,
}

impl Sensor {
    pub fn label(self) -> &'static str {
        match self {
            Sensor::Ape => "APE",
            Sensor::MtsFg => "MTS_fg",
            Sensor::MtsBg => "MTS_bg",
            Sensor::Pll => "PLL",
            Sensor::Mcpu => "MCPU",
            Sensor::Pmic => "PMIC",
            Sensor::Tboard => "Tboard",
            Sensor::Gpu => "GPU",
            Sensor::Bcpu => "BCPU",
            Sensor::Thermal => "thermal",
            Sensor::Tdiode => "Tdiode",
        }
    }
}

/// Power rails reported as `<current>/<average>` milliwatts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Rail {
    #[serde(rename = "VDD_SYS_GPU")]
    VddSysGpu,
    #[serde(rename = "VDD_SYS_SOC")]
    VddSysSoc,
    #[serde(rename = "VDD_IN")]
    VddIn,
    #[serde(rename = "VDD_SYS_CPU")]
    VddSysCpu,
    #[serde(rename = "VDD_SYS_DDR")]
    VddSysDdr,
}

impl Rail {
    pub fn label(self) -> &'static str {
        match self {
            Rail::VddSysGpu => "VDD_SYS_GPU",
            Rail::VddSysSoc => "VDD_SYS_SOC",
            Rail::VddIn => "VDD_IN",
            Rail::VddSysCpu => "VDD_SYS_CPU",
            Rail::VddSysDdr => "VDD_SYS_DDR",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub load: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Power {
    pub current: String,
    pub average: String,
}

/// One parsed `tegrastats` line. Values keep the exact decimal text of the
/// source line; a field missing from the line is absent here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    usage: BTreeMap<Engine, Usage>,
    scalars: BTreeMap<Sensor, String>,
    power: BTreeMap<Rail, Power>,
}

impl Snapshot {
    pub fn usage(&self, engine: Engine) -> Option<&Usage> {
        self.usage.get(&engine)
    }

    pub fn scalar(&self, sensor: Sensor) -> Option<&str> {
        self.scalars.get(&sensor).map(String::as_str)
    }

    pub fn power(&self, rail: Rail) -> Option<&Power> {
        self.power.get(&rail)
    }

    pub fn usages(&self) -> impl Iterator<Item = (Engine, &Usage)> {
        self.usage.iter().map(|(k, v)| (*k, v))
    }

    pub fn scalars(&self) -> impl Iterator<Item = (Sensor, &str)> {
        self.scalars.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn rails(&self) -> impl Iterator<Item = (Rail, &Power)> {
        self.power.iter().map(|(k, v)| (*k, v))
    }

    pub fn field_count(&self) -> usize {
        self.usage.len() + self.scalars.len() + self.power.len()
    }

    pub fn is_empty(&self) -> bool {
        self.field_count() == 0
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Usage(Engine),
    Scalar(Sensor),
    ScalarPair(Sensor, Sensor),
    Power(Rail),
}

impl Target {
    fn capture_groups(self) -> usize {
        match self {
            Target::Scalar(_) => 1,
            Target::Usage(_) | Target::ScalarPair(..) | Target::Power(_) => 2,
        }
    }
}

struct FieldPattern {
    target: Target,
    pattern: &'static str,
}

// Every pattern starts at a word boundary so `GPU@` cannot match the tail of
// `VDD_SYS_GPU` and `MCPU@` cannot match inside another label.
const FIELD_PATTERNS: &[FieldPattern] = &[
    FieldPattern {
        target: Target::Usage(Engine::Emc),
        pattern: r"\bEMC_FREQ (\d+)%(?:@(\d+))?",
    },
    FieldPattern {
        target: Target::Usage(Engine::Gr3d),
        pattern: r"\bGR3D_FREQ (\d+)%(?:@(\d+))?",
    },
    FieldPattern {
        target: Target::Usage(Engine::Vic),
        pattern: r"\bVIC_FREQ (\d+)%(?:@(\d+))?",
    },
    FieldPattern {
        target: Target::Scalar(Sensor::Ape),
        pattern: r"\bAPE (\d+)",
    },
    FieldPattern {
        target: Target::ScalarPair(Sensor::MtsFg, Sensor::MtsBg),
        pattern: r"\bMTS fg (\d+)% bg (\d+)%",
    },
    FieldPattern {
        target: Target::Scalar(Sensor::Pll),
        pattern: r"\bPLL@(\d+(?:\.\d+)?)C",
    },
    FieldPattern {
        target: Target::Scalar(Sensor::Mcpu),
        pattern: r"\bMCPU@(\d+(?:\.\d+)?)C",
    },
    FieldPattern {
        target: Target::Scalar(Sensor::Pmic),
        pattern: r"\bPMIC@(\d+(?:\.\d+)?)C",
    },
    FieldPattern {
        target: Target::Scalar(Sensor::Tboard),
        pattern: r"\bTboard@(\d+(?:\.\d+)?)C",
    },
    FieldPattern {
        target: Target::Scalar(Sensor::Gpu),
        pattern: r"\bGPU@(\d+(?:\.\d+)?)C",
    },
    FieldPattern {
        target: Target::Scalar(Sensor::Bcpu),
        pattern: r"\bBCPU@(\d+(?:\.\d+)?)C",
    },
    FieldPattern {
        target: Target::Scalar(Sensor::Thermal),
        pattern: r"\bthermal@(\d+(?:\.\d+)?)C",
    },
    FieldPattern {
        target: Target::Scalar(Sensor::Tdiode),
        pattern: r"\bTdiode@(\d+(?:\.\d+)?)C",
    },
    FieldPattern {
        target: Target::Power(Rail::VddSysGpu),
        pattern: r"\bVDD_SYS_GPU (\d+)/(\d+)",
    },
    FieldPattern {
        target: Target::Power(Rail::VddSysSoc),
        pattern: r"\bVDD_SYS_SOC (\d+)/(\d+)",
    },
    FieldPattern {
        target: Target::Power(Rail::VddIn),
        pattern: r"\bVDD_IN (\d+)/(\d+)",
    },
    FieldPattern {
        target: Target::Power(Rail::VddSysCpu),
        pattern: r"\bVDD_SYS_CPU (\d+)/(\d+)",
    },
    FieldPattern {
        target: Target::Power(Rail::VddSysDdr),
        pattern: r"\bVDD_SYS_DDR (\d+)/(\d+)",
    },
];

static COMPILED_FIELDS: LazyLock<Vec<(Target, Regex)>> = LazyLock::new(|| {
    FIELD_PATTERNS
        .iter()
        .map(|field| {
            let re = Regex::new(field.pattern).expect("field pattern must compile");
            (field.target, re)
        })
        .collect()
});

/// Parses one line of `tegrastats` output. Never fails: fields that do not
/// match are left absent and unknown text is ignored.
pub fn parse(line: &str) -> Snapshot {
    let mut snapshot = Snapshot::default();
    for (target, re) in COMPILED_FIELDS.iter() {
        if let Some(caps) = re.captures(line) {
            debug_assert_eq!(re.captures_len() - 1, target.capture_groups());
            apply(*target, &caps, &mut snapshot);
        }
    }
    snapshot
}

fn apply(target: Target, caps: &Captures<'_>, snapshot: &mut Snapshot) {
    let group = |i: usize| caps.get(i).map(|m| m.as_str().to_string());
    match target {
        Target::Usage(engine) => {
            if let Some(load) = group(1) {
                let frequency = group(2);
                snapshot.usage.insert(engine, Usage { load, frequency });
            }
        }
        Target::Scalar(sensor) => {
            if let Some(value) = group(1) {
                snapshot.scalars.insert(sensor, value);
            }
        }
        Target::ScalarPair(first, second) => {
            if let (Some(a), Some(b)) = (group(1), group(2)) {
                snapshot.scalars.insert(first, a);
                snapshot.scalars.insert(second, b);
            }
        }
        Target::Power(rail) => {
            if let (Some(current), Some(average)) = (group(1), group(2)) {
                snapshot.power.insert(rail, Power { current, average });
            }
        }
    }
}
