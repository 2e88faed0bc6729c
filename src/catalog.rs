use crate::stats::{Engine, Rail, Sensor, Snapshot};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Usage(Engine),
    Temperature(Sensor),
    Power(Rail),
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricDef {
    pub key: &'static str,
    pub unit: &'static str,
    pub description: &'static str,
    #[serde(skip)]
    pub field: Field,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("unsupported metric key '{0}'")]
    UnsupportedMetric(String),
}

/// Which half of a power rail reading a query selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerMode {
    #[default]
    Current,
    Average,
}

impl PowerMode {
    pub fn from_params(params: &[String]) -> Self {
        match params.first().map(String::as_str) {
            Some("avg") => PowerMode::Average,
            _ => PowerMode::Current,
        }
    }
}

const fn usage(key: &'static str, engine: Engine, description: &'static str) -> MetricDef {
    MetricDef {
        key,
        unit: "%",
        description,
        field: Field::Usage(engine),
    }
}

const fn temperature(key: &'static str, sensor: Sensor, description: &'static str) -> MetricDef {
    MetricDef {
        key,
        unit: "°C",
        description,
        field: Field::Temperature(sensor),
    }
}

const fn power(key: &'static str, rail: Rail, description: &'static str) -> MetricDef {
    MetricDef {
        key,
        unit: "mW",
        description,
        field: Field::Power(rail),
    }
}

pub const CATALOG: &[MetricDef] = &[
    usage(
        "tegrastats.emc.usage",
        Engine::Emc,
        "Percent of EMC memory bandwidth being used.",
    ),
    usage(
        "tegrastats.gpu.usage",
        Engine::Gr3d,
        "Percent of the GR3D that is being used.",
    ),
    usage(
        "tegrastats.vic.usage",
        Engine::Vic,
        "Percent of the VIC that is being used.",
    ),
    temperature(
        "tegrastats.temp.pll",
        Sensor::Pll,
        "Temperature of the PLL in degrees celsius.",
    ),
    temperature(
        "tegrastats.temp.mcpu",
        Sensor::Mcpu,
        "Temperature of the MCPU in degrees celsius.",
    ),
    temperature(
        "tegrastats.temp.pmic",
        Sensor::Pmic,
        "Temperature of the PMIC in degrees celsius.",
    ),
    temperature(
        "tegrastats.temp.tboard",
        Sensor::Tboard,
        "Temperature of the Tboard in degrees celsius.",
    ),
    temperature(
        "tegrastats.temp.gpu",
        Sensor::Gpu,
        "Temperature of the GPU in degrees celsius.",
    ),
    temperature(
        "tegrastats.temp.bcpu",
        Sensor::Bcpu,
        "Temperature of the BCPU in degrees celsius.",
    ),
    temperature(
        "tegrastats.temp.thermal",
        Sensor::Thermal,
        "Temperature of the thermal zone in degrees celsius.",
    ),
    temperature(
        "tegrastats.temp.tdiode",
        Sensor::Tdiode,
        "Temperature of the Tdiode in degrees celsius.",
    ),
    power(
        "tegrastats.power.vdd_sys_gpu",
        Rail::VddSysGpu,
        "Power consumption of VDD_SYS_GPU in milliwatts, params: [<current|avg>].",
    ),
    power(
        "tegrastats.power.vdd_sys_soc",
        Rail::VddSysSoc,
        "Power consumption of VDD_SYS_SOC in milliwatts, params: [<current|avg>].",
    ),
    power(
        "tegrastats.power.vdd_in",
        Rail::VddIn,
        "Power consumption of VDD_IN in milliwatts, params: [<current|avg>].",
    ),
    power(
        "tegrastats.power.vdd_sys_cpu",
        Rail::VddSysCpu,
        "Power consumption of VDD_SYS_CPU in milliwatts, params: [<current|avg>].",
    ),
    power(
        "tegrastats.power.vdd_sys_ddr",
        Rail::VddSysDdr,
        "Power consumption of VDD_SYS_DDR in milliwatts, params: [<current|avg>].",
    ),
];

pub fn lookup(key: &str) -> Option<&'static MetricDef> {
    CATALOG.iter().find(|def| def.key == key)
}

/// Projects one metric out of the latest snapshot.
///
/// `Ok(None)` means no snapshot has been published yet. A field the last
/// line did not carry reads as empty text.
pub fn export(
    snapshot: Option<&Snapshot>,
    key: &str,
    params: &[String],
) -> Result<Option<String>, QueryError> {
    let def = lookup(key).ok_or_else(|| QueryError::UnsupportedMetric(key.to_string()))?;
    let Some(snapshot) = snapshot else {
        return Ok(None);
    };

    let value = match def.field {
        Field::Usage(engine) => snapshot.usage(engine).map(|u| u.load.clone()),
        Field::Temperature(sensor) => snapshot.scalar(sensor).map(str::to_string),
        Field::Power(rail) => snapshot.power(rail).map(|p| match PowerMode::from_params(params) {
            PowerMode::Current => p.current.clone(),
            PowerMode::Average => p.average.clone(),
        }),
    };
    Ok(Some(value.unwrap_or_default()))
}
