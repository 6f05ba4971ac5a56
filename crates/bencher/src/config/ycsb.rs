use clap::ValueEnum;
use serde::Deserialize;
use serde::Serialize;

/// Records preloaded into every guest's redis instance.
pub const YCSB_RECORD_COUNT: u64 = 3_000_000;
/// Operations issued by each go-ycsb client.
pub const YCSB_OPERATION_COUNT: u64 = 5_000_000;

/// Name of the preloaded redis dump inside the project directory.
pub fn ycsb_preloaded() -> String {
    format!("ycsb-{YCSB_RECORD_COUNT}.rdb")
}

/// YCSB core workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum YcsbWorkload {
    /// Update heavy: 50% reads, 50% updates
    A,
    /// Read mostly: 95% reads, 5% updates
    B,
    /// Read only
    C,
    /// Read latest: 95% reads, 5% inserts
    D,
    /// Short ranges: 95% scans, 5% inserts
    E,
    /// Read-modify-write: 50% reads, 50% read-modify-writes
    F,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Mix {
    read: f64,
    update: f64,
    scan: f64,
    insert: f64,
    read_modify_write: f64,
    distribution: &'static str,
}

impl YcsbWorkload {
    pub fn name(&self) -> &'static str {
        match self {
            YcsbWorkload::A => "A",
            YcsbWorkload::B => "B",
            YcsbWorkload::C => "C",
            YcsbWorkload::D => "D",
            YcsbWorkload::E => "E",
            YcsbWorkload::F => "F",
        }
    }

    fn mix(&self) -> Mix {
        let mix = |read, update, scan, insert, read_modify_write, distribution| Mix {
            read,
            update,
            scan,
            insert,
            read_modify_write,
            distribution,
        };
        match self {
            YcsbWorkload::A => mix(0.5, 0.5, 0.0, 0.0, 0.0, "uniform"),
            YcsbWorkload::B => mix(0.95, 0.05, 0.0, 0.0, 0.0, "uniform"),
            YcsbWorkload::C => mix(1.0, 0.0, 0.0, 0.0, 0.0, "uniform"),
            YcsbWorkload::D => mix(0.95, 0.0, 0.0, 0.05, 0.0, "latest"),
            YcsbWorkload::E => mix(0.0, 0.0, 0.95, 0.05, 0.0, "uniform"),
            YcsbWorkload::F => mix(0.5, 0.0, 0.0, 0.0, 0.5, "uniform"),
        }
    }

    /// go-ycsb `-p key=value` arguments selecting this workload's mix.
    pub fn go_ycsb_args(&self) -> Vec<String> {
        let mix = self.mix();
        let props = [
            "workload=core".to_string(),
            "readallfields=true".to_string(),
            format!("readproportion={}", mix.read),
            format!("updateproportion={}", mix.update),
            format!("scanproportion={}", mix.scan),
            format!("insertproportion={}", mix.insert),
            format!("readmodifywriteproportion={}", mix.read_modify_write),
            format!("requestdistribution={}", mix.distribution),
        ];
        props
            .into_iter()
            .flat_map(|prop| ["-p".to_string(), prop])
            .collect()
    }
}
