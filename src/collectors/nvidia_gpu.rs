use crate::gpu_path::{GpuInstancePath, MultiStringBuilder};
use crate::telemetry_group::GpuCounters;
use log::{debug, info};
use std::collections::HashMap;
use std::process::Command;

/// Per-process GPU engine counters from `nvidia-smi pmon`.
///
/// Every row of one `pmon` sample becomes up to three instances named
/// `pid_<pid>_gpu_<index>_engtype_<engine>`. Utilization values belong to
/// the enumeration that produced them and are handed out once.
pub struct NvidiaGpu {
    pub device_ids: Vec<u32>,
    utilization: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PmonRow {
    pub gpu: u32,
    pub pid: u64,
    pub sm: Option<f64>,
    pub enc: Option<f64>,
    pub dec: Option<f64>,
}

impl NvidiaGpu {
    pub fn new(device_ids: Vec<u32>) -> Self {
        Self {
            device_ids,
            utilization: HashMap::new(),
        }
    }

    fn run_pmon(&self) -> Option<String> {
        let mut command = Command::new("nvidia-smi");
        command.args(["pmon", "-c", "1", "-s", "u"]);
        if !self.device_ids.is_empty() {
            let ids: Vec<String> = self.device_ids.iter().map(|id| id.to_string()).collect();
            command.args(["-i", &ids.join(",")]);
        }
        match command.output() {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                debug!("nvidia-smi pmon exited with {}", output.status);
                None
            }
            Err(e) => {
                debug!("Failed to run nvidia-smi pmon: {}", e);
                None
            }
        }
    }
}

impl Default for NvidiaGpu {
    fn default() -> Self {
        // All devices
        Self::new(Vec::new())
    }
}

/// Parse `nvidia-smi pmon -s u` output. Column positions come from the
/// header line; rows without a process are skipped.
pub fn parse_pmon(output: &str) -> Vec<PmonRow> {
    let mut lines = output.lines();
    let Some(header) = lines.find(|line| line.starts_with('#') && line.contains("pid")) else {
        return Vec::new();
    };
    let columns: Vec<&str> = header.trim_start_matches('#').split_whitespace().collect();
    let position = |name: &str| columns.iter().position(|column| *column == name);
    let (Some(gpu_col), Some(pid_col)) = (position("gpu"), position("pid")) else {
        return Vec::new();
    };
    let (sm_col, enc_col, dec_col) = (position("sm"), position("enc"), position("dec"));

    lines
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let percent = |col: Option<usize>| {
                col.and_then(|c| fields.get(c))
                    .and_then(|value| value.parse::<f64>().ok())
            };
            Some(PmonRow {
                gpu: fields.get(gpu_col)?.parse().ok()?,
                pid: fields.get(pid_col)?.parse().ok()?,
                sm: percent(sm_col),
                enc: percent(enc_col),
                dec: percent(dec_col),
            })
        })
        .collect()
}

/// Instance list plus utilization fractions keyed by instance name.
pub fn instances_from_rows(rows: &[PmonRow]) -> (Vec<u8>, HashMap<String, f64>) {
    let mut builder = MultiStringBuilder::new();
    let mut utilization = HashMap::new();
    for row in rows {
        for (engine, percent) in [("3D", row.sm), ("VideoEncode", row.enc), ("VideoDecode", row.dec)] {
            let Some(percent) = percent else { continue };
            let name = format!("pid_{}_gpu_{}_engtype_{}", row.pid, row.gpu, engine);
            if builder.push(&name) {
                utilization.insert(name, percent / 100.0);
            }
        }
    }
    (builder.finish(), utilization)
}

impl GpuCounters for NvidiaGpu {
    fn is_available(&mut self) -> bool {
        let available = Command::new("nvidia-smi")
            .arg("--query-gpu=count")
            .arg("--format=csv,noheader,nounits")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        if available {
            info!("NVIDIA GPU counters available for devices: {:?}", self.device_ids);
        }
        available
    }

    fn enumerate_instances(&mut self) -> Vec<u8> {
        let rows = self.run_pmon().map(|out| parse_pmon(&out)).unwrap_or_default();
        let (instances, utilization) = instances_from_rows(&rows);
        self.utilization = utilization;
        instances
    }

    fn query_utilization(&mut self, path: GpuInstancePath) -> Option<f64> {
        self.utilization.remove(path.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_path::find_instance;

    const PMON: &str = "\
# gpu         pid   type     sm    mem    enc    dec    jpg    ofa    command
# Idx           #    C/G      %      %      %      %      %      %    name
    0       2414     G      3      1      -      -      -      -    Xorg
    0      31337     C     87     40      -     12      -      -    python3
    1          -     -      -      -      -      -      -      -    -
";

    #[test]
    fn test_parse_pmon() {
        let rows = parse_pmon(PMON);
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1],
            PmonRow {
                gpu: 0,
                pid: 31337,
                sm: Some(87.0),
                enc: None,
                dec: Some(12.0),
            }
        );
    }

    #[test]
    fn test_parse_without_header() {
        assert!(parse_pmon("").is_empty());
        assert!(parse_pmon("    0   2414   G   3   1\n").is_empty());
    }

    #[test]
    fn test_rows_resolve_to_3d_instance() {
        let (instances, utilization) = instances_from_rows(&parse_pmon(PMON));
        let path = find_instance(31337, &instances).unwrap();
        assert_eq!(path.as_str(), "pid_31337_gpu_0_engtype_3D");
        assert_eq!(utilization[path.as_str()], 0.87);
        assert!(find_instance(2415, &instances).is_none());
    }

    #[test]
    fn test_utilization_is_handed_out_once() {
        let mut gpu = NvidiaGpu::default();
        let (instances, utilization) = instances_from_rows(&parse_pmon(PMON));
        gpu.utilization = utilization;

        let path = find_instance(2414, &instances).unwrap();
        assert_eq!(gpu.query_utilization(path), Some(0.03));
        let again = find_instance(2414, &instances).unwrap();
        assert_eq!(gpu.query_utilization(again), None);
    }
}
