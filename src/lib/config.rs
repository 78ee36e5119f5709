use directories::ProjectDirs;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::radar::{RadarError, VehicleSide};

pub const DEFAULT_WORKERS: usize = 6;
pub const MAX_WORKERS: usize = 30;
pub const DEFAULT_DATA_BAUD_RATE: u32 = 921_600;
pub const DEFAULT_UART_BAUD_RATE: u32 = 115_200;

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("net", "alphascan", "mmwave-scan")
}

fn default_output_directory() -> PathBuf {
    get_project_dirs()
        .map(|dirs| dirs.data_dir().to_owned())
        .unwrap_or_else(|| PathBuf::from("."))
}

///
/// Everything a pipeline run needs to know, fixed for the duration of the
/// run. Stored as camelCase JSON; missing fields take their default.
///
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub data_port_name: String,
    pub uart_port_name: String,
    /// Sensor configuration sent to the UART port when the sensor starts
    pub config_file_path: Option<PathBuf>,
    pub is_saving: bool,
    pub vehicle_side: VehicleSide,
    pub worker_count: usize,
    pub output_directory: PathBuf,
    pub data_baud_rate: u32,
    pub uart_baud_rate: u32,
    pub drain_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            data_port_name: String::new(),
            uart_port_name: String::new(),
            config_file_path: None,
            is_saving: false,
            vehicle_side: VehicleSide::default(),
            worker_count: DEFAULT_WORKERS,
            output_directory: default_output_directory(),
            data_baud_rate: DEFAULT_DATA_BAUD_RATE,
            uart_baud_rate: DEFAULT_UART_BAUD_RATE,
            drain_timeout_ms: 5000,
        }
    }
}

impl PipelineSettings {
    pub fn load(path: &Path) -> Result<Self, RadarError> {
        let file = File::open(path)?;
        let settings: PipelineSettings = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| RadarError::ParseJson(format!("{}: {}", path.display(), e)))?;
        info!("Loaded settings from '{}'", path.display());
        debug!("{:?}", settings);
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), RadarError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let mut writer = BufWriter::new(&file);

        serde_json::to_writer_pretty(writer.by_ref(), self)
            .map_err(|e| RadarError::ParseJson(e.to_string()))?;
        writeln!(writer)?;
        writer.flush()?;

        info!("Written settings file '{}'", path.display());
        Ok(())
    }

    /// Checks the settings every source needs
    pub fn validate(&self) -> Result<(), RadarError> {
        if !(1..=MAX_WORKERS).contains(&self.worker_count) {
            return Err(RadarError::InvalidSettings(format!(
                "worker count {} is not in 1..={}",
                self.worker_count, MAX_WORKERS
            )));
        }
        if self.drain_timeout_ms == 0 {
            return Err(RadarError::InvalidSettings(
                "drain timeout must be positive".to_string(),
            ));
        }
        if self.is_saving && self.output_directory.as_os_str().is_empty() {
            return Err(RadarError::InvalidSettings(
                "saving needs an output directory".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks the settings needed to talk to a real sensor
    pub fn validate_serial(&self) -> Result<(), RadarError> {
        self.validate()?;
        if self.data_port().is_empty() || self.uart_port().is_empty() {
            return Err(RadarError::InvalidSettings(
                "both the DATA and the UART port must be given".to_string(),
            ));
        }
        if self.data_baud_rate == 0 || self.uart_baud_rate == 0 {
            return Err(RadarError::InvalidSettings("baud rate is 0".to_string()));
        }
        Ok(())
    }

    /// Port names may carry a description after the device, as in
    /// "COM4 (XDS110 Class Auxiliary Data Port)"
    pub fn data_port(&self) -> &str {
        first_word(&self.data_port_name)
    }

    pub fn uart_port(&self) -> &str {
        first_word(&self.uart_port_name)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn first_word(s: &str) -> &str {
    s.split_whitespace().next().unwrap_or("")
}
