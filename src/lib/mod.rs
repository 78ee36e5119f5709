use clap::Parser;
use std::path::PathBuf;

pub mod config;
pub mod pipeline;
pub mod radar;
pub mod recording;
pub mod sensor;

use config::PipelineSettings;
pub use radar::{ClusteredObject, RadarError, VehicleSide};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PACKAGE: &str = env!("CARGO_PKG_NAME");

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Settings file (JSON); the options below override what it says
    #[arg(short, long)]
    pub settings: Option<PathBuf>,

    /// Serial port the sensor streams its packets on
    #[arg(long)]
    pub data_port: Option<String>,

    /// Serial port of the sensor command line interface
    #[arg(long)]
    pub uart_port: Option<String>,

    /// Sensor configuration file, sent to the sensor when it starts
    #[arg(short, long)]
    pub config_file: Option<PathBuf>,

    /// Side of the vehicle the sensor looks at
    #[arg(long, value_enum)]
    pub side: Option<VehicleSide>,

    /// Number of packet processing threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Record raw packets and clusters
    #[arg(long, default_value_t = false)]
    pub save: bool,

    /// Directory for recordings
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Process a captured byte stream or packet recording instead of the sensor
    #[arg(short, long)]
    pub replay: Option<PathBuf>,
}

impl Cli {
    /// The settings file, if any, with the command line options applied
    pub fn pipeline_settings(&self) -> Result<PipelineSettings, RadarError> {
        let mut settings = match &self.settings {
            Some(path) => PipelineSettings::load(path)?,
            None => PipelineSettings::default(),
        };

        if let Some(port) = &self.data_port {
            settings.data_port_name = port.clone();
        }
        if let Some(port) = &self.uart_port {
            settings.uart_port_name = port.clone();
        }
        if let Some(config_file) = &self.config_file {
            settings.config_file_path = Some(config_file.clone());
        }
        if let Some(side) = self.side {
            settings.vehicle_side = side;
        }
        if let Some(workers) = self.workers {
            settings.worker_count = workers;
        }
        if self.save {
            settings.is_saving = true;
        }
        if let Some(dir) = &self.output_dir {
            settings.output_directory = dir.clone();
        }

        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_overrides() {
        let args = Cli::try_parse_from([
            "mmwave-scan",
            "--data-port",
            "/dev/ttyACM1",
            "--uart-port",
            "/dev/ttyACM0",
            "--side",
            "left",
            "-w",
            "8",
            "--save",
            "-o",
            "/tmp/runs",
        ])
        .unwrap();

        let settings = args.pipeline_settings().unwrap();
        assert_eq!(settings.data_port(), "/dev/ttyACM1");
        assert_eq!(settings.uart_port(), "/dev/ttyACM0");
        assert_eq!(settings.vehicle_side, VehicleSide::Left);
        assert_eq!(settings.worker_count, 8);
        assert!(settings.is_saving);
        assert_eq!(settings.output_directory, PathBuf::from("/tmp/runs"));
        assert!(args.replay.is_none());
    }

    #[test]
    fn invalid_worker_count() {
        let args = Cli::try_parse_from(["mmwave-scan", "--workers", "31"]).unwrap();
        assert!(matches!(
            args.pipeline_settings(),
            Err(RadarError::InvalidSettings(_))
        ));
        assert!(Cli::try_parse_from(["mmwave-scan", "--side", "up"]).is_err());
    }
}
