use log::{debug, info, warn};
use serialport::{ClearBuffer, SerialPort};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::{ByteSource, SourceRead};
use crate::config::PipelineSettings;
use crate::radar::RadarError;

/// Polls with fewer bytes waiting than this are skipped
const MIN_READ: u32 = 64;
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const POLL_PAUSE: Duration = Duration::from_millis(1);
/// Pause after each configuration line so the sensor CLI keeps up
const CONFIG_LINE_PAUSE: Duration = Duration::from_millis(10);
const STOP_COMMAND: &str = "sensorStop";

///
/// The sensor on its two serial ports: commands and configuration go to the
/// UART (CLI) port, the packet stream comes from the DATA port.
///
pub struct SerialSensor {
    data_port_name: String,
    uart_port_name: String,
    data_baud_rate: u32,
    uart_baud_rate: u32,
    config_file: Option<PathBuf>,
    data: Option<Box<dyn SerialPort>>,
    uart: Option<Box<dyn SerialPort>>,
}

impl SerialSensor {
    pub fn new(settings: &PipelineSettings) -> Result<Self, RadarError> {
        settings.validate_serial()?;
        Ok(SerialSensor {
            data_port_name: settings.data_port().to_string(),
            uart_port_name: settings.uart_port().to_string(),
            data_baud_rate: settings.data_baud_rate,
            uart_baud_rate: settings.uart_baud_rate,
            config_file: settings.config_file_path.clone(),
            data: None,
            uart: None,
        })
    }

    /// Sends a single command line to the sensor CLI
    pub fn send_command(&mut self, command: &str) -> Result<(), RadarError> {
        let uart = self.uart.as_mut().ok_or(RadarError::NotRunning)?;
        writeln!(uart, "{}", command)?;
        uart.flush()?;
        Ok(())
    }
}

/// Writes the configuration file to the sensor CLI one line at a time
pub fn send_config<W: Write>(port: &mut W, path: &Path, pause: Duration) -> Result<usize, RadarError> {
    let config = fs::read_to_string(path)?;
    let mut lines = 0;
    for line in config.lines() {
        debug!("config: {}", line);
        writeln!(port, "{}", line)?;
        port.flush()?;
        lines += 1;
        thread::sleep(pause);
    }
    Ok(lines)
}

impl ByteSource for SerialSensor {
    fn name(&self) -> String {
        format!("{} / {}", self.data_port_name, self.uart_port_name)
    }

    fn open(&mut self) -> Result<(), RadarError> {
        let mut uart = serialport::new(&self.uart_port_name, self.uart_baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        uart.write_data_terminal_ready(true)?;

        let mut data = serialport::new(&self.data_port_name, self.data_baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        data.write_data_terminal_ready(true)?;
        data.clear(ClearBuffer::Input)?;

        if let Some(config_file) = &self.config_file {
            let lines = send_config(&mut uart, config_file, CONFIG_LINE_PAUSE)?;
            info!(
                "Sent {} configuration lines from '{}' to {}",
                lines,
                config_file.display(),
                self.uart_port_name
            );
        }
        info!(
            "Sensor on {} streaming to {} at {} baud",
            self.uart_port_name, self.data_port_name, self.data_baud_rate
        );

        self.uart = Some(uart);
        self.data = Some(data);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<SourceRead, RadarError> {
        let data = self.data.as_mut().ok_or(RadarError::NotRunning)?;
        let available = data.bytes_to_read()?;
        if available < MIN_READ {
            thread::sleep(POLL_PAUSE);
            return Ok(SourceRead::Idle);
        }

        let wanted = (available as usize).min(buf.len());
        match data.read(&mut buf[..wanted]) {
            Ok(n) => Ok(SourceRead::Bytes(n)),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(SourceRead::Idle),
            Err(e) => Err(e.into()),
        }
    }

    fn drain(&mut self) -> Result<Vec<u8>, RadarError> {
        let data = self.data.as_mut().ok_or(RadarError::NotRunning)?;
        let available = data.bytes_to_read()? as usize;
        let mut rest = vec![0u8; available];
        let mut filled = 0;
        while filled < available {
            match data.read(&mut rest[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        rest.truncate(filled);
        Ok(rest)
    }

    fn stop(&mut self) -> Result<(), RadarError> {
        let result = if self.uart.is_some() {
            self.send_command(STOP_COMMAND)
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            warn!("Cannot stop sensor on {}: {}", self.uart_port_name, e);
        }
        self.data = None;
        self.uart = None;
        info!("Sensor on {} stopped", self.uart_port_name);
        result
    }
}
