use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::actuator::ActuatorSink;
use crate::tracker::AngleCommand;

/// `pan,tilt` with one decimal each, newline terminated.
pub fn format_serial_line(pan: f64, tilt: f64) -> String {
    format!("{:.1},{:.1}\n", pan, tilt)
}

/// CSV angle link to a microcontroller.
///
/// Baud rate and line discipline belong to the device node (`stty`), so any
/// writer works here, which keeps the link testable against a buffer.
pub struct SerialLink<W: Write + Send> {
    writer: W,
    port: String,
}

impl SerialLink<std::fs::File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("open serial port {}", path.display()))?;
        log::info!("Serial link open on {}", path.display());
        Ok(Self::new(file, path.display().to_string()))
    }
}

impl<W: Write + Send> SerialLink<W> {
    pub fn new(writer: W, port: impl Into<String>) -> Self {
        Self {
            writer,
            port: port.into(),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ActuatorSink for SerialLink<W> {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn send(&mut self, command: &AngleCommand) -> Result<()> {
        self.writer
            .write_all(format_serial_line(command.pan, command.tilt).as_bytes())
            .with_context(|| format!("write to {}", self.port))?;
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::PixelOffset;

    #[test]
    fn writes_one_decimal_csv_lines() {
        let mut link = SerialLink::new(Vec::new(), "buffer");
        for (pan, tilt) in [(88.54, 90.0), (0.0, 149.96)] {
            let command = AngleCommand {
                pan,
                tilt,
                tracking: true,
                target_label: Some("laura".into()),
                confidence: 0.93,
                error: PixelOffset::ZERO,
            };
            link.send(&command).expect("send");
        }
        link.close().expect("close");
        let written = String::from_utf8(link.into_inner()).expect("utf8");
        assert_eq!(written, "88.5,90.0\n0.0,150.0\n");
    }

    #[test]
    fn open_reports_missing_device() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = SerialLink::<std::fs::File>::open(dir.path().join("no-such-tty")).err().expect("error");
        assert!(format!("{err:#}").contains("no-such-tty"));
    }
}
