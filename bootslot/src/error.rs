use snafu::Snafu;
use std::path::PathBuf;

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Boot device '{}' is not under /dev", device))]
    NotDevicePath { device: String },

    #[snafu(display(
        "Partition '{}' does not end in a recognized slot number (expected 3 or 4)",
        device
    ))]
    UnknownSlotSuffix { device: String },

    #[snafu(display("Partition path '{}' is empty or has no disk prefix", device))]
    NoDiskPrefix { device: String },

    #[snafu(display("Failed to run {}: {}", command.display(), source))]
    BootToolSpawn {
        command: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{} exited with {}: {}", command.display(), code, stderr))]
    BootToolFailure {
        command: PathBuf,
        code: i32,
        stderr: String,
    },
}
