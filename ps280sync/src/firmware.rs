//! Firmware replacement.
//!
//! A firmware version is a directory holding three images that are written
//! at fixed offsets. [`FirmwareLifecycle`] enforces the erase-then-flash
//! sequence and stops for good on the first tool failure.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};

use crate::error::{Error, Result};
use crate::tool::{FlashToolConfig, ToolLine, run_streaming};

/// Flash offset of the second-stage bootloader.
pub const BOOTLOADER_OFFSET: u32 = 0x0000;
/// Flash offset of the partition table.
pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;
/// Flash offset of the application image.
pub const APPLICATION_OFFSET: u32 = 0x10000;

const BOOTLOADER_PREFIX: &str = "boot";
const PARTITION_TABLE_PREFIX: &str = "partition";
const APPLICATION_PREFIX: &str = "pikk-sense-";

/// The three images of one firmware version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImageSet {
    /// Version name (the directory name).
    pub version: String,
    /// Bootloader image.
    pub bootloader: PathBuf,
    /// Partition table image.
    pub partition_table: PathBuf,
    /// Application image.
    pub application: PathBuf,
}

fn find_image(dir: &Path, prefix: &str) -> Result<PathBuf> {
    let mut matches: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| ext == "bin")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(prefix))
        })
        .collect();
    matches.sort();

    matches.into_iter().next().ok_or_else(|| {
        Error::MissingImage(format!("{prefix}*.bin in {}", dir.display()))
    })
}

impl FirmwareImageSet {
    /// Resolve the images inside a version directory.
    ///
    /// Images are matched by prefix: `boot*.bin`, `partition*.bin` and
    /// `pikk-sense-*.bin`.
    pub fn from_version_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::MissingImage(format!(
                "firmware directory {} does not exist",
                dir.display()
            )));
        }

        let version = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            version,
            bootloader: find_image(dir, BOOTLOADER_PREFIX)?,
            partition_table: find_image(dir, PARTITION_TABLE_PREFIX)?,
            application: find_image(dir, APPLICATION_PREFIX)?,
        })
    }

    /// `(offset, path)` pairs in flashing order.
    pub fn images(&self) -> [(u32, &Path); 3] {
        [
            (BOOTLOADER_OFFSET, self.bootloader.as_path()),
            (PARTITION_TABLE_OFFSET, self.partition_table.as_path()),
            (APPLICATION_OFFSET, self.application.as_path()),
        ]
    }

    /// Check that every image still exists.
    pub fn validate(&self) -> Result<()> {
        for (_, path) in self.images() {
            if !path.is_file() {
                return Err(Error::MissingImage(path.display().to_string()));
            }
        }
        Ok(())
    }
}

/// List the firmware versions (sub-directories) under `root`, sorted.
pub fn list_firmware_versions(root: &Path) -> Result<Vec<String>> {
    let mut versions: Vec<String> = fs::read_dir(root)?
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    versions.sort();
    Ok(versions)
}

/// The external tool performing erase and flash.
pub trait FlashTool {
    /// Erase the whole flash.
    fn erase(&mut self, output: &mut dyn FnMut(ToolLine)) -> Result<()>;

    /// Write images at their offsets.
    fn write_flash(&mut self, images: &[(u32, &Path)], output: &mut dyn FnMut(ToolLine)) -> Result<()>;
}

/// [`FlashTool`] backed by `esptool`.
#[derive(Debug, Clone, Default)]
pub struct Esptool {
    config: FlashToolConfig,
}

impl Esptool {
    /// Create a tool runner.
    pub fn new(config: FlashToolConfig) -> Self {
        Self { config }
    }

    fn run(&self, operation: &str, args: Vec<String>, output: &mut dyn FnMut(ToolLine)) -> Result<()> {
        let status = run_streaming(self.config.command(args), output)?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::FlashTool {
                operation: operation.to_string(),
                code: status.code(),
            })
        }
    }
}

impl FlashTool for Esptool {
    fn erase(&mut self, output: &mut dyn FnMut(ToolLine)) -> Result<()> {
        self.run("erase_flash", vec!["erase_flash".to_string()], output)
    }

    fn write_flash(&mut self, images: &[(u32, &Path)], output: &mut dyn FnMut(ToolLine)) -> Result<()> {
        let mut args = vec!["write_flash".to_string()];
        for (offset, path) in images {
            args.push(format!("{offset:#06x}"));
            args.push(path.display().to_string());
        }
        self.run("write_flash", args, output)
    }
}

/// Where a firmware replacement stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareState {
    /// Nothing done yet.
    Idle,
    /// Erase running.
    Erasing,
    /// Erase succeeded.
    Erased,
    /// Flash running.
    Flashing,
    /// Flash succeeded; the device's settings must be re-read.
    Flashed,
    /// A tool step failed; terminal.
    Failed,
}

impl fmt::Display for FirmwareState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Erasing => "erasing",
            Self::Erased => "erased",
            Self::Flashing => "flashing",
            Self::Flashed => "flashed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Erase-then-flash sequencing over a [`FlashTool`].
pub struct FirmwareLifecycle<T: FlashTool> {
    tool: T,
    state: FirmwareState,
}

impl<T: FlashTool> FirmwareLifecycle<T> {
    /// Start in [`FirmwareState::Idle`].
    pub fn new(tool: T) -> Self {
        Self {
            tool,
            state: FirmwareState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> FirmwareState {
        self.state
    }

    /// The wrapped tool.
    pub fn tool(&self) -> &T {
        &self.tool
    }

    /// Erase the flash. Allowed from `Idle` only.
    pub fn erase(&mut self, output: &mut dyn FnMut(ToolLine)) -> Result<()> {
        if self.state != FirmwareState::Idle {
            return Err(Error::InvalidState(format!(
                "erase is only possible from idle, not {}",
                self.state
            )));
        }

        info!("Erasing flash");
        self.state = FirmwareState::Erasing;
        match self.tool.erase(output) {
            Ok(()) => {
                self.state = FirmwareState::Erased;
                Ok(())
            },
            Err(e) => {
                error!("Erase failed: {e}");
                self.state = FirmwareState::Failed;
                Err(e)
            },
        }
    }

    /// Write the images. Requires a successful erase.
    pub fn flash(&mut self, images: &FirmwareImageSet, output: &mut dyn FnMut(ToolLine)) -> Result<()> {
        if self.state != FirmwareState::Erased {
            return Err(Error::InvalidState(format!(
                "flash requires a successful erase, state is {}",
                self.state
            )));
        }
        images.validate()?;

        info!("Flashing firmware {}", images.version);
        self.state = FirmwareState::Flashing;
        match self.tool.write_flash(&images.images(), output) {
            Ok(()) => {
                self.state = FirmwareState::Flashed;
                Ok(())
            },
            Err(e) => {
                error!("Flash failed: {e}");
                self.state = FirmwareState::Failed;
                Err(e)
            },
        }
    }

    /// Validate the images, erase, then flash.
    pub fn update(&mut self, images: &FirmwareImageSet, output: &mut dyn FnMut(ToolLine)) -> Result<()> {
        images.validate()?;
        self.erase(output)?;
        self.flash(images, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolStream;

    #[derive(Default)]
    struct FakeTool {
        erase_code: Option<i32>,
        flash_code: Option<i32>,
        erase_calls: usize,
        flash_calls: Vec<Vec<(u32, PathBuf)>>,
    }

    impl FlashTool for FakeTool {
        fn erase(&mut self, output: &mut dyn FnMut(ToolLine)) -> Result<()> {
            self.erase_calls += 1;
            output(ToolLine {
                stream: ToolStream::Stdout,
                text: "Erasing flash (this may take a while)...".to_string(),
            });
            match self.erase_code {
                Some(code) => Err(Error::FlashTool {
                    operation: "erase_flash".to_string(),
                    code: Some(code),
                }),
                None => Ok(()),
            }
        }

        fn write_flash(&mut self, images: &[(u32, &Path)], _output: &mut dyn FnMut(ToolLine)) -> Result<()> {
            self.flash_calls
                .push(images.iter().map(|(o, p)| (*o, p.to_path_buf())).collect());
            match self.flash_code {
                Some(code) => Err(Error::FlashTool {
                    operation: "write_flash".to_string(),
                    code: Some(code),
                }),
                None => Ok(()),
            }
        }
    }

    fn version_dir() -> (tempfile::TempDir, FirmwareImageSet) {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("1.4.2");
        fs::create_dir(&dir).unwrap();
        for name in ["bootloader.bin", "partition-table.bin", "pikk-sense-esp32s3.bin", "notes.txt"] {
            fs::write(dir.join(name), b"\x00").unwrap();
        }
        let images = FirmwareImageSet::from_version_dir(&dir).unwrap();
        (root, images)
    }

    #[test]
    fn test_from_version_dir_resolves_by_prefix() {
        let (_root, images) = version_dir();
        assert_eq!(images.version, "1.4.2");
        assert!(images.bootloader.ends_with("bootloader.bin"));
        assert!(images.partition_table.ends_with("partition-table.bin"));
        assert!(images.application.ends_with("pikk-sense-esp32s3.bin"));

        let offsets: Vec<u32> = images.images().iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, [0x0000, 0x8000, 0x10000]);
    }

    #[test]
    fn test_missing_image_is_reported() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("bootloader.bin"), b"\x00").unwrap();
        fs::write(root.path().join("partition-table.bin"), b"\x00").unwrap();

        match FirmwareImageSet::from_version_dir(root.path()) {
            Err(Error::MissingImage(msg)) => assert!(msg.contains("pikk-sense-")),
            other => panic!("expected MissingImage, got {other:?}"),
        }
    }

    #[test]
    fn test_list_firmware_versions_sorted() {
        let root = tempfile::tempdir().unwrap();
        for version in ["2.0.0", "1.4.2", "1.10.0"] {
            fs::create_dir(root.path().join(version)).unwrap();
        }
        fs::write(root.path().join("README.md"), b"").unwrap();

        assert_eq!(
            list_firmware_versions(root.path()).unwrap(),
            ["1.10.0", "1.4.2", "2.0.0"]
        );
    }

    #[test]
    fn test_update_erases_then_flashes() {
        let (_root, images) = version_dir();
        let mut lifecycle = FirmwareLifecycle::new(FakeTool::default());
        let mut lines = Vec::new();

        lifecycle.update(&images, &mut |line| lines.push(line.text)).unwrap();

        assert_eq!(lifecycle.state(), FirmwareState::Flashed);
        assert_eq!(lifecycle.tool().erase_calls, 1);
        assert_eq!(lifecycle.tool().flash_calls.len(), 1);
        assert_eq!(lifecycle.tool().flash_calls[0][2].0, APPLICATION_OFFSET);
        assert_eq!(lines, ["Erasing flash (this may take a while)..."]);
    }

    #[test]
    fn test_erase_failure_halts_pipeline() {
        let (_root, images) = version_dir();
        let mut lifecycle = FirmwareLifecycle::new(FakeTool {
            erase_code: Some(2),
            ..Default::default()
        });

        let result = lifecycle.update(&images, &mut |_| {});
        assert!(matches!(
            result,
            Err(Error::FlashTool { code: Some(2), .. })
        ));
        assert_eq!(lifecycle.state(), FirmwareState::Failed);
        assert!(lifecycle.tool().flash_calls.is_empty());

        assert!(matches!(
            lifecycle.flash(&images, &mut |_| {}),
            Err(Error::InvalidState(_))
        ));
        assert!(lifecycle.tool().flash_calls.is_empty());
    }

    #[test]
    fn test_flash_requires_erase() {
        let (_root, images) = version_dir();
        let mut lifecycle = FirmwareLifecycle::new(FakeTool::default());

        assert!(matches!(
            lifecycle.flash(&images, &mut |_| {}),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(lifecycle.state(), FirmwareState::Idle);
    }

    #[test]
    fn test_flash_failure_is_terminal() {
        let (_root, images) = version_dir();
        let mut lifecycle = FirmwareLifecycle::new(FakeTool {
            flash_code: Some(1),
            ..Default::default()
        });

        assert!(lifecycle.update(&images, &mut |_| {}).is_err());
        assert_eq!(lifecycle.state(), FirmwareState::Failed);
        assert!(matches!(
            lifecycle.erase(&mut |_| {}),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_missing_image_is_caught_before_erase() {
        let (_root, images) = version_dir();
        fs::remove_file(&images.application).unwrap();
        let mut lifecycle = FirmwareLifecycle::new(FakeTool::default());

        assert!(matches!(
            lifecycle.update(&images, &mut |_| {}),
            Err(Error::MissingImage(_))
        ));
        assert_eq!(lifecycle.tool().erase_calls, 0);
        assert_eq!(lifecycle.state(), FirmwareState::Idle);
    }

    #[cfg(unix)]
    #[test]
    fn test_esptool_nonzero_exit_is_flash_tool_error() {
        let config = FlashToolConfig {
            program: "sh".to_string(),
            base_args: vec!["-c".to_string(), "printf '%s\\n' \"$*\"; exit 2".to_string(), "esptool".to_string()],
            ..Default::default()
        };
        let mut tool = Esptool::new(config);
        let mut lines = Vec::new();

        let result = tool.erase(&mut |line| lines.push(line.text));
        assert!(matches!(
            result,
            Err(Error::FlashTool { ref operation, code: Some(2) }) if operation == "erase_flash"
        ));
        assert_eq!(lines, ["-b 460800 erase_flash"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_esptool_write_flash_arguments() {
        let (_root, images) = version_dir();
        let config = FlashToolConfig {
            program: "sh".to_string(),
            base_args: vec!["-c".to_string(), "printf '%s\\n' \"$*\"".to_string(), "esptool".to_string()],
            ..Default::default()
        };
        let mut tool = Esptool::new(config);
        let mut lines = Vec::new();

        tool.write_flash(&images.images(), &mut |line| lines.push(line.text))
            .unwrap();
        let expected = format!(
            "-b 460800 write_flash 0x0000 {} 0x8000 {} 0x10000 {}",
            images.bootloader.display(),
            images.partition_table.display(),
            images.application.display()
        );
        assert_eq!(lines, [expected]);
    }
}
