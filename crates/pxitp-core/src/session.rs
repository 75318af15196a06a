//! Update session - high-level orchestrator for one firmware update.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::device::{CrcKind, DeviceConfig, DeviceError, ResetMode, TouchDevice};
use crate::events::{LogLevel, UpdateEvent, UpdateObserver, UpdatePhase};
use crate::firmware::{FirmwareContainer, FirmwareError, FirmwareFormat, ParseFlags, Section};
use crate::flash::FlashError;
use crate::transport::{HidTransport, HidrawTransport, ObservableTransport};

/// Configuration for an update session.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// hidraw node of the touchpad, e.g. `/dev/hidraw3`.
    pub device_path: PathBuf,
    /// FWHD container to install.
    pub firmware_path: PathBuf,
    /// Accept containers whose CRCs do not match.
    pub ignore_checksum: bool,
    pub device: DeviceConfig,
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn parse_flags(&self) -> ParseFlags {
        if self.ignore_checksum {
            ParseFlags::IGNORE_CHECKSUM
        } else {
            ParseFlags::empty()
        }
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Firmware has no writable sections")]
    NoWritableSections,
    #[error("Device {kind} CRC 0x{device:08x} does not match expected 0x{expected:08x}")]
    CrcMismatch {
        kind: CrcKind,
        device: u32,
        expected: u32,
    },
    #[error("Invalid firmware file: {0}")]
    InvalidFile(#[from] FirmwareError),
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Sections selected for writing, with their payloads, decided before any
/// device I/O.
#[derive(Debug, Clone)]
pub struct UpdatePlan<'a> {
    entries: Vec<(&'a Section, &'a [u8])>,
    total_bytes: u64,
}

impl<'a> UpdatePlan<'a> {
    /// Select valid, internal, non-empty sections in table order.
    pub fn new(container: &'a FirmwareContainer) -> Result<Self, UpdateError> {
        // Parsing resolves every writable section, so none is dropped here.
        let entries: Vec<(&Section, &[u8])> = container
            .writable_sections()
            .filter_map(|s| container.section_bytes(s).map(|data| (s, data)))
            .collect();
        let total_bytes: u64 = entries.iter().map(|(_, data)| data.len() as u64).sum();
        if entries.is_empty() || total_bytes == 0 {
            return Err(UpdateError::NoWritableSections);
        }
        for skipped in container.sections().iter().filter(|s| !s.is_writable()) {
            if skipped.is_valid_update() {
                info!(section = %skipped, "Section not written");
            }
        }
        Ok(Self {
            entries,
            total_bytes,
        })
    }

    pub fn sections(&self) -> impl Iterator<Item = &'a Section> + '_ {
        self.entries.iter().map(|(section, _)| *section)
    }

    /// Each planned section with the bytes that will be written for it.
    pub fn payloads(&self) -> &[(&'a Section, &'a [u8])] {
        &self.entries
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Sector invalidated when verification fails.
    pub fn first_sector(&self) -> u32 {
        self.entries
            .first()
            .map(|(s, _)| s.start_sector())
            .unwrap_or_default()
    }
}

fn percent(written: u64, total: u64) -> u8 {
    (written * 100 / total.max(1)).min(100) as u8
}

/// Drives detach, write, verify and attach against one device.
pub struct UpdateSession<T: HidTransport, O: UpdateObserver> {
    device: TouchDevice<T>,
    observer: Arc<O>,
    phase: UpdatePhase,
}

impl<T: HidTransport, O: UpdateObserver> UpdateSession<T, O> {
    pub fn new(device: TouchDevice<T>, observer: Arc<O>) -> Self {
        Self {
            device,
            observer,
            phase: UpdatePhase::Idle,
        }
    }

    pub fn device(&self) -> &TouchDevice<T> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut TouchDevice<T> {
        &mut self.device
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    fn emit(&self, event: UpdateEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(UpdateEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn goto_phase(&mut self, to: UpdatePhase) {
        let from = self.phase;
        self.phase = to;
        self.emit(UpdateEvent::PhaseChanged { from, to });
    }

    /// Parse `data` and install it. A bad container fails here without
    /// touching the device.
    pub fn install_bytes(&mut self, data: &[u8], flags: ParseFlags) -> Result<(), UpdateError> {
        let container = FirmwareContainer::parse(data, flags)?;
        self.install(&container)
    }

    /// Full update: detach, write and verify, attach, then cleanup.
    ///
    /// Cleanup runs whatever the outcome and never replaces the result.
    #[instrument(skip(self, container), fields(version = %container.version()))]
    pub fn install(&mut self, container: &FirmwareContainer) -> Result<(), UpdateError> {
        let plan = UpdatePlan::new(container)?;
        let result = self.run_plan(container, &plan);

        self.goto_phase(UpdatePhase::Cleanup);
        self.device.cleanup();

        match &result {
            Ok(()) => {
                self.goto_phase(UpdatePhase::Complete);
                self.emit(UpdateEvent::Complete);
            }
            Err(e) => {
                self.goto_phase(UpdatePhase::Error);
                self.emit(UpdateEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    fn run_plan(
        &mut self,
        container: &FirmwareContainer,
        plan: &UpdatePlan<'_>,
    ) -> Result<(), UpdateError> {
        self.goto_phase(UpdatePhase::Detach);
        self.device.detach(plan)?;

        self.write_plan(container, plan)?;

        self.goto_phase(UpdatePhase::Attach);
        self.device.attach()?;
        Ok(())
    }

    /// Write every selected section, then have the device verify the result.
    pub fn write_firmware(&mut self, container: &FirmwareContainer) -> Result<(), UpdateError> {
        let plan = UpdatePlan::new(container)?;
        self.write_plan(container, &plan)
    }

    fn write_plan(
        &mut self,
        container: &FirmwareContainer,
        plan: &UpdatePlan<'_>,
    ) -> Result<(), UpdateError> {
        self.device.set_verified(false);
        self.goto_phase(UpdatePhase::Write);

        let total = plan.total_bytes();
        let mut done: u64 = 0;
        let mut last_percent = None;
        for &(section, data) in plan.payloads() {
            self.emit(UpdateEvent::SectionStarted {
                index: section.index,
                target: section.target_flash_start,
                length: section.section_length,
            });

            let observer = &self.observer;
            self.device.flash().update_flash_region_with(
                data.len(),
                section.start_sector(),
                data,
                |written| {
                    let p = percent(done + written as u64, total);
                    if last_percent != Some(p) {
                        last_percent = Some(p);
                        observer.on_event(&UpdateEvent::Progress {
                            phase: UpdatePhase::Write,
                            percent: p,
                        });
                    }
                },
            )?;
            done += data.len() as u64;
        }

        self.verify(container, plan)
    }

    /// Compare device-computed CRCs against the header. On mismatch the
    /// first written sector is erased before the error is returned.
    fn verify(
        &mut self,
        container: &FirmwareContainer,
        plan: &UpdatePlan<'_>,
    ) -> Result<(), UpdateError> {
        self.goto_phase(UpdatePhase::Verify);
        self.device.reset(ResetMode::Application)?;

        let header = container.header();
        let checks = [
            (CrcKind::Firmware, header.file_crc32),
            (CrcKind::Parameter, header.header_crc32),
        ];
        for (kind, expected) in checks {
            let device = self.device.read_crc(kind)?;
            if device != expected {
                warn!(
                    kind = %kind,
                    device = %format!("0x{device:08x}"),
                    expected = %format!("0x{expected:08x}"),
                    "CRC mismatch, invalidating image"
                );
                self.log(
                    LogLevel::Warn,
                    format!("{kind} CRC mismatch, erasing sector {}", plan.first_sector()),
                );
                if let Err(e) = self.device.invalidate(plan.first_sector()) {
                    warn!(error = %e, "Failed to invalidate image");
                }
                return Err(UpdateError::CrcMismatch {
                    kind,
                    device,
                    expected,
                });
            }
        }

        self.device.set_verified(true);
        self.log(LogLevel::Info, "Device CRCs verified");
        Ok(())
    }
}

/// Read and parse a container from disk.
pub fn load_firmware<P: AsRef<Path>>(path: P, flags: ParseFlags) -> Result<FirmwareContainer> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if !FirmwareContainer::validate(&data) {
        bail!("{} is not an FWHD container", path.display());
    }
    let container = FirmwareContainer::parse(&data, flags)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(container)
}

/// Run a complete update as described by `config`.
#[instrument(skip(config, observer), fields(device = %config.device_path.display()))]
pub fn run<O: UpdateObserver + 'static>(config: &SessionConfig, observer: Arc<O>) -> Result<()> {
    let container = load_firmware(&config.firmware_path, config.parse_flags())?;
    info!(
        path = %config.firmware_path.display(),
        version = %container.version(),
        "Loaded firmware"
    );

    let transport = HidrawTransport::open(&config.device_path)?;
    let transport = ObservableTransport::new(transport, observer.clone());
    let mut device = TouchDevice::new(transport, config.device.clone());
    device.setup()?;

    let part_id = device.read_part_id()?;
    let expected = container.header().ic_part_id;
    if expected != 0 && expected != part_id {
        warn!(
            device = %format!("0x{part_id:04x}"),
            firmware = %format!("0x{expected:04x}"),
            "Firmware built for a different part"
        );
    }

    let mut session = UpdateSession::new(device, observer);
    session.install(&container)?;
    info!(
        version = session.device().version().unwrap_or("unknown"),
        "Update finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceFlags;
    use crate::events::RecordingObserver;
    use crate::firmware::{FirmwareBuilder, HEADER_LEN, UpdateType};
    use crate::transport::MockTransport;

    fn quiet_device(mock: &MockTransport) -> TouchDevice<MockTransport> {
        let config = DeviceConfig {
            poll_interval_ms: 0,
            reset_delay_ms: 0,
            clock_delay_ms: 0,
            ..Default::default()
        };
        TouchDevice::new(mock.clone(), config)
    }

    fn session(
        mock: &MockTransport,
    ) -> (
        Arc<RecordingObserver>,
        UpdateSession<MockTransport, RecordingObserver>,
    ) {
        let observer = Arc::new(RecordingObserver::new());
        (observer.clone(), UpdateSession::new(quiet_device(mock), observer))
    }

    fn one_sector_firmware() -> FirmwareContainer {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i ^ (i >> 8)) as u8).collect();
        FirmwareBuilder::new()
            .file_version(0x0105)
            .internal_section(UpdateType::General, 0, &payload)
            .build()
            .unwrap()
    }

    fn arm_crcs(mock: &MockTransport, fw: &FirmwareContainer) {
        let mut dev = mock.device();
        dev.firmware_crc = fw.header().file_crc32;
        dev.parameter_crc = fw.header().header_crc32;
    }

    #[test]
    fn test_write_firmware_single_sector() {
        let mock = MockTransport::new();
        let fw = one_sector_firmware();
        assert_eq!(fw.sections()[0].internal_file_start as usize, HEADER_LEN);
        arm_crcs(&mock, &fw);
        let (observer, mut session) = session(&mock);

        session.write_firmware(&fw).unwrap();

        assert!(session.device().flags().contains(DeviceFlags::VERIFIED));
        let dev = mock.device();
        assert_eq!(dev.erased_sectors, vec![0]);
        let mut pages: Vec<u32> = (1..16).map(|p| p * 256).collect();
        pages.push(0);
        assert_eq!(dev.programmed_pages, pages);
        assert_eq!(dev.sector(0), fw.section_bytes(&fw.sections()[0]).unwrap());
        assert_eq!(dev.crc_requests, vec![0x02, 0x04]);

        let progress = observer.progress();
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_firmware_crc_mismatch_invalidates() {
        let mock = MockTransport::new();
        let fw = one_sector_firmware();
        arm_crcs(&mock, &fw);
        mock.device().firmware_crc ^= 1;
        let (_observer, mut session) = session(&mock);

        let err = session.write_firmware(&fw).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::CrcMismatch {
                kind: CrcKind::Firmware,
                ..
            }
        ));
        assert!(!session.device().flags().contains(DeviceFlags::VERIFIED));

        let dev = mock.device();
        // Region erase, then the invalidation erase.
        assert_eq!(dev.erased_sectors, vec![0, 0]);
        assert!(dev.sector(0).iter().all(|&b| b == 0xFF));
        assert_eq!(dev.resets.last(), Some(&0xcc));
    }

    #[test]
    fn test_parameter_crc_mismatch() {
        let mock = MockTransport::new();
        let fw = one_sector_firmware();
        arm_crcs(&mock, &fw);
        mock.device().parameter_crc = 0;
        let (_observer, mut session) = session(&mock);

        assert!(matches!(
            session.write_firmware(&fw),
            Err(UpdateError::CrcMismatch {
                kind: CrcKind::Parameter,
                device: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_bad_payload_crc_fails_before_io() {
        let mock = MockTransport::new();
        let mut data = one_sector_firmware().bytes().to_vec();
        data[0x0E] ^= 0xFF;
        // Keep the header CRC valid so only the payload check trips.
        let crc = crate::firmware::crc32(&data[..HEADER_LEN - 4]);
        data[HEADER_LEN - 4..HEADER_LEN].copy_from_slice(&crc.to_le_bytes());
        let (_observer, mut session) = session(&mock);

        let err = session.install_bytes(&data, ParseFlags::empty()).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::InvalidFile(FirmwareError::PayloadCrcMismatch { .. })
        ));
        assert_eq!(mock.device().sets, 0);
        assert_eq!(mock.device().rebinds, 0);
    }

    #[test]
    fn test_nothing_writable_fails_before_io() {
        let mock = MockTransport::new();
        let fw = FirmwareBuilder::new()
            .external_section(UpdateType::TfForce, 0, "tf.bin")
            .raw_section(
                UpdateType::General,
                crate::firmware::UpdateInfo::VALID,
                0,
                HEADER_LEN as u32,
                0,
                "",
            )
            .build()
            .unwrap();
        let (_observer, mut session) = session(&mock);

        assert!(matches!(
            session.install(&fw),
            Err(UpdateError::NoWritableSections)
        ));
        assert_eq!(mock.device().sets, 0);
    }

    #[test]
    fn test_install_end_to_end() {
        let mock = MockTransport::new();
        let fw = FirmwareBuilder::new()
            .internal_section(UpdateType::General, 0x0000, &[0x11; 5000])
            .internal_section(UpdateType::Param, 0x8000, &[0x22; 100])
            .external_section(UpdateType::TfForce, 0, "tf.bin")
            .build()
            .unwrap();
        arm_crcs(&mock, &fw);
        let (observer, mut session) = session(&mock);

        session.install(&fw).unwrap();
        assert_eq!(session.phase(), UpdatePhase::Complete);

        let phases: Vec<UpdatePhase> = observer
            .events()
            .iter()
            .filter_map(|e| match e {
                UpdateEvent::PhaseChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                UpdatePhase::Detach,
                UpdatePhase::Write,
                UpdatePhase::Verify,
                UpdatePhase::Attach,
                UpdatePhase::Cleanup,
                UpdatePhase::Complete,
            ]
        );
        assert!(matches!(observer.events().last(), Some(UpdateEvent::Complete)));

        let dev = mock.device();
        // Detach erases each section's first sector, then the regions follow.
        assert_eq!(dev.erased_sectors, vec![0, 8, 0, 1, 8]);
        assert_eq!(dev.programmed_pages.len(), 48);
        assert!(dev.flash[..5000].iter().all(|&b| b == 0x11));
        assert!(dev.flash[0x8000..0x8000 + 100].iter().all(|&b| b == 0x22));
        assert_eq!(dev.resets, vec![0xcc, 0xbb]);
        assert_eq!(dev.rebinds, 1);

        let progress = observer.progress();
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.iter().all(|&p| p <= 100));
    }

    #[test]
    fn test_cleanup_does_not_mask_failure() {
        let mock = MockTransport::new();
        let fw = one_sector_firmware();
        mock.device().busy_forever = true;
        mock.device().rebind_fails = true;
        let (observer, mut session) = session(&mock);

        let err = session.install(&fw).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Device(DeviceError::Flash(FlashError::WaitBusyFailure { .. }))
        ));
        assert_eq!(session.phase(), UpdatePhase::Error);
        assert!(matches!(observer.events().last(), Some(UpdateEvent::Error { .. })));

        let dev = mock.device();
        assert_eq!(dev.rebinds, 1);
        // Cleanup left bootloader mode.
        assert_eq!(dev.resets, vec![0xcc, 0xbb]);
        assert!(dev.programmed_pages.is_empty());
    }

    #[test]
    fn test_plan_totals() {
        let fw = FirmwareBuilder::new()
            .internal_section(UpdateType::General, 0x1000, &[0; 300])
            .internal_section(UpdateType::Param, 0x3000, &[0; 200])
            .build()
            .unwrap();
        let plan = UpdatePlan::new(&fw).unwrap();
        assert_eq!(plan.total_bytes(), 500);
        assert_eq!(plan.first_sector(), 1);
        let lengths: Vec<usize> = plan.payloads().iter().map(|(_, d)| d.len()).collect();
        assert_eq!(lengths, vec![300, 200]);
        assert_eq!(plan.payloads()[1].1, fw.section_bytes(&fw.sections()[1]).unwrap());
        assert_eq!(percent(250, 500), 50);
        assert_eq!(percent(600, 500), 100);
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        let mut config = SessionConfig {
            device_path: "/dev/hidraw3".into(),
            firmware_path: "fw.bin".into(),
            ignore_checksum: true,
            ..Default::default()
        };
        config.device.sram_select = 0x0e;
        config.save_to_file(&path).unwrap();

        let loaded = SessionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.device_path, PathBuf::from("/dev/hidraw3"));
        assert!(loaded.ignore_checksum);
        assert_eq!(loaded.parse_flags(), ParseFlags::IGNORE_CHECKSUM);
        assert_eq!(loaded.device, config.device);
    }

    #[test]
    fn test_load_firmware_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, vec![0u8; 0x400]).unwrap();
        assert!(load_firmware(&path, ParseFlags::empty()).is_err());

        let good = dir.path().join("good.bin");
        std::fs::write(&good, one_sector_firmware().bytes()).unwrap();
        let fw = load_firmware(&good, ParseFlags::empty()).unwrap();
        assert_eq!(fw.version(), "0x0105");
    }
}
