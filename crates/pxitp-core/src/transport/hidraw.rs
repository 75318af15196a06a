//! Linux hidraw transport implementation.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::traits::{HidTransport, TransportError};
use crate::poll::{Poll, poll_until};

const SYSFS_HIDRAW_CLASS: &str = "/sys/class/hidraw";

/// How long to wait for the hidraw node to come back after a rebind.
const REBIND_POLL_ATTEMPTS: u32 = 50;
const REBIND_POLL_INTERVAL: Duration = Duration::from_millis(100);

mod ioctl {
    use nix::ioctl_readwrite_buf;

    const HID_IOC_MAGIC: u8 = b'H';
    const HID_IOC_TYPE_SFEATURE: u8 = 0x06;
    const HID_IOC_TYPE_GFEATURE: u8 = 0x07;

    ioctl_readwrite_buf!(hidiocsfeature, HID_IOC_MAGIC, HID_IOC_TYPE_SFEATURE, u8);
    ioctl_readwrite_buf!(hidiocgfeature, HID_IOC_MAGIC, HID_IOC_TYPE_GFEATURE, u8);
}

struct HidrawNode {
    path: PathBuf,
    file: File,
}

/// hidraw-based feature-report transport.
pub struct HidrawTransport {
    node: Mutex<HidrawNode>,
}

impl HidrawTransport {
    /// Open a `/dev/hidrawN` node for read/write.
    #[instrument(level = "info", skip(path), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let file = open_node(&path)?;
        info!(path = %path.display(), "Opened hidraw device");
        Ok(Self {
            node: Mutex::new(HidrawNode { path, file }),
        })
    }

    /// Current device node path (may change after a rebind).
    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HidrawNode> {
        // A poisoned lock only means another thread panicked mid-ioctl; the
        // file handle itself is still valid.
        self.node.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn open_node(path: &Path) -> Result<File, TransportError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| TransportError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })
}

/// Resolve `/dev/hidrawN` to its HID device directory in sysfs.
fn sysfs_device_dir(node: &Path) -> Result<PathBuf, TransportError> {
    let name = node
        .file_name()
        .ok_or_else(|| TransportError::RebindFailed(format!("bad node {}", node.display())))?;
    let link = Path::new(SYSFS_HIDRAW_CLASS).join(name).join("device");
    Ok(fs::canonicalize(link)?)
}

/// First hidraw node currently exposed by a HID device directory.
fn find_hidraw_node(device_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(device_dir.join("hidraw")).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .find(|n| n.to_string_lossy().starts_with("hidraw"))
        .map(|n| Path::new("/dev").join(n))
}

impl HidTransport for HidrawTransport {
    fn set_feature(&self, data: &[u8]) -> Result<(), TransportError> {
        let node = self.lock();
        let mut buf = data.to_vec();
        // SAFETY: the fd is owned by `node.file` and outlives the call; the
        // kernel reads at most `buf.len()` bytes.
        unsafe { ioctl::hidiocsfeature(node.file.as_raw_fd(), &mut buf) }
            .map_err(|e| TransportError::SetFeatureFailed(e.to_string()))?;
        Ok(())
    }

    fn get_feature(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let node = self.lock();
        // SAFETY: as above; the kernel writes at most `buf.len()` bytes.
        let n = unsafe { ioctl::hidiocgfeature(node.file.as_raw_fd(), buf) }
            .map_err(|e| TransportError::GetFeatureFailed(e.to_string()))?;
        Ok(n.max(0) as usize)
    }

    #[instrument(skip(self))]
    fn rebind(&self) -> Result<(), TransportError> {
        let mut node = self.lock();
        let device_dir = sysfs_device_dir(&node.path)?;
        let device_id = device_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransportError::RebindFailed("no device id".into()))?;
        let driver_dir = fs::canonicalize(device_dir.join("driver"))?;

        info!(device = %device_id, driver = %driver_dir.display(), "Rebinding HID driver");
        fs::write(driver_dir.join("unbind"), &device_id)?;
        fs::write(driver_dir.join("bind"), &device_id)?;

        let mut found = None;
        let outcome: Poll = poll_until(REBIND_POLL_ATTEMPTS, REBIND_POLL_INTERVAL, || {
            found = find_hidraw_node(&device_dir);
            Ok::<_, TransportError>(found.as_ref().is_some_and(|p| p.exists()))
        })?;
        let Some(path) = found.filter(|_| outcome.is_ready()) else {
            warn!(device = %device_id, "hidraw node did not reappear");
            return Err(TransportError::RebindFailed(format!(
                "{device_id}: hidraw node missing after bind"
            )));
        };

        node.file = open_node(&path)?;
        debug!(old = %node.path.display(), new = %path.display(), "Reopened hidraw node");
        node.path = path;
        Ok(())
    }

    fn name(&self) -> String {
        self.lock().path.display().to_string()
    }
}
