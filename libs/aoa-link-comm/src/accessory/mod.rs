use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use aoa_link_core::transport::Channel;
use log::{debug, info};

/// The accessory side of the link: the character device the kernel's
/// accessory gadget driver exposes once the host has switched the device
/// into accessory mode. Each read or write on it is one bulk transfer.
///
/// A read already blocked in the kernel when the node is closed only
/// returns once data arrives or the cable goes away.
#[derive(Debug)]
pub struct AccessoryNode {
    path: PathBuf,
    file: File,
    closed: AtomicBool,
}

impl AccessoryNode {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        info!("Opened accessory device {path:?}");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "Accessory device is closed",
            ))
        } else {
            Ok(())
        }
    }
}

impl Channel for AccessoryNode {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        (&self.file).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let written = (&self.file).write(buf)?;
        (&self.file).flush()?;
        Ok(written)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing accessory device {:?}", self.path);
        }
    }
}
