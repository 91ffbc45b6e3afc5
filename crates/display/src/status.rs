use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::linux::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Sysfs connector status probe. The file is opened once and rewound between
/// reads; a single character tells connected (`c`) from disconnected (`d`).
pub(crate) struct StatusProbe {
    card_path: PathBuf,
    port: String,
    file: Option<File>,
}

impl StatusProbe {
    pub(crate) fn new(card_path: &Path, port: &str) -> Self {
        Self {
            card_path: card_path.to_path_buf(),
            port: port.to_string(),
            file: None,
        }
    }

    /// Returns true when the connector reports connected.
    pub(crate) fn connected(&mut self) -> io::Result<bool> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => {
                let meta = std::fs::metadata(&self.card_path)?;
                let minor = libc::minor(meta.st_rdev());
                let path = format!("/sys/class/drm/card{minor}-{}/status", self.port);
                debug!(path = %path, "opening connector status file");
                self.file.insert(File::open(&path)?)
            }
        };
        let mut status = [0u8; 1];
        let result = file
            .read_exact(&mut status)
            .and_then(|_| file.seek(SeekFrom::Start(0)));
        if let Err(err) = result {
            // Force a reopen on the next probe.
            self.file = None;
            return Err(err);
        }
        Ok(status[0] != b'd')
    }
}
