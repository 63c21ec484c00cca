//! The Operation passed from the engine to a driver
//!
//! The JSON shape of [`Operation`] is a public contract: plugin drivers read it
//! from standard input, so field names must not change.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// Everything a driver needs to run one action of an invocation image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Operation {
    /// Name of the installation (claim)
    #[serde(rename = "installation_name")]
    pub installation: String,

    /// Claim revision this run belongs to
    pub revision: String,

    /// Action to perform
    pub action: String,

    /// Resolved parameter values
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,

    /// Names of the credentials injected into this run
    #[serde(default)]
    pub credentials: Vec<String>,

    /// Invocation image reference
    pub image: String,

    /// Type of the invocation image (`docker`, `oci`, ...)
    pub image_type: String,

    /// Environment variables for the invocation image
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Files to place in the invocation image, keyed by absolute path
    #[serde(default)]
    pub files: BTreeMap<String, String>,

    /// Where the driver writes the run's output
    #[serde(skip)]
    pub out: Output,
}

/// Shared output sink for a run
///
/// Cloning shares the underlying writer, so a background task streaming
/// container logs can hold its own handle.
#[derive(Clone)]
pub struct Output {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Output {
    /// Write to the process's standard output
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// An output that records everything written, plus a handle to read it back
    pub fn capture() -> (Self, Capture) {
        let capture = Capture::default();
        (Self::new(capture.clone()), capture)
    }

    /// Write raw bytes
    pub fn write_bytes(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(data)?;
        writer.flush()
    }

    /// Write a line of text
    pub fn line(&self, text: impl AsRef<str>) -> io::Result<()> {
        let mut writer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", text.as_ref())?;
        writer.flush()
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::stdout()
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Output")
    }
}

/// In-memory buffer backing [`Output::capture`]
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    /// Everything written so far, lossily decoded
    pub fn contents(&self) -> String {
        let buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
