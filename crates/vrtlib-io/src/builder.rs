//! VrtBuilder -- fluent builder for started readers and writers.
//!
//! Collects connection options through typed setters or raw
//! `KEY=VALUE` pairs, then opens and starts a [`VrtReader`] or
//! [`VrtWriter`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vrtlib_io::builder::VrtBuilder;
//! use vrtlib_io::listener::NullListener;
//!
//! # async fn example() -> vrtlib_core::Result<()> {
//! let reader = VrtBuilder::new()
//!     .host("239.1.2.3")
//!     .port(4991)
//!     .option("INITIAL_TIMEOUT", "10")
//!     .listener(Arc::new(NullListener))
//!     .build_reader()
//!     .await?;
//! # reader.stop(true).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use vrtlib_core::error::Result;
use vrtlib_core::options::{ConnectionOptions, InitialTimeout, TransportKind, VrlBreak};
use vrtlib_transport::Connector;

use crate::listener::{NullListener, VrtListener};
use crate::reader::VrtReader;
use crate::writer::VrtWriter;

/// Fluent builder for [`VrtReader`] and [`VrtWriter`].
pub struct VrtBuilder {
    options: ConnectionOptions,
    raw: Vec<(String, String)>,
    listener: Arc<dyn VrtListener>,
}

impl Default for VrtBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VrtBuilder {
    /// UDP, default options, and a listener that ignores everything.
    pub fn new() -> Self {
        Self {
            options: ConnectionOptions::default(),
            raw: Vec::new(),
            listener: Arc::new(NullListener),
        }
    }

    /// Start from an already-parsed option set.
    pub fn from_options(options: ConnectionOptions) -> Self {
        Self {
            options,
            ..Self::new()
        }
    }

    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.options.transport = kind;
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.options.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    /// Local interface address for multicast and binding.
    pub fn device(mut self, device: &str) -> Self {
        self.options.device = Some(device.to_string());
        self
    }

    pub fn listener(mut self, listener: Arc<dyn VrtListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn initial_timeout(mut self, timeout: InitialTimeout) -> Self {
        self.options.initial_timeout = timeout;
        self
    }

    /// Wrap outgoing packets in VRL frames, optionally with CRC.
    pub fn vrl_frame(mut self, enabled: bool, crc: bool) -> Self {
        self.options.vrl_frame = enabled;
        self.options.vrl_crc = crc;
        self
    }

    pub fn vrl_break(mut self, policy: VrlBreak) -> Self {
        self.options.vrl_break = policy;
        self
    }

    /// A raw option pair, as accepted by [`ConnectionOptions::apply`].
    ///
    /// Raw pairs are applied after the typed setters, in the order given;
    /// a malformed value fails the build.
    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.raw.push((key.to_string(), value.to_string()));
        self
    }

    /// The options the builder will use.
    pub fn resolve_options(&self) -> Result<ConnectionOptions> {
        let mut options = self.options.clone();
        for (key, value) in &self.raw {
            options.apply(key, value)?;
        }
        Ok(options)
    }

    /// Open and start a reader on real sockets.
    pub async fn build_reader(self) -> Result<VrtReader> {
        let options = self.resolve_options()?;
        let reader = VrtReader::new(options, self.listener);
        reader.start().await?;
        Ok(reader)
    }

    /// Open and start a writer on real sockets.
    pub async fn build_writer(self) -> Result<VrtWriter> {
        let options = self.resolve_options()?;
        let writer = VrtWriter::new(options, self.listener);
        writer.start().await?;
        Ok(writer)
    }

    /// Start a reader on sockets from `connector`.
    ///
    /// Mainly for tests and for embedding code that prepares its own sockets.
    pub async fn build_reader_with_connector(self, connector: Box<dyn Connector>) -> Result<VrtReader> {
        let options = self.resolve_options()?;
        let reader = VrtReader::with_connector(connector, &options, self.listener);
        reader.start().await?;
        Ok(reader)
    }

    /// Start a writer on sockets from `connector`.
    pub async fn build_writer_with_connector(self, connector: Box<dyn Connector>) -> Result<VrtWriter> {
        let options = self.resolve_options()?;
        let writer = VrtWriter::with_connector(connector, &options, self.listener);
        writer.start().await?;
        Ok(writer)
    }
}
