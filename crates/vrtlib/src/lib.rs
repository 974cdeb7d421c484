//! # vrtlib -- VITA-49 packet and frame I/O
//!
//! `vrtlib` reads and writes VITA-49.0 (VRT) packets, optionally wrapped in
//! VITA-49.1 VRL frames, over UDP (unicast or multicast) and TCP (client
//! or server). It handles framing recovery on byte streams, packet and
//! frame count checking, initial-context acquisition, and automatic
//! reconnection, and reports everything through a listener.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vrtlib::io::{InitialContext, VrtBuilder, VrtEvent, VrtListener};
//! use vrtlib::packet::Packet;
//!
//! struct Printer;
//!
//! impl VrtListener for Printer {
//!     fn received_initial_context(&self, _e: &VrtEvent, ic: &InitialContext) {
//!         println!("initial context: {:?}", ic.error_message);
//!     }
//!     fn received_data_packet(&self, _e: &VrtEvent, p: &Packet) {
//!         println!("data {} bytes", p.len());
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> vrtlib::Result<()> {
//!     let reader = VrtBuilder::new()
//!         .host("239.1.2.3")
//!         .port(4991)
//!         .listener(Arc::new(Printer))
//!         .build_reader()
//!         .await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     reader.stop(true).await
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate              | Purpose                                            |
//! |--------------------|----------------------------------------------------|
//! | `vrtlib-core`      | Errors, connection options, the `Transport` trait  |
//! | `vrtlib-packet`    | Packets, context fields, VRL frames, stream codec  |
//! | `vrtlib-transport` | UDP and TCP sockets, connectors                    |
//! | `vrtlib-io`        | Connection engine, reader, writer, listener        |
//! | **`vrtlib`**       | This facade crate                                  |
//!
//! ## Feature Flags
//!
//! | Feature | Enables                                     | Default |
//! |---------|---------------------------------------------|---------|
//! | `io`    | [`transport`] and [`io`] (sockets, engine)  | yes     |
//!
//! With `default-features = false` only the pure packet model is built,
//! which is enough for parsing captures.

pub use vrtlib_core::*;

/// VITA-49 packets, context fields, VRL frames and the stream codec.
pub mod packet {
    pub use vrtlib_packet::*;
}

/// UDP and TCP sockets and the [`Connector`](transport::Connector) seam.
#[cfg(feature = "io")]
pub mod transport {
    pub use vrtlib_transport::*;
}

/// Readers, writers and the listener contract.
#[cfg(feature = "io")]
pub mod io {
    pub use vrtlib_io::*;
}

/// Open and start a reader from a string option map.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> vrtlib::Result<()> {
/// use std::sync::Arc;
/// let reader = vrtlib::open_reader(
///     [("TRANSPORT", "TCP_CLIENT"), ("HOST", "10.0.0.5"), ("PORT", "5000")],
///     Arc::new(vrtlib::io::NullListener),
/// )
/// .await?;
/// # reader.stop(true).await
/// # }
/// ```
#[cfg(feature = "io")]
pub async fn open_reader<I, K, V>(
    pairs: I,
    listener: std::sync::Arc<dyn io::VrtListener>,
) -> Result<io::VrtReader>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let options = ConnectionOptions::from_pairs(pairs)?;
    io::VrtBuilder::from_options(options)
        .listener(listener)
        .build_reader()
        .await
}

/// Open and start a writer from a string option map.
#[cfg(feature = "io")]
pub async fn open_writer<I, K, V>(
    pairs: I,
    listener: std::sync::Arc<dyn io::VrtListener>,
) -> Result<io::VrtWriter>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let options = ConnectionOptions::from_pairs(pairs)?;
    io::VrtBuilder::from_options(options)
        .listener(listener)
        .build_writer()
        .await
}
