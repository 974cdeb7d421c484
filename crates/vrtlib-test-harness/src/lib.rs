//! vrtlib-test-harness: Test utilities for vrtlib.
//!
//! [`MockStream`] and [`MockConnector`] let the I/O engine, reader and
//! writer be driven byte-for-byte without a network. [`MockTcpServer`] is a
//! real loopback TCP peer for exercising the socket layer end to end, and
//! [`fixtures`] builds the packets most tests need.

pub mod fixtures;
pub mod mock_stream;
pub mod mock_tcp;

pub use mock_stream::{MockConnector, MockFeeder, MockStream, Written};
pub use mock_tcp::MockTcpServer;
