//! Sans-IO HTTP/2 client framing layer.
//!
//! Everything here is pure state: the transport feeds received bytes in
//! via [`ClientConnection::feed`], pulls protocol output with
//! [`ClientConnection::take_outbound`], and drains decoded activity with
//! [`ClientConnection::next_event`]. The crate performs no I/O and takes
//! no locks, which lets one implementation serve both a blocking and an
//! async transport.
//!
//! ```text
//!   TCP + TLS bytes
//!        |
//!   +----v-------------+
//!   | hawser-h2        |  framing + HPACK + flow control
//!   | ClientConnection |  ConnEvent: ResponseHeaders, Data, ...
//!   +------------------+
//! ```
//!
//! # Example
//!
//! ```rust
//! use hawser_h2::{ClientConnection, ConnEvent, Field, SettingsMap};
//!
//! let mut conn = ClientConnection::new(SettingsMap::client());
//!
//! // Ship the preface + SETTINGS.
//! let outbound = conn.take_outbound();
//! # assert!(outbound.starts_with(hawser_h2::PREFACE));
//!
//! // ... feed server bytes with conn.feed(..), then:
//! let stream_id = conn.open_stream(&[
//!     Field::new(b":method".as_slice(), b"GET".as_slice()),
//!     Field::new(b":scheme".as_slice(), b"https".as_slice()),
//!     Field::new(b":authority".as_slice(), b"example.com".as_slice()),
//!     Field::new(b":path".as_slice(), b"/".as_slice()),
//! ], true).unwrap();
//! # let _ = stream_id;
//! while let Some(event) = conn.next_event() {
//!     match event {
//!         ConnEvent::ResponseHeaders { .. } => { /* ... */ }
//!         ConnEvent::Data { .. } => { /* ... */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod conn;
pub mod error;
pub mod flow;
pub mod frame;
pub mod hpack;
mod huffman;
pub mod settings;
pub mod stream;

pub use conn::{ClientConnection, ConnEvent, PREFACE};
pub use error::{ErrorCode, FrameLayerError};
pub use frame::Frame;
pub use hpack::Field;
pub use settings::SettingsMap;
pub use stream::StreamPhase;
