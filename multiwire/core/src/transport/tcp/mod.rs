//! TCP Transport
//!
//! Stream carrier. Every packet travels inside one checksummed frame (see
//! [`frame`](crate::transport::frame)); the transfer sees whole packets.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐                        ┌───────────────┐
//! │   TcpClient   │      framed packets    │   TcpServer   │
//! │               ├───────────────────────►│  accept loop  │
//! │ request() ───►│  [len][crc32][packet]  │  ├─ conn task │
//! │ ◄─── handler  │◄───────────────────────┤  ├─ conn task │
//! └───────────────┘                        └──┴────────────┘
//! ```

mod client;
mod connection;
mod server;

pub use client::TcpClient;
pub use connection::StreamTransfer;
pub use server::TcpServer;
