pub mod client;
pub mod server;
pub mod transport;

pub use client::{TestClient, comment_rows};
pub use server::FakeServer;
pub use transport::RecordingTransport;
