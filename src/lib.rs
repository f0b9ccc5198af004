//! Guacamole WebSocket-to-`guacd` broker with multi-party session
//! sharing: master/guest roles, pause/resume, and control transfer,
//! carried by a custom `guacg` instruction sublanguage riding on the
//! Guacamole wire protocol.

pub mod codec;
pub mod config;
pub mod error;
pub mod guacd;
pub mod parking;
pub mod reader;
pub mod registry;
pub mod server;
pub mod session;
