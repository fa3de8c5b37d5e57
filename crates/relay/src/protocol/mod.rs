//! Core protocol types for the forwarding engine.
//!
//! - **Messages**: what was framed in each direction
//!   - [`HttpMessage`]: start line, headers and timing of one request or response
//!   - [`Header`]: case-preserving name/value pair
//!   - [`Direction`]: which half of an exchange a message belongs to
//!
//! - **Errors**:
//!   - [`ParseError`]: malformed framing, always fatal to the exchange
//!   - [`ExchangeError`]: protocol, transport and controlled-abort outcomes
//!   - [`EndExchange`]: the literal response written on a controlled abort

mod message;
pub use message::Attachment;
pub use message::Direction;
pub use message::Header;
pub use message::HttpMessage;
pub use message::MessageContext;
pub use message::StartLine;

mod error;
pub use error::EndExchange;
pub use error::ExchangeError;
pub use error::ParseError;
