//! HTTP head processing: start lines, header lines and the framing headers
//!
//! # Components
//!
//! - [`header_decoder`]: line-level decoding
//!   - Start line tokenising for requests and responses
//!   - Header line splitting and validation
//!   - Tracking of `Content-Length` / `Transfer-Encoding` to pick the body mode
//!
//! - [`header_encoder`]: writes header lines spliced into a forwarded head

mod header_decoder;
mod header_encoder;

pub use header_decoder::FramingHeaders;
pub use header_decoder::parse_header_line;
pub use header_decoder::parse_start_line;
pub use header_encoder::encode_header;
pub use header_encoder::encode_sifted_line;
