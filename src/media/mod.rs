//! External media tooling: sniffing, integrity probing and transcoding.

pub mod prober;
pub mod sniffer;
pub mod tool;
pub mod transcoder;

pub use prober::{IntegrityCheck, IntegrityProber, ProbeReport};
pub use sniffer::{FormatSniffer, SniffStrategy};
pub use tool::{run_tool, ToolError, ToolOutput};
pub use transcoder::{Converter, TranscodeKind, Transcoder};
