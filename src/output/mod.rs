use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use colored::Colorize;
use serde_json::json;

use crate::engine::DecodedData;
use crate::protocol::Direction;
use crate::sanitize::{looks_textual, render_text};
use crate::stats::SessionStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Text when the payload looks textual, hex dump otherwise.
    #[default]
    Text,
    Hex,
    Json,
}

pub struct Formatter {
    mode: OutputMode,
    quiet: bool,
}

impl Formatter {
    pub fn new(mode: OutputMode, quiet: bool) -> Self {
        Formatter { mode, quiet }
    }

    pub fn print_data(&self, chunk: &DecodedData, timestamp: SystemTime) {
        match self.mode {
            OutputMode::Json => println!("{}", data_json(chunk, timestamp)),
            OutputMode::Hex => {
                self.print_header(chunk);
                print!("{}", hex_dump(&chunk.data));
            }
            OutputMode::Text => {
                self.print_header(chunk);
                if looks_textual(&chunk.data) {
                    println!("{}", render_text(&chunk.data));
                } else {
                    print!("{}", hex_dump(&chunk.data));
                }
            }
        }
    }

    fn print_header(&self, chunk: &DecodedData) {
        if self.quiet {
            return;
        }
        let dir = match chunk.direction {
            Direction::ClientToServer => chunk.direction.to_string().cyan(),
            Direction::ServerToClient => chunk.direction.to_string().magenta(),
        };
        eprintln!(
            "{} {} {} ({} bytes)",
            "TLS".blue().bold(),
            chunk.key.to_string().green(),
            dir,
            chunk.data.len()
        );
    }

    pub fn print_stats(&self, stats: &SessionStats) {
        if self.mode == OutputMode::Json {
            println!("{}", json!({ "type": "stats", "stats": stats }));
            return;
        }
        eprintln!(
            "{} active={} total={} peak={} missed={} reassembly_bytes={} ack_faults={} fatal={} decrypted={}",
            "STATS".yellow().bold(),
            stats.active,
            stats.total,
            stats.peak,
            stats.missed_data,
            stats.reassembly_bytes,
            stats.ack_faults,
            stats.fatal_sessions,
            stats.decrypted_bytes
        );
    }
}

fn data_json(chunk: &DecodedData, timestamp: SystemTime) -> serde_json::Value {
    let ts = timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    let mut value = json!({
        "type": "data",
        "ts": ts,
        "session": chunk.key.to_string(),
        "direction": chunk.direction,
        "len": chunk.data.len(),
    });
    if looks_textual(&chunk.data) {
        value["payload"] = json!(String::from_utf8_lossy(&chunk.data));
    } else {
        value["payload_hex"] = json!(to_hex(&chunk.data));
    }
    value
}

fn to_hex(data: &[u8]) -> String {
    data.iter().fold(String::with_capacity(data.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Hex + ASCII dump, 16 bytes per line.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", i * 16);

        for (j, byte) in chunk.iter().enumerate() {
            let _ = write!(out, "{:02x} ", byte);
            if j == 7 {
                out.push(' ');
            }
        }

        let pad = 16 - chunk.len();
        for _ in 0..pad {
            out.push_str("   ");
        }
        if chunk.len() <= 8 {
            out.push(' ');
        }

        out.push_str(" |");
        for byte in chunk {
            if byte.is_ascii_graphic() || *byte == b' ' {
                out.push(*byte as char);
            } else {
                out.push('.');
            }
        }
        out.push_str("|\n");
    }
    out
}
