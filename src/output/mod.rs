use colored::Colorize;
use log::warn;
use std::collections::BTreeSet;

use crate::pattern::PatternMatch;
use crate::session::SessionPacket;
use crate::store::StoredSession;

/// Console rendering of stored sessions.
pub struct Formatter {
    json: bool,
    hex: bool,
    quiet: bool,
}

impl Formatter {
    pub fn new(json: bool, hex: bool, quiet: bool) -> Self {
        Formatter { json, hex, quiet }
    }

    pub fn print_session(&self, stored: &StoredSession) {
        if self.json {
            match serde_json::to_string(stored) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode session {}: {}", stored.id, e),
            }
            return;
        }

        let s = &stored.session;
        if !self.quiet {
            let patterns: Vec<String> = s.found_patterns.iter().map(|p| p.to_string()).collect();
            eprintln!(
                "{} {} {} {} {} {} ({} packets{}{})",
                format!("SESSION {}", stored.id).cyan().bold(),
                s.protocol.to_string().blue(),
                s.client.to_string().green(),
                "->".dimmed(),
                s.server.to_string().yellow(),
                s.service.to_string().dimmed(),
                s.packets.len(),
                if patterns.is_empty() {
                    String::new()
                } else {
                    format!(", patterns {}", patterns.join(" "))
                },
                if s.tls_decrypted { ", TLS decrypted" } else { "" },
            );
        }

        for packet in &s.packets {
            self.print_packet(packet);
        }
    }

    fn print_packet(&self, packet: &SessionPacket) {
        let content = &packet.packet.content;
        if content.is_empty() {
            return;
        }
        if !self.quiet {
            let arrow = if packet.packet.incoming { ">>" } else { "<<" };
            eprintln!("{} {} bytes", arrow.bold(), content.len());
        }
        if self.hex {
            print_hex(content);
        } else {
            println!("{}", render_highlighted(content, &packet.matches));
        }
        if let Some(plaintext) = &packet.plaintext {
            if !self.quiet {
                eprintln!("{} {} bytes", "TLS".magenta().bold(), plaintext.len());
            }
            println!("{}", render_highlighted(plaintext, &packet.plaintext_matches));
        }
    }
}

/// Render content as text with matched byte ranges highlighted in red.
///
/// Each segment is decoded on its own so highlighting follows byte offsets
/// even when the content is not valid UTF-8.
pub fn render_highlighted(content: &[u8], matches: &BTreeSet<PatternMatch>) -> String {
    let mut ordered: Vec<&PatternMatch> = matches.iter().collect();
    ordered.sort_by_key(|m| m.start);

    let mut out = String::new();
    let mut last = 0;
    for m in ordered {
        if m.start < last || m.end >= content.len() {
            continue;
        }
        out.push_str(&sanitize_control_chars(&String::from_utf8_lossy(&content[last..m.start])));
        let hit = sanitize_control_chars(&String::from_utf8_lossy(&content[m.start..=m.end]));
        out.push_str(&hit.red().bold().to_string());
        last = m.end + 1;
    }
    out.push_str(&sanitize_control_chars(&String::from_utf8_lossy(&content[last..])));
    out
}

/// Replace dangerous control characters with U+FFFD (replacement character).
///
/// Preserves tabs (0x09), newlines (0x0A), and carriage returns (0x0D) since
/// those are expected in text payloads. All other C0 control chars (0x00-0x08,
/// 0x0B-0x0C, 0x0E-0x1F), DEL (0x7F) and C1 controls are replaced to prevent
/// terminal escape sequence injection from crafted packet payloads.
pub fn sanitize_control_chars(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\t' | '\n' | '\r' => c,
            '\x00'..='\x08' | '\x0B'..='\x0C' | '\x0E'..='\x1F' | '\x7F' => '\u{FFFD}',
            // Some terminals interpret C1 controls as escape sequences (CSI = U+009B).
            '\u{0080}'..='\u{009F}' => '\u{FFFD}',
            _ => c,
        })
        .collect()
}

/// Print hex + ASCII dump.
fn print_hex(data: &[u8]) {
    for line in hex_lines(data) {
        println!("{}", line);
    }
}

fn hex_lines(data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let mut line = format!("{:08x}  ", i * 16);
            for (j, byte) in chunk.iter().enumerate() {
                line.push_str(&format!("{:02x} ", byte));
                if j == 7 {
                    line.push(' ');
                }
            }
            for _ in chunk.len()..16 {
                line.push_str("   ");
            }
            if chunk.len() <= 8 {
                line.push(' ');
            }
            line.push_str(" |");
            for &byte in chunk {
                if byte.is_ascii_graphic() || byte == b' ' {
                    line.push(byte as char);
                } else {
                    line.push('.');
                }
            }
            line.push('|');
            line
        })
        .collect()
}
