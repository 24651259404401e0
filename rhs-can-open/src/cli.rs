//! The `can_open` console command
//!
//! ```text
//! can_open -f <id>          watch a CAN id
//! can_open -e <id>          stop watching a CAN id
//! can_open -c               stop watching all ids
//! can_open -l               list watched ids
//! can_open -s <id> [bytes]  send a frame through the first node
//! can_open -m               usage
//! ```
//!
//! Ids and data bytes are hexadecimal.

use core::fmt::Write;
use std::sync::Arc;

use defmt_or_log::info;
use rhs_common::{
    messages::{MAX_DATA_LENGTH, MAX_STANDARD_ID},
    Message,
};
use rhs_core::cli::{Cli, CliError};

use crate::app::CanOpenApp;

/// Name of the console command
pub const COMMAND_NAME: &str = "can_open";

fn parse_hex(s: &str) -> Option<u32> {
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(s, 16).ok()
}

/// Parse an 11-bit CAN id
fn parse_id(s: Option<&str>) -> Option<u16> {
    parse_hex(s?)
        .and_then(|id| u16::try_from(id).ok())
        .filter(|id| *id <= MAX_STANDARD_ID)
}

fn usage(out: &mut dyn Write) {
    write!(
        out,
        "Usage:\r\n\
         -f <id>: Add a CAN ID to the filter list\r\n\
         -e <id>: Remove a CAN ID from the filter list\r\n\
         -c: Clear the filter list\r\n\
         -l: List all CAN IDs in the filter list\r\n\
         -s <id> [bytes]: Send a CAN package with the specified ID\r\n\
         -m: Show this manual\r\n"
    )
    .ok();
}

fn invalid(out: &mut dyn Write) {
    write!(out, "Invalid argument\r\n").ok();
}

impl CanOpenApp {
    /// Handle one `can_open` command line
    pub fn command(&self, args: Option<&str>, out: &mut dyn Write) {
        let Some(args) = args else {
            invalid(out);
            return;
        };
        let mut words = args.split_whitespace();
        let flag = words.next();
        let value = words.next();

        match flag {
            Some("-f") => match parse_id(value) {
                Some(id) => {
                    self.filter().add(id);
                    write!(out, "Added to view id 0x{id:03X}\r\n").ok();
                }
                None => invalid(out),
            },
            Some("-e") => match parse_id(value) {
                Some(id) if self.filter().remove(id) => {
                    write!(out, "Removed from view id 0x{id:03X}\r\n").ok();
                }
                Some(id) => {
                    write!(out, "ID 0x{id:03X} not found in filter list\r\n").ok();
                }
                None => invalid(out),
            },
            Some("-c") => {
                self.filter().clear();
                write!(out, "Cleared filter list\r\n").ok();
            }
            Some("-l") => {
                write!(out, "CAN ID list :\r\n").ok();
                for id in self.filter().ids() {
                    write!(out, "0x{id:03X}\r\n").ok();
                }
            }
            Some("-s") => {
                let Some(id) = parse_id(value) else {
                    invalid(out);
                    return;
                };
                let mut data = heapless::Vec::<u8, MAX_DATA_LENGTH>::new();
                for word in words {
                    let Some(byte) = parse_hex(word).and_then(|b| u8::try_from(b).ok()) else {
                        invalid(out);
                        return;
                    };
                    if data.push(byte).is_err() {
                        break;
                    }
                }
                let sent = self
                    .port(0)
                    .map(|port| port.send(&Message::new(id, &data)).is_ok())
                    .unwrap_or(false);
                if sent {
                    info!("Sent CAN package with ID 0x{:03X}", id);
                    write!(out, "Sent CAN package with ID 0x{id:03X}\r\n").ok();
                } else {
                    write!(out, "Failed to send CAN package with ID 0x{id:03X}\r\n").ok();
                }
            }
            Some("-m") => usage(out),
            _ => invalid(out),
        }
    }

    /// Register the `can_open` command on `cli`
    pub fn register_command(self: &Arc<Self>, cli: &Cli) -> Result<(), CliError> {
        let app = self.clone();
        cli.add_command(COMMAND_NAME, move |args: Option<&str>, out: &mut dyn Write| {
            app.command(args, out)
        })
    }
}
