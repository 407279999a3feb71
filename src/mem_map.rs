//! Locates this library's own executable mapping in the process image.
//!
//! Syscall User Dispatch takes one exempt address range: syscall instructions
//! inside it bypass the dispatch trap. Handing the kernel our own text
//! segment is what lets the SIGSYS handler issue syscalls without recursing.

use crate::error::{Error, Result};
use crate::log::LogLevel::LogDebug;
use std::fs::File;
use std::io::{BufRead, BufReader};

/// An executable mapping from `/proc/self/maps`.
#[derive(Clone, Debug)]
pub struct AddrRange {
    pub start: usize,
    pub length: usize,
    pub path: String,
}

/// Finds the executable mapping containing this library's text (located via
/// the address of a function compiled into it) and returns its range. The
/// path is the loaded object the mapping backs: the `sysfault` shared object
/// when loaded dynamically, the executable itself when linked statically.
pub(crate) fn get_self_text() -> Result<AddrRange> {
    let marker = text_marker as usize;
    let f = File::open("/proc/self/maps")
        .map_err(|e| Error::MapUnavailable(format!("cannot open /proc/self/maps: {}", e)))?;
    for line in BufReader::new(f).lines() {
        let line =
            line.map_err(|e| Error::MapUnavailable(format!("cannot read /proc/self/maps: {}", e)))?;
        let mut fields = line.split_whitespace();
        let range = match fields.next() {
            Some(r) => r,
            None => continue,
        };
        let perms = fields.next().unwrap_or("");
        if !perms.contains('x') {
            continue;
        }
        let (start, end) = parse_range(range, &line);
        if !(start..end).contains(&marker) {
            continue;
        }
        let path = match line.find('/') {
            Some(loc) => line[loc..].to_owned(),
            None => String::new(),
        };
        log!(
            LogDebug,
            "self text is {:#x}..{:#x} backed by `{}'",
            start,
            end,
            path
        );
        return Ok(AddrRange {
            start,
            length: end - start,
            path,
        });
    }
    Err(Error::MapUnavailable(
        "no executable mapping covers this library's text".into(),
    ))
}

fn parse_range(range: &str, line: &str) -> (usize, usize) {
    let parse = |s: &str| usize::from_str_radix(s, 16);
    let mut parts = range.splitn(2, '-');
    match (parts.next().map(parse), parts.next().map(parse)) {
        (Some(Ok(start)), Some(Ok(end))) => (start, end),
        _ => fatal!("malformed /proc/self/maps line: `{}'", line),
    }
}

// The address this module searches the memory map for.
#[inline(never)]
fn text_marker() {}
