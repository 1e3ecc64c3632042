// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! The patch list chunk format.
//!
//! # Structure on Disk
//!
//! | Offset | Type   | Description                              |
//! |--------|--------|------------------------------------------|
//! | 0      | `u8`   | Format version.                          |
//! | 1      | `[u8]` | UTF-8 text: fields separated by `;`.     |
//!
//! The fields of every entry are concatenated in order, so an entry's fields are recovered by
//! cutting the field list into runs of the version's arity. Version 1 has 7 fields per entry:
//!
//! | # | Field                                        | Example    |
//! |---|----------------------------------------------|------------|
//! | 0 | File name, relative to the image             | `hook.c`   |
//! | 1 | [PatchType] code                             | `2`        |
//! | 2 | Hook address, hex                            | `802A4C0`  |
//! | 3 | Patch chunk address, hex                     | `78F970`   |
//! | 4 | Stub flag, `0` or `1`                        | `0`        |
//! | 5 | Thumb flag, `0` or `1`                       | `1`        |
//! | 6 | Bytes replaced by the hook, hex              | `B500B081` |
//!
//! Version 2 appends two more:
//!
//! | # | Field                                              | Example     |
//! |---|----------------------------------------------------|-------------|
//! | 7 | [HookString], hex with an optional `P` placeholder | `00480047P` |
//! | 8 | Description                                        | `no damage` |
//!
//! Older lists are upgraded in memory when read. They are only written back in the current
//! version the next time the patch list is saved.

use winnow::combinator::{alt, repeat};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::{one_of, take_while};
use winnow::ModalResult;

use super::{HookString, PatchEntryItem, PatchType};
use crate::{Error, Result};

/// Separates fields in the list text.
pub const DELIMITER: char = ';';

/// The version written by [serialize].
pub const CURRENT_VERSION: u8 = 2;

/// Number of fields per entry for each known version.
pub fn arity(version: u8) -> Option<usize> {
    match version {
        1 => Some(7),
        2 => Some(9),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HookToken {
    Byte(u8),
    Placeholder,
}

fn hex_u32(input: &mut &str) -> ModalResult<u32> {
    take_while(1..=8, ('0'..='9', 'a'..='f', 'A'..='F'))
        .try_map(|digits: &str| u32::from_str_radix(digits, 16))
        .parse_next(input)
}

fn hex_byte(input: &mut &str) -> ModalResult<u8> {
    take_while(2, ('0'..='9', 'a'..='f', 'A'..='F'))
        .try_map(|digits: &str| u8::from_str_radix(digits, 16))
        .parse_next(input)
}

fn hex_bytes(input: &mut &str) -> ModalResult<Vec<u8>> {
    repeat(0.., hex_byte).parse_next(input)
}

fn flag(input: &mut &str) -> ModalResult<bool> {
    alt(('0'.value(false), '1'.value(true))).parse_next(input)
}

fn patch_type(input: &mut &str) -> ModalResult<PatchType> {
    take_while(1..=3, '0'..='9')
        .try_map(|digits: &str| digits.parse::<u8>())
        .verify_map(PatchType::from_code)
        .parse_next(input)
}

fn hook_token(input: &mut &str) -> ModalResult<HookToken> {
    alt((
        hex_byte.map(HookToken::Byte),
        one_of(['P', 'p']).value(HookToken::Placeholder),
    ))
    .parse_next(input)
}

fn hook_tokens(input: &mut &str) -> ModalResult<Vec<HookToken>> {
    repeat(0.., hook_token).parse_next(input)
}

/// Parses the textual form of a [HookString].
pub(crate) fn parse_hook_string(text: &str) -> Result<HookString> {
    let tokens = hook_tokens
        .parse(text.trim())
        .map_err(|_| Error::InvalidHookString(format!("{text:?} is not hex bytes and `P`")))?;

    let mut bytes = Vec::new();
    let mut placeholder = None;
    for token in tokens {
        match token {
            HookToken::Byte(b) => bytes.push(b),
            HookToken::Placeholder if placeholder.is_none() => placeholder = Some(bytes.len()),
            HookToken::Placeholder => {
                return Err(Error::InvalidHookString(format!(
                    "{text:?} has more than one placeholder"
                )))
            }
        }
    }
    HookString::new(bytes, placeholder)
}

fn field<'i, O>(
    mut parser: impl Parser<&'i str, O, ErrMode<ContextError>>,
    text: &'i str,
    name: &str,
) -> Result<O> {
    parser
        .parse(text)
        .map_err(|_| Error::CorruptPatchList(format!("bad {name}: {text:?}")))
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn bit(flag: bool) -> &'static str {
    if flag {
        "1"
    } else {
        "0"
    }
}

/// Encodes `entries` as list text in the current version.
pub fn encode_text(entries: &[PatchEntryItem]) -> String {
    let mut fields: Vec<String> = Vec::with_capacity(entries.len() * 9);
    for entry in entries {
        fields.push(entry.file_name.clone());
        fields.push(entry.patch_type.code().to_string());
        fields.push(format!("{:X}", entry.hook_address));
        fields.push(format!("{:X}", entry.patch_address));
        fields.push(bit(entry.is_stub()).to_string());
        fields.push(bit(entry.thumb_mode).to_string());
        fields.push(hex_string(&entry.substituted_bytes));
        fields.push(entry.hook_string.to_string());
        fields.push(entry.description.clone());
    }
    fields.join(&DELIMITER.to_string())
}

/// Serializes `entries` into a patch list chunk payload.
pub fn serialize(entries: &[PatchEntryItem]) -> Vec<u8> {
    let text = encode_text(entries);
    let mut payload = Vec::with_capacity(text.len() + 1);
    payload.push(CURRENT_VERSION);
    payload.extend_from_slice(text.as_bytes());
    payload
}

/// Performs one upgrade step, returning the contents in the next version.
///
/// Contents already at [CURRENT_VERSION] are returned unchanged. Fields that do not form a
/// whole entry are carried over untouched and reported when the result is decoded.
pub fn upgrade(contents: &str, from_version: u8) -> (String, u8) {
    match from_version {
        1 => {
            if contents.is_empty() {
                return (String::new(), 2);
            }
            let fields: Vec<&str> = contents.split(DELIMITER).collect();
            let mut upgraded: Vec<String> = Vec::with_capacity(fields.len() / 7 * 9);
            let mut records = fields.chunks_exact(7);
            for record in records.by_ref() {
                // a bad address is left for decoding to report
                let hook_address = match record[4] {
                    "1" => 0,
                    _ => u32::from_str_radix(record[2], 16).unwrap_or_default(),
                };
                let thumb = record[5] == "1";
                upgraded.extend(record.iter().map(|f| f.to_string()));
                upgraded.push(HookString::default_for(hook_address, thumb).to_string());
                upgraded.push(String::new());
            }
            upgraded.extend(records.remainder().iter().map(|f| f.to_string()));
            (upgraded.join(&DELIMITER.to_string()), 2)
        }
        version => (contents.to_string(), version),
    }
}

/// Upgrades `contents` step by step until it reaches [CURRENT_VERSION].
pub fn upgrade_to_current(contents: &str, from_version: u8) -> Result<String> {
    if arity(from_version).is_none() {
        return Err(Error::UnsupportedVersion {
            found: from_version,
            current: CURRENT_VERSION,
        });
    }

    let mut contents = contents.to_string();
    let mut version = from_version;
    while version < CURRENT_VERSION {
        (contents, version) = upgrade(&contents, version);
    }
    Ok(contents)
}

fn decode_entry(record: &[&str]) -> Result<PatchEntryItem> {
    let file_name = record[0].to_string();
    if file_name.is_empty() {
        return Err(Error::CorruptPatchList("empty file name".into()));
    }
    let hook_string = parse_hook_string(record[7])
        .map_err(|e| Error::CorruptPatchList(format!("bad hook string for {file_name}: {e}")))?;

    let entry = PatchEntryItem {
        patch_type: field(patch_type, record[1], "patch type")?,
        hook_address: field(hex_u32, record[2], "hook address")?,
        patch_address: field(hex_u32, record[3], "patch address")?,
        thumb_mode: field(flag, record[5], "thumb flag")?,
        substituted_bytes: field(hex_bytes, record[6], "substituted bytes")?,
        hook_string,
        description: record[8].to_string(),
        file_name,
    };

    // the stub flag is derived from the hook address
    let stub = field(flag, record[4], "stub flag")?;
    if stub != entry.is_stub() {
        return Err(Error::CorruptPatchList(format!(
            "stub flag disagrees with hook address for {}",
            entry.file_name
        )));
    }
    Ok(entry)
}

/// Decodes list text already in the current version.
pub fn decode_text(text: &str) -> Result<Vec<PatchEntryItem>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let fields: Vec<&str> = text.split(DELIMITER).collect();
    let arity = arity(CURRENT_VERSION).unwrap_or_default();
    if fields.len() % arity != 0 {
        return Err(Error::CorruptPatchList(format!(
            "{} fields is not a multiple of {arity}",
            fields.len()
        )));
    }

    fields.chunks_exact(arity).map(decode_entry).collect()
}

/// Decodes a patch list chunk payload, upgrading older versions.
pub fn deserialize(payload: &[u8]) -> Result<Vec<PatchEntryItem>> {
    let Some((&version, text)) = payload.split_first() else {
        return Err(Error::CorruptPatchList("empty payload".into()));
    };
    let text = std::str::from_utf8(text)
        .map_err(|e| Error::CorruptPatchList(format!("list text is not UTF-8: {e}")))?;
    let text = upgrade_to_current(text, version)?;
    decode_text(&text)
}
