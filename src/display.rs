// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Text rendering shared by the chunk listing and the patch list.

use std::fmt::{Display, Formatter, Result};

/// Bytes per row of a payload dump.
const DUMP_WIDTH: usize = 16;

/// How much of a chunk's payload a listing shows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PayloadFormat {
    #[default]
    None,

    /// Offset-prefixed rows of hex bytes beneath the chunk line.
    Hex,
}

/// Options for listing [Chunks](super::Chunk) and [patches](super::patch::PatchEntryItem).
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub payload_format: PayloadFormat,

    /// List tombstoned chunks alongside live ones.
    pub include_invalidated: bool,

    pub indent_level: u8,
}

impl Options {
    /// The same options, one level deeper.
    pub fn nested(&self) -> Self {
        Self {
            indent_level: self.indent_level.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn write_indent(&self, f: &mut Formatter) -> Result {
        write!(f, "{:width$}", "", width = 4 * (self.indent_level as usize))
    }

    /// Writes `payload` on the lines following the current one, as chosen by `payload_format`.
    pub fn write_payload(&self, f: &mut Formatter, payload: &[u8]) -> Result {
        if self.payload_format == PayloadFormat::None {
            return Ok(());
        }
        let rows = self.nested();
        for (row, bytes) in payload.chunks(DUMP_WIDTH).enumerate() {
            writeln!(f)?;
            rows.write_indent(f)?;
            write!(f, "{:06X}:", row * DUMP_WIDTH)?;
            for byte in bytes {
                write!(f, " {byte:02X}")?;
            }
        }
        Ok(())
    }
}

/// Display that honors listing [Options].
pub trait DisplayWithOptions: Display {
    fn fmt_with_options(&self, f: &mut Formatter<'_>, _options: &Options) -> Result {
        self.fmt(f)
    }
}

/// Binds a value to the options it should be listed with, for use in `write!`.
pub struct RomDisplayable<'a, P: DisplayWithOptions> {
    p: &'a P,
    options: Options,
}

impl<'a, P> RomDisplayable<'a, P>
where
    P: DisplayWithOptions,
{
    pub fn wrap(p: &'a P, options: Options) -> RomDisplayable<'a, P> {
        Self { p, options }
    }
}

impl<P> Display for RomDisplayable<'_, P>
where
    P: DisplayWithOptions,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.p.fmt_with_options(f, &self.options)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Payload(Vec<u8>, Options);

    impl Display for Payload {
        fn fmt(&self, f: &mut Formatter<'_>) -> Result {
            write!(f, "payload")?;
            self.1.write_payload(f, &self.0)
        }
    }

    #[test]
    fn test_payload_rows() {
        let options = Options {
            payload_format: PayloadFormat::Hex,
            indent_level: 1,
            ..Default::default()
        };
        let text = Payload((0..18).collect(), options).to_string();
        assert_eq!(
            "payload\n        000000: 00 01 02 03 04 05 06 07 08 09 0A 0B 0C 0D 0E 0F\n        000010: 10 11",
            text
        );
        assert_eq!("payload", Payload(vec![1, 2], Options::default()).to_string());
    }
}
