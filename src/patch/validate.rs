// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Checking patch entries before anything is built or written.
//!
//! Validation failures are recoverable. An [EntryEditor] hands the rejected entry and the
//! reason back to an [EntryCollector] so it can be corrected and submitted again.

use std::mem;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};

use log::{debug, info};

use super::list::DELIMITER;
use super::{HookString, PatchEntryItem};
use crate::io::Image;
use crate::{Error, Result};

/// Checks that `hook_address` suits the instruction set. Thumb hooks must be even and ARM
/// hooks a multiple of four. A zero address is a stub and always passes.
pub fn check_alignment(hook_address: u32, thumb_mode: bool) -> Result<()> {
    let alignment = if thumb_mode { 2 } else { 4 };
    if hook_address != 0 && hook_address % alignment != 0 {
        return Err(Error::MisalignedHook {
            address: hook_address,
            alignment,
        });
    }
    Ok(())
}

/// The canonical directory patch sources for `image` must live under.
///
/// An image without a file uses the working directory.
pub fn image_root(image: &Image) -> Result<PathBuf> {
    let directory = match image.directory() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    Ok(directory.canonicalize()?)
}

/// Resolves `file_name` against `root` and returns it as a `/` separated path relative to
/// `root`.
pub fn resolve_file(root: &Path, file_name: &str) -> Result<String> {
    let candidate = root.join(file_name);
    if !candidate.is_file() {
        return Err(Error::FileNotFound(candidate));
    }
    let canonical = candidate.canonicalize()?;
    let Ok(relative) = canonical.strip_prefix(root) else {
        return Err(Error::FileOutsideImageTree {
            path: canonical,
            root: root.to_path_buf(),
        });
    };

    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}

fn check_delimiter(field: &'static str, value: &str) -> Result<()> {
    if value.contains(DELIMITER) {
        return Err(Error::ReservedDelimiter { field });
    }
    Ok(())
}

fn check_hook(image: &Image, entry: &PatchEntryItem) -> Result<()> {
    if entry.is_stub() {
        return Ok(());
    }
    if entry.hook_string.is_empty() {
        return Err(Error::InvalidHookString(format!(
            "{} has a hook at {:#x} but nothing to write there",
            entry.file_name, entry.hook_address
        )));
    }

    if entry.thumb_mode
        && entry.hook_address % 4 != 0
        && entry.hook_string.needs_word_aligned_hook()
    {
        return Err(Error::InvalidHookString(format!(
            "{} loads its literal from the wrong word at {:#x}; use {}",
            entry.hook_string,
            entry.hook_address,
            HookString::default_for(entry.hook_address, true)
        )));
    }

    // hooks patch the game's code, never the chunk store
    let len = entry.hook_string.written_len();
    let end = entry.hook_address as usize + len;
    if end > image.len() || end > image.free_region().start {
        return Err(Error::HookOutOfBounds {
            address: entry.hook_address,
            len,
        });
    }
    Ok(())
}

/// The bytes a hook overwrites.
fn hook_range(entry: &PatchEntryItem) -> Range<u64> {
    let start = u64::from(entry.hook_address);
    start..start + entry.hook_string.written_len() as u64
}

/// Checks `entry` against the entries it will be stored with. Two hooks may not write to the
/// same byte.
pub fn check_unique(entry: &PatchEntryItem, others: &[PatchEntryItem]) -> Result<()> {
    for other in others {
        if other.file_name == entry.file_name {
            return Err(Error::DuplicateFileName(entry.file_name.clone()));
        }
        if entry.is_stub() || other.is_stub() {
            continue;
        }
        if other.hook_address == entry.hook_address {
            return Err(Error::DuplicateHookAddress(entry.hook_address));
        }
        let (ours, theirs) = (hook_range(entry), hook_range(other));
        if ours.start < theirs.end && theirs.start < ours.end {
            return Err(Error::OverlappingHook {
                address: entry.hook_address,
                other: other.hook_address,
            });
        }
    }
    Ok(())
}

/// Validates a single entry against `image` and the `others` it will be stored with.
///
/// Returns the entry with its file name made relative to the image's directory.
pub fn validate_entry(
    image: &Image,
    entry: &PatchEntryItem,
    others: &[PatchEntryItem],
) -> Result<PatchEntryItem> {
    check_delimiter("file name", &entry.file_name)?;
    check_delimiter("description", &entry.description)?;
    check_alignment(entry.hook_address, entry.thumb_mode)?;
    check_hook(image, entry)?;

    let root = image_root(image)?;
    let file_name = resolve_file(&root, &entry.file_name)?;
    let entry = PatchEntryItem {
        file_name,
        ..entry.clone()
    };
    check_unique(&entry, others)?;
    debug!("{} is valid", entry.file_name);
    Ok(entry)
}

/// Validates every entry of a working set, in order, against the entries before it.
pub fn validate_set(image: &Image, entries: &[PatchEntryItem]) -> Result<Vec<PatchEntryItem>> {
    let mut valid: Vec<PatchEntryItem> = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = validate_entry(image, entry, &valid)?;
        valid.push(entry);
    }
    Ok(valid)
}

/// Supplies entries to an [EntryEditor].
pub trait EntryCollector {
    /// Returns the next entry to validate, or `None` to give up.
    ///
    /// After a rejection `previous` holds the rejected entry and the reason, so the
    /// collector can offer the same contents for correction.
    fn collect(&mut self, previous: Option<(&PatchEntryItem, &Error)>) -> Option<PatchEntryItem>;
}

/// Where an [EntryEditor] is in its cycle.
#[derive(Debug)]
pub enum EditState {
    /// Waiting for the collector's first entry.
    Collecting,

    Validating(PatchEntryItem),

    /// The entry was rejected and will be offered back to the collector.
    Invalid(PatchEntryItem, Error),

    Accepted(PatchEntryItem),

    /// The collector gave up, after the given rejection if any.
    Cancelled(Option<Error>),
}

impl EditState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted(_) | Self::Cancelled(_))
    }
}

/// Validates entries from a collector until one passes or the collector gives up.
pub struct EntryEditor<'a> {
    image: &'a Image,
    others: &'a [PatchEntryItem],
    state: EditState,
}

impl<'a> EntryEditor<'a> {
    /// An editor checking entries against `image` and the `others` they will join.
    pub fn new(image: &'a Image, others: &'a [PatchEntryItem]) -> Self {
        Self {
            image,
            others,
            state: EditState::Collecting,
        }
    }

    pub fn state(&self) -> &EditState {
        &self.state
    }

    /// Advances one transition. Errors that a corrected entry cannot fix, such as I/O
    /// failures, are returned instead of being offered back to the collector.
    pub fn step(&mut self, collector: &mut impl EntryCollector) -> Result<&EditState> {
        let state = mem::replace(&mut self.state, EditState::Cancelled(None));
        self.state = match state {
            EditState::Collecting => match collector.collect(None) {
                Some(entry) => EditState::Validating(entry),
                None => EditState::Cancelled(None),
            },
            EditState::Validating(entry) => {
                match validate_entry(self.image, &entry, self.others) {
                    Ok(valid) => EditState::Accepted(valid),
                    Err(e) if e.is_validation() => {
                        info!("{} rejected: {e}", entry.file_name);
                        EditState::Invalid(entry, e)
                    }
                    Err(e) => return Err(e),
                }
            }
            EditState::Invalid(entry, e) => match collector.collect(Some((&entry, &e))) {
                Some(corrected) => EditState::Validating(corrected),
                None => EditState::Cancelled(Some(e)),
            },
            terminal => terminal,
        };
        Ok(&self.state)
    }

    /// Runs until an entry is accepted or the collector gives up.
    ///
    /// Giving up after a rejection returns that rejection as the error; giving up before
    /// offering anything returns `Ok(None)`.
    pub fn run(mut self, collector: &mut impl EntryCollector) -> Result<Option<PatchEntryItem>> {
        while !self.step(collector)?.is_terminal() {}
        match self.state {
            EditState::Accepted(entry) => Ok(Some(entry)),
            EditState::Cancelled(Some(e)) => Err(e),
            _ => Ok(None),
        }
    }
}

/// Offers a single entry and gives up if it is rejected.
#[derive(Debug)]
pub struct OneShot(Option<PatchEntryItem>);

impl OneShot {
    pub fn new(entry: PatchEntryItem) -> Self {
        Self(Some(entry))
    }
}

impl EntryCollector for OneShot {
    fn collect(&mut self, _previous: Option<(&PatchEntryItem, &Error)>) -> Option<PatchEntryItem> {
        self.0.take()
    }
}

/// Validates `entry` against `others` with an [EntryEditor] driven by `collector`.
pub fn edit_until_valid(
    image: &Image,
    others: &[PatchEntryItem],
    collector: &mut impl EntryCollector,
) -> Result<Option<PatchEntryItem>> {
    EntryEditor::new(image, others).run(collector)
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::io::RomProfile;
    use crate::patch::PatchType;

    fn image_in(dir: &TempDir) -> Image {
        let profile = RomProfile {
            min_size: 0x2000,
            max_size: 0x4000,
            magic_offset: 0,
            magic: b"T".to_vec(),
            free_space_start: 0x1800,
            fill_byte: 0xFF,
        };
        let mut bytes = vec![0u8; 0x2000];
        bytes[0] = b'T';
        Image::new(bytes, profile)
            .expect("image")
            .with_path(&dir.path().join("game.gba"))
    }

    fn entry(file_name: &str, hook_address: u32) -> PatchEntryItem {
        PatchEntryItem {
            file_name: file_name.into(),
            patch_type: PatchType::Binary,
            hook_address,
            hook_string: HookString::default_for(hook_address, true),
            thumb_mode: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_alignment() {
        assert!(matches!(
            check_alignment(0x1001, false),
            Err(Error::MisalignedHook {
                address: 0x1001,
                alignment: 4
            })
        ));
        assert!(matches!(
            check_alignment(0x1001, true),
            Err(Error::MisalignedHook {
                address: 0x1001,
                alignment: 2
            })
        ));
        assert!(check_alignment(0x1000, false).is_ok());
        assert!(check_alignment(0x1002, true).is_ok());
        assert!(check_alignment(0x1002, false).is_err());
        assert!(check_alignment(0, false).is_ok());
    }

    #[test]
    fn test_resolve_file() {
        let dir = TempDir::new().expect("temp dir");
        fs::create_dir(dir.path().join("patches")).expect("mkdir");
        fs::write(dir.path().join("patches/a.bin"), b"\0").expect("write");
        let root = dir.path().canonicalize().expect("root");

        assert_eq!(
            resolve_file(&root, "patches/a.bin").expect("relative"),
            "patches/a.bin"
        );
        let absolute = root.join("patches/a.bin");
        assert_eq!(
            resolve_file(&root, &absolute.to_string_lossy()).expect("absolute"),
            "patches/a.bin"
        );
        assert!(matches!(
            resolve_file(&root, "patches/missing.bin"),
            Err(Error::FileNotFound(_))
        ));

        let elsewhere = TempDir::new().expect("other dir");
        fs::write(elsewhere.path().join("b.bin"), b"\0").expect("write");
        let outside = elsewhere.path().join("b.bin");
        assert!(matches!(
            resolve_file(&root, &outside.to_string_lossy()),
            Err(Error::FileOutsideImageTree { .. })
        ));
    }

    #[test]
    fn test_validate_entry() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("a.bin"), b"\0").expect("write");
        fs::write(dir.path().join("b.bin"), b"\0").expect("write");
        let image = image_in(&dir);

        let a = validate_entry(&image, &entry("a.bin", 0x100), &[]).expect("a");
        assert_eq!(a.file_name, "a.bin");

        let e = validate_entry(&image, &entry("a.bin", 0x200), &[a.clone()]).expect_err("dup");
        assert!(matches!(e, Error::DuplicateFileName(_)));
        let e = validate_entry(&image, &entry("b.bin", 0x100), &[a.clone()]).expect_err("dup");
        assert!(matches!(e, Error::DuplicateHookAddress(0x100)));

        // stubs never collide on their zero hook address
        let stub = validate_entry(&image, &entry("b.bin", 0), &[entry("a.bin", 0)]);
        assert!(stub.is_ok());

        let mut described = entry("b.bin", 0x200);
        described.description = "one;two".into();
        assert!(matches!(
            validate_entry(&image, &described, &[]),
            Err(Error::ReservedDelimiter {
                field: "description"
            })
        ));

        let mut bare = entry("b.bin", 0x200);
        bare.hook_string = HookString::default();
        assert!(matches!(
            validate_entry(&image, &bare, &[]),
            Err(Error::InvalidHookString(_))
        ));

        // the hook would overwrite the start of the free space
        assert!(matches!(
            validate_entry(&image, &entry("b.bin", 0x17FC), &[]),
            Err(Error::HookOutOfBounds {
                address: 0x17FC,
                len: 8
            })
        ));
        assert!(validate_entry(&image, &entry("b.bin", 0x17F8), &[]).is_ok());
    }

    #[test]
    fn test_missing_file_checked_after_alignment() {
        let dir = TempDir::new().expect("temp dir");
        let image = image_in(&dir);
        let mut e = entry("missing.c", 0x101);
        e.thumb_mode = false;
        e.patch_type = PatchType::C;
        assert!(matches!(
            validate_entry(&image, &e, &[]),
            Err(Error::MisalignedHook { .. })
        ));
        e.hook_address = 0x100;
        assert!(matches!(
            validate_entry(&image, &e, &[]),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn test_validate_set() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("a.bin"), b"\0").expect("write");
        fs::write(dir.path().join("b.bin"), b"\0").expect("write");
        let image = image_in(&dir);

        let set = validate_set(&image, &[entry("a.bin", 0x100), entry("b.bin", 0x108)]);
        assert_eq!(set.expect("valid").len(), 2);
        let set = validate_set(&image, &[entry("a.bin", 0x100), entry("b.bin", 0x100)]);
        assert!(matches!(set, Err(Error::DuplicateHookAddress(0x100))));
        let set = validate_set(&image, &[entry("a.bin", 0x100), entry("b.bin", 0x106)]);
        assert!(matches!(
            set,
            Err(Error::OverlappingHook {
                address: 0x106,
                other: 0x100
            })
        ));
    }

    struct Corrector {
        offered: Vec<PatchEntryItem>,
        rejections: Vec<String>,
    }

    impl EntryCollector for Corrector {
        fn collect(
            &mut self,
            previous: Option<(&PatchEntryItem, &Error)>,
        ) -> Option<PatchEntryItem> {
            if let Some((entry, e)) = previous {
                self.rejections.push(format!("{}: {e}", entry.file_name));
            }
            self.offered.pop()
        }
    }

    #[test]
    fn test_editor_retries_until_valid() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("a.bin"), b"\0").expect("write");
        let image = image_in(&dir);

        // offered last to first
        let mut collector = Corrector {
            offered: vec![entry("a.bin", 0x100), entry("a.bin", 0x101)],
            rejections: Vec::new(),
        };
        let accepted = edit_until_valid(&image, &[], &mut collector).expect("edit");
        assert_eq!(accepted.map(|e| e.hook_address), Some(0x100));
        assert_eq!(collector.rejections.len(), 1);
        assert!(collector.rejections[0].starts_with("a.bin: hook address 0x101"));
    }

    #[test]
    fn test_editor_states() {
        let dir = TempDir::new().expect("temp dir");
        let image = image_in(&dir);
        let mut collector = OneShot::new(entry("missing.bin", 0x100));
        let mut editor = EntryEditor::new(&image, &[]);

        assert!(matches!(editor.state(), EditState::Collecting));
        assert!(matches!(
            editor.step(&mut collector).expect("collect"),
            EditState::Validating(_)
        ));
        assert!(matches!(
            editor.step(&mut collector).expect("validate"),
            EditState::Invalid(_, Error::FileNotFound(_))
        ));
        assert!(matches!(
            editor.step(&mut collector).expect("give up"),
            EditState::Cancelled(Some(Error::FileNotFound(_)))
        ));
        assert!(editor.state().is_terminal());

        let e = edit_until_valid(&image, &[], &mut OneShot::new(entry("missing.bin", 0x100)));
        assert!(matches!(e, Err(Error::FileNotFound(_))));
        let mut empty = OneShot(None);
        assert!(matches!(edit_until_valid(&image, &[], &mut empty), Ok(None)));
    }
}
