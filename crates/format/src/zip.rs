//! ZIP central-directory inspection.
//!
//! Old archivers wrote entry names in whatever the local code page happened
//! to be and never set the UTF-8 flag (general purpose bit 11). Plenty of
//! newer ones write UTF-8 and *also* don't set the flag. The only way to
//! tell them apart is to walk the central directory and look at the raw name
//! bytes, which is all this module does. It is deliberately not a ZIP reader.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::io::{Read, Seek, SeekFrom};

/// Local file header signature, found at offset zero of any non-empty ZIP.
pub const LOCAL_FILE_HEADER: [u8; 4] = *b"PK\x03\x04";
const END_OF_CENTRAL_DIRECTORY: [u8; 4] = *b"PK\x05\x06";
const ZIP64_END_LOCATOR: [u8; 4] = *b"PK\x06\x07";
const ZIP64_END_RECORD: [u8; 4] = *b"PK\x06\x06";
const CENTRAL_DIRECTORY_ENTRY: [u8; 4] = *b"PK\x01\x02";

const END_OF_CENTRAL_DIRECTORY_SIZE: u64 = 22;
const ZIP64_END_LOCATOR_SIZE: u64 = 20;
const CENTRAL_DIRECTORY_ENTRY_SIZE: usize = 46;
const MAX_COMMENT_SIZE: u64 = 0xffff;
const FLAG_UTF8: u16 = 0x0800;

/// Returns `true` if `head` starts with a local file header.
#[must_use]
pub fn has_signature(head: &[u8]) -> bool {
    head.starts_with(&LOCAL_FILE_HEADER)
}

/// Check whether every entry name in the central directory is UTF-8.
///
/// Entries flagged as UTF-8 are trusted without looking at their bytes.
/// Returns `Ok(false)` as soon as one unflagged name fails to decode.
///
/// # Errors
/// [`Malformed`](ErrorKind::Malformed) when the end-of-central-directory
/// record (or a Zip64 record it points to) can't be found, or a central
/// directory signature is wrong.
pub fn is_utf8_encoded<R: Read + Seek>(reader: &mut R) -> Result<bool> {
    let end = find_end_of_central_directory(reader)?;

    let mut entries = u64::from(read_u16(reader, end + 10)?);
    let mut offset = u64::from(read_u32(reader, end + 16)?);

    if entries == 0xffff || offset == 0xffff_ffff {
        tracing::trace!("zip64 central directory");
        let locator = end
            .checked_sub(ZIP64_END_LOCATOR_SIZE)
            .ok_or_else(|| exn::Exn::from(ErrorKind::Malformed("missing zip64 locator")))?;
        if read_signature(reader, locator)? != ZIP64_END_LOCATOR {
            exn::bail!(ErrorKind::Malformed("bad zip64 locator signature"));
        }
        let record = read_u64(reader, locator + 8)?;
        if read_signature(reader, record)? != ZIP64_END_RECORD {
            exn::bail!(ErrorKind::Malformed("bad zip64 record signature"));
        }
        entries = read_u64(reader, record + 32)?;
        offset = read_u64(reader, record + 48)?;
    }

    reader.seek(SeekFrom::Start(offset)).or_raise(|| ErrorKind::Io)?;
    let mut header = [0u8; CENTRAL_DIRECTORY_ENTRY_SIZE];
    let mut name = Vec::new();
    for _ in 0..entries {
        reader.read_exact(&mut header).or_raise(|| ErrorKind::Io)?;
        if header[0..4] != CENTRAL_DIRECTORY_ENTRY {
            exn::bail!(ErrorKind::Malformed("bad central directory signature"));
        }
        let flags = u16::from_le_bytes([header[8], header[9]]);
        let name_len = usize::from(u16::from_le_bytes([header[28], header[29]]));
        let extra_len = i64::from(u16::from_le_bytes([header[30], header[31]]));
        let comment_len = i64::from(u16::from_le_bytes([header[32], header[33]]));

        if flags & FLAG_UTF8 == 0 {
            name.resize(name_len, 0);
            reader.read_exact(&mut name).or_raise(|| ErrorKind::Io)?;
            if std::str::from_utf8(&name).is_err() {
                tracing::debug!(name = %String::from_utf8_lossy(&name), "entry name is not UTF-8");
                return Ok(false);
            }
        } else {
            reader.seek(SeekFrom::Current(name_len as i64)).or_raise(|| ErrorKind::Io)?;
        }
        reader.seek(SeekFrom::Current(extra_len + comment_len)).or_raise(|| ErrorKind::Io)?;
    }

    Ok(true)
}

/// Scan backwards for the end-of-central-directory record. It sits in the
/// last 22 bytes unless the archive has a comment (at most 64KiB).
fn find_end_of_central_directory<R: Read + Seek>(reader: &mut R) -> Result<u64> {
    let len = reader.seek(SeekFrom::End(0)).or_raise(|| ErrorKind::Io)?;
    if len < END_OF_CENTRAL_DIRECTORY_SIZE {
        exn::bail!(ErrorKind::Malformed("too short for a ZIP"));
    }
    let last = len - END_OF_CENTRAL_DIRECTORY_SIZE;
    let start = last.saturating_sub(MAX_COMMENT_SIZE);
    // Window covers every possible record start plus its 4-byte signature.
    let window = (last - start + 4) as usize;
    let mut buf = vec![0u8; window];
    reader.seek(SeekFrom::Start(start)).or_raise(|| ErrorKind::Io)?;
    reader.read_exact(&mut buf).or_raise(|| ErrorKind::Io)?;
    match memchr::memmem::rfind(&buf, &END_OF_CENTRAL_DIRECTORY) {
        Some(idx) => Ok(start + idx as u64),
        None => exn::bail!(ErrorKind::Malformed("missing end of central directory")),
    }
}

fn read_at<const N: usize, R: Read + Seek>(reader: &mut R, pos: u64) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.seek(SeekFrom::Start(pos)).or_raise(|| ErrorKind::Io)?;
    reader.read_exact(&mut buf).or_raise(|| ErrorKind::Io)?;
    Ok(buf)
}

fn read_signature<R: Read + Seek>(reader: &mut R, pos: u64) -> Result<[u8; 4]> {
    read_at::<4, _>(reader, pos)
}

fn read_u16<R: Read + Seek>(reader: &mut R, pos: u64) -> Result<u16> {
    read_at::<2, _>(reader, pos).map(u16::from_le_bytes)
}

fn read_u32<R: Read + Seek>(reader: &mut R, pos: u64) -> Result<u32> {
    read_at::<4, _>(reader, pos).map(u32::from_le_bytes)
}

fn read_u64<R: Read + Seek>(reader: &mut R, pos: u64) -> Result<u64> {
    read_at::<8, _>(reader, pos).map(u64::from_le_bytes)
}
