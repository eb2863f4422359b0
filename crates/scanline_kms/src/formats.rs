//! IN_FORMATS blob decoding
//!
//! A plane's `IN_FORMATS` property points at a blob laid out as `struct
//! drm_format_modifier_blob`: a header with byte offsets to an array of fourcc codes and an
//! array of `struct drm_format_modifier`. Each modifier entry carries a 64 bit mask of the
//! formats it applies to, starting at format index `offset`.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use log::{debug, trace, warn};

use crate::backend::{KmsBackend, ObjectProperties};
use crate::property::{PlaneProperty, PropertyTable};
use crate::{KmsError, Result};

const fn fourcc(code: &[u8; 4]) -> u32 {
    code[0] as u32 | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// `DRM_FORMAT_XRGB8888`, the only scanout format the pipeline allocates
pub const FORMAT_XRGB8888: u32 = fourcc(b"XR24");
/// `DRM_FORMAT_ARGB8888`
pub const FORMAT_ARGB8888: u32 = fourcc(b"AR24");

/// `DRM_FORMAT_MOD_LINEAR`
pub const MODIFIER_LINEAR: u64 = 0;
/// `DRM_FORMAT_MOD_INVALID`
pub const MODIFIER_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlobHeader {
    version: u32,
    flags: u32,
    count_formats: u32,
    formats_offset: u32,
    count_modifiers: u32,
    modifiers_offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ModifierEntry {
    formats: u64,
    offset: u32,
    pad: u32,
    modifier: u64,
}

/// Reads a `T` at byte `offset` of `blob`, whatever its alignment.
fn read_at<T: Pod>(blob: &[u8], offset: usize) -> Result<T> {
    let bytes = offset
        .checked_add(size_of::<T>())
        .and_then(|end| blob.get(offset..end))
        .ok_or(KmsError::MalformedBlob("IN_FORMATS"))?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

/// Appends every modifier the blob advertises for `format` to `modifiers`.
///
/// A blob that does not list `format`, or lists it without modifiers, appends nothing. Returns
/// the number of modifiers appended.
pub fn collect_modifiers(blob: &[u8], format: u32, modifiers: &mut Vec<u64>) -> Result<usize> {
    let header: BlobHeader = read_at(blob, 0)?;

    let mut index = None;
    for i in 0..header.count_formats as usize {
        let code: u32 = read_at(blob, header.formats_offset as usize + i * size_of::<u32>())?;
        if code == format {
            index = Some(i as u64);
            break;
        }
    }
    let Some(index) = index else {
        trace!("IN_FORMATS does not list format {format:#010x}");
        return Ok(0);
    };

    let mut appended = 0;
    for i in 0..header.count_modifiers as usize {
        let entry: ModifierEntry = read_at(
            blob,
            header.modifiers_offset as usize + i * size_of::<ModifierEntry>(),
        )?;

        let offset = entry.offset as u64;
        if index < offset || index > offset + 63 {
            continue;
        }
        if entry.formats & (1 << (index - offset)) == 0 {
            continue;
        }

        modifiers
            .try_reserve(1)
            .map_err(|_| KmsError::AllocationFailure("modifier list"))?;
        modifiers.push(entry.modifier);
        appended += 1;
    }

    Ok(appended)
}

/// Fills `modifiers` from the IN_FORMATS blob of a plane, for XRGB8888.
///
/// A plane without IN_FORMATS leaves the list empty, buffers are then allocated without
/// explicit modifiers.
pub(crate) fn populate_modifiers(
    backend: &impl KmsBackend,
    props: &PropertyTable<PlaneProperty>,
    live: &ObjectProperties,
    modifiers: &mut Vec<u64>,
) -> Result<()> {
    let blob_id = props.value(PlaneProperty::InFormats, live, 0);
    if blob_id == 0 {
        warn!("Plane does not expose IN_FORMATS, allocating without explicit modifiers");
        return Ok(());
    }

    let blob = backend.blob_data(blob_id as u32)?;
    let count = collect_modifiers(&blob, FORMAT_XRGB8888, modifiers)?;
    debug!("IN_FORMATS lists {count} modifiers for XRGB8888: {modifiers:x?}");

    Ok(())
}

/// Builds an IN_FORMATS blob, the way the kernel lays it out.
#[cfg(test)]
pub(crate) fn build_blob(formats: &[u32], entries: &[(u64, u32, u64)]) -> Vec<u8> {
    let header_size = size_of::<BlobHeader>();
    let formats_size = formats.len() * size_of::<u32>();
    // The kernel aligns the modifier array to 8 bytes
    let modifiers_offset = (header_size + formats_size).next_multiple_of(8);

    let header = BlobHeader {
        version: 1,
        flags: 0,
        count_formats: formats.len() as u32,
        formats_offset: header_size as u32,
        count_modifiers: entries.len() as u32,
        modifiers_offset: modifiers_offset as u32,
    };

    let mut blob = bytemuck::bytes_of(&header).to_vec();
    for format in formats {
        blob.extend_from_slice(&format.to_ne_bytes());
    }
    blob.resize(modifiers_offset, 0);
    for &(mask, offset, modifier) in entries {
        let entry = ModifierEntry {
            formats: mask,
            offset,
            pad: 0,
            modifier,
        };
        blob.extend_from_slice(bytemuck::bytes_of(&entry));
    }

    blob
}
