//! Tar container holding one document family.
//!
//! Layout: `metadata.yrs` with the family metadata replica, plus one
//! `<draft id>.draft` entry per draft. Entry order does not matter.

use std::io::Read;

use crate::author::DraftId;
use crate::error::{Result, UpwellError};

pub const METADATA_ENTRY: &str = "metadata.yrs";
pub const DRAFT_EXT: &str = ".draft";

/// Entries read back from a container, still unparsed.
#[derive(Debug, Default)]
pub(crate) struct Contents {
    pub metadata: Vec<u8>,
    pub drafts: Vec<(DraftId, Vec<u8>)>,
}

pub(crate) fn write<'a>(
    metadata: &[u8],
    drafts: impl IntoIterator<Item = (&'a str, &'a [u8])>,
) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut count = 0usize;
    for (id, bytes) in drafts {
        append(&mut builder, &format!("{id}{DRAFT_EXT}"), bytes)?;
        count += 1;
    }
    append(&mut builder, METADATA_ENTRY, metadata)?;
    let archive = builder.into_inner()?;
    log::debug!("wrote container with {count} drafts, {} bytes", archive.len());
    Ok(archive)
}

fn append(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

pub(crate) fn read(bytes: &[u8]) -> Result<Contents> {
    let mut archive = tar::Archive::new(bytes);
    let mut metadata = None;
    let mut drafts = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        if name == METADATA_ENTRY {
            metadata = Some(data);
        } else if let Some(id) = name.strip_suffix(DRAFT_EXT) {
            drafts.push((id.to_string(), data));
        } else {
            log::warn!("skipping unknown container entry '{name}'");
        }
    }

    Ok(Contents {
        metadata: metadata.ok_or(UpwellError::MissingMetadata)?,
        drafts,
    })
}
