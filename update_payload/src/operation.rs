use crate::error::{self, Result};
use crate::manifest::{extents_length, Extent, InstallOperation, OperationType};
use bzip2::read::BzDecoder;
use snafu::{ensure, OptionExt, ResultExt};
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;

/// Applies one install operation. `data` is the operation's blob from the
/// payload data region (empty for operations without one); `source` is the
/// old image (present whenever the manifest contains source-reading
/// operations for this target), `destination` the new one.
pub(crate) fn apply(
    index: usize,
    op: &InstallOperation,
    data: &[u8],
    source: Option<&File>,
    destination: &File,
) -> Result<()> {
    let old_image = || {
        source.context(error::ProcessorStateSnafu {
            detail: "source image not open for a source-reading operation",
        })
    };
    let produced = match op.op_type {
        OperationType::Replace => data.to_vec(),
        OperationType::ReplaceBz => {
            let mut decompressed = Vec::new();
            BzDecoder::new(data)
                .read_to_end(&mut decompressed)
                .context(error::BzDecodeSnafu)?;
            decompressed
        }
        OperationType::Move | OperationType::SourceCopy => {
            read_extents(old_image()?, &op.src_extents)?
        }
        OperationType::Bsdiff | OperationType::SourceBsdiff => {
            let old = read_extents(old_image()?, &op.src_extents)?;
            let mut new = Vec::with_capacity(extents_length(&op.dst_extents) as usize);
            bsdiff::patch(&old, &mut &data[..], &mut new).context(error::BsdiffApplySnafu)?;
            new
        }
    };
    write_extents(index, destination, &op.dst_extents, &produced)
}

fn read_extents(file: &File, extents: &[Extent]) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(extents_length(extents) as usize);
    for extent in extents {
        let start = bytes.len();
        bytes.resize(start + extent.length as usize, 0);
        file.read_exact_at(&mut bytes[start..], extent.offset)
            .context(error::SourceReadSnafu)?;
    }
    Ok(bytes)
}

fn write_extents(index: usize, file: &File, extents: &[Extent], bytes: &[u8]) -> Result<()> {
    let expected = extents_length(extents);
    ensure!(
        bytes.len() as u64 == expected,
        error::DestinationSizeMismatchSnafu {
            operation: index,
            produced: bytes.len() as u64,
            expected,
        }
    );
    let mut consumed = 0usize;
    for extent in extents {
        let end = consumed + extent.length as usize;
        file.write_all_at(&bytes[consumed..end], extent.offset)
            .context(error::TargetWriteSnafu)?;
        consumed = end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{OperationTarget, OperationType};
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use std::io::Write;
    use tempfile::tempfile;

    fn op(
        op_type: OperationType,
        src: Vec<Extent>,
        dst: Vec<Extent>,
        data_length: u64,
    ) -> InstallOperation {
        InstallOperation {
            op_type,
            target: OperationTarget::Partition,
            data_offset: 0,
            data_length,
            data_sha256: None,
            src_extents: src,
            dst_extents: dst,
        }
    }

    fn file_with(content: &[u8]) -> File {
        let file = tempfile().unwrap();
        file.write_all_at(content, 0).unwrap();
        file
    }

    fn read_back(file: &File, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, 0).unwrap();
        buf
    }

    #[test]
    fn replace_writes_literal_bytes() {
        let source = tempfile().unwrap();
        let destination = file_with(&[0u8; 8]);
        let operation = op(OperationType::Replace, vec![], vec![Extent::new(2, 4)], 4);
        apply(0, &operation, b"abcd", Some(&source), &destination).unwrap();
        assert_eq!(read_back(&destination, 8), b"\0\0abcd\0\0");
    }

    #[test]
    fn replace_bz_decompresses_first() {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello bz").unwrap();
        let compressed = encoder.finish().unwrap();

        let source = tempfile().unwrap();
        let destination = file_with(&[0u8; 8]);
        let operation = op(
            OperationType::ReplaceBz,
            vec![],
            vec![Extent::new(0, 8)],
            compressed.len() as u64,
        );
        apply(0, &operation, &compressed, Some(&source), &destination).unwrap();
        assert_eq!(read_back(&destination, 8), b"hello bz");
    }

    #[test]
    fn source_copy_scatters_extents() {
        let source = file_with(b"0123456789");
        let destination = file_with(&[0u8; 10]);
        let operation = op(
            OperationType::SourceCopy,
            vec![Extent::new(0, 2), Extent::new(8, 2)],
            vec![Extent::new(4, 4)],
            0,
        );
        apply(0, &operation, &[], Some(&source), &destination).unwrap();
        assert_eq!(read_back(&destination, 10), b"\0\0\0\00189\0\0");
    }

    #[test]
    fn bsdiff_round_trip() {
        let old = b"the quick brown fox".to_vec();
        let new = b"the quick red fox!!".to_vec();
        let mut patch = Vec::new();
        bsdiff::diff(&old, &new, &mut patch).unwrap();

        let source = file_with(&old);
        let destination = file_with(&vec![0u8; new.len()]);
        let operation = op(
            OperationType::Bsdiff,
            vec![Extent::new(0, old.len() as u64)],
            vec![Extent::new(0, new.len() as u64)],
            patch.len() as u64,
        );
        apply(0, &operation, &patch, Some(&source), &destination).unwrap();
        assert_eq!(read_back(&destination, new.len()), new);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let source = tempfile().unwrap();
        let destination = file_with(&[0u8; 8]);
        let operation = op(OperationType::Replace, vec![], vec![Extent::new(0, 8)], 4);
        assert!(matches!(
            apply(0, &operation, b"abcd", Some(&source), &destination),
            Err(crate::Error::DestinationSizeMismatch { .. })
        ));
    }
}
