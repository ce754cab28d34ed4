//! Streams a reconstructed tree as a ustar archive.
//!
//! Entries are emitted depth-first, directories before files at each level,
//! names ascending, so the same tree always produces the same entry order.
//! File bytes flow chunk by chunk through the multi-chunk reader; the first
//! I/O error aborts the stream.

use std::io::{self, Write};

use tar::{Builder, EntryType, Header};

use super::ChunkedFileFS;
use crate::error::Result;

pub fn write_tar<W: Write>(fs: &ChunkedFileFS, writer: W) -> Result<()> {
    let mut builder = Builder::new(writer);
    append_dir(&mut builder, fs, true)?;
    builder.finish()?;
    Ok(())
}

fn append_dir<W: Write>(
    builder: &mut Builder<W>,
    dir: &ChunkedFileFS,
    is_root: bool,
) -> Result<()> {
    if !is_root {
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(dir.stat.mode);
        header.set_mtime(dir.stat.mtime.max(0) as u64);
        builder.append_data(&mut header, format!("{}/", dir.root), io::empty())?;
    }

    for sub in dir.dirs.values() {
        append_dir(builder, sub, false)?;
    }

    for file in dir.files.values() {
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_size(file.size.max(0) as u64);
        header.set_mode(file.stat.mode);
        header.set_mtime(file.stat.mtime.max(0) as u64);
        let mut handle = file.clone_handle();
        builder.append_data(&mut header, &file.name, &mut handle)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FsRow;
    use crate::vfs::tests::MapSource;
    use std::io::Read;
    use std::sync::Arc;

    fn row(path: &str, size: i64, idx: i32, chunk: &crate::vfs::Chunk) -> FsRow {
        FsRow {
            path: path.to_string(),
            file_size: size,
            mode: 0o644,
            updated_at: 1_700_000_000,
            chunk_index: Some(idx),
            chunk_hash: Some(chunk.hash.to_hex()),
            chunk_size: Some(chunk.size),
        }
    }

    #[test]
    fn test_tar_roundtrip() {
        let source = Arc::new(MapSource::new());
        let c1 = source.add(b"first half ".to_vec());
        let c2 = source.add(b"second half".to_vec());
        let c3 = source.add(b"top-level".to_vec());

        let rows = vec![
            row("sub/data.bin", 22, 0, &c1),
            row("sub/data.bin", 22, 1, &c2),
            row("readme.txt", 9, 0, &c3),
        ];
        let fs = ChunkedFileFS::build(&rows, source).unwrap();

        let mut buf = Vec::new();
        write_tar(&fs, &mut buf).unwrap();

        let mut archive = tar::Archive::new(buf.as_slice());
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            seen.push((path, entry.header().entry_type(), content));
        }

        // Dirs before files at every level, names ascending.
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, "sub/");
        assert_eq!(seen[0].1, EntryType::Directory);
        assert_eq!(seen[1].0, "sub/data.bin");
        assert_eq!(seen[1].2, b"first half second half");
        assert_eq!(seen[2].0, "readme.txt");
        assert_eq!(seen[2].2, b"top-level");
    }

    #[test]
    fn test_tar_preserves_stat() {
        let source = Arc::new(MapSource::new());
        let c = source.add(b"payload".to_vec());
        let rows = vec![row("f.bin", 7, 0, &c)];
        let fs = ChunkedFileFS::build(&rows, source).unwrap();

        let mut buf = Vec::new();
        write_tar(&fs, &mut buf).unwrap();

        let mut archive = tar::Archive::new(buf.as_slice());
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        let header = entry.header();
        assert_eq!(header.size().unwrap(), 7);
        assert_eq!(header.mode().unwrap() & 0o777, 0o644);
        assert_eq!(header.mtime().unwrap(), 1_700_000_000);
    }

    #[test]
    fn test_tar_missing_chunk_fails() {
        let source = Arc::new(MapSource::new());
        let c = source.add(b"present".to_vec());
        let rows = vec![row("f.bin", 7, 0, &c)];
        let fs = ChunkedFileFS::build(&rows, Arc::clone(&source) as _).unwrap();

        source.0.lock().clear();
        let mut buf = Vec::new();
        assert!(write_tar(&fs, &mut buf).is_err());
    }
}
