//! Content hashing.
//!
//! A document's SHA-256 digest (lower-case hex) is both its dedup key and
//! its file name under the documents directory.

use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

const READ_BUF_BYTES: usize = 64 * 1024;

/// Hash everything remaining in `reader`.
pub async fn hash_reader<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a whole file, regardless of its current read position.
pub async fn hash_file(file: &mut tokio::fs::File) -> std::io::Result<String> {
    file.seek(SeekFrom::Start(0)).await?;
    hash_reader(file).await
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn known_digest() {
        assert_eq!(
            hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn reader_matches_in_memory_digest() {
        let data = vec![7u8; READ_BUF_BYTES * 3 + 11];
        let mut cursor = std::io::Cursor::new(data.clone());
        assert_eq!(hash_reader(&mut cursor).await.unwrap(), hash_bytes(&data));
    }

    #[tokio::test]
    async fn file_hash_rewinds_first() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("scan.pdf");
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"invoice-4471").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let mut file = tokio::fs::File::open(&path).await.unwrap();
        let first = hash_file(&mut file).await.unwrap();
        let second = hash_file(&mut file).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, hash_bytes(b"invoice-4471"));
    }
}
