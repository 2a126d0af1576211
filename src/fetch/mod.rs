// src/fetch/mod.rs

use anyhow::{bail, Context, Result};
use std::future::Future;
use std::io::{Cursor, Read};
use tracing::debug;
use url::Url;
use zip::ZipArchive;

pub mod http;

pub use http::HttpFetcher;

/// Something that can turn a dataset URL into raw bytes.
pub trait Fetch: Send + Sync {
    fn fetch(&self, url: &Url) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Normalize a downloaded body into CSV bytes.
///
/// ZIP archives are unpacked to their first `.csv` entry and a leading UTF-8
/// BOM is dropped so it doesn't end up glued to the first column name.
pub fn decode_payload(bytes: Vec<u8>) -> Result<Vec<u8>> {
    let mut bytes = if bytes.starts_with(ZIP_MAGIC) {
        first_csv_in_zip(&bytes)?
    } else {
        bytes
    };
    if bytes.starts_with(UTF8_BOM) {
        bytes.drain(..UTF8_BOM.len());
    }
    Ok(bytes)
}

fn first_csv_in_zip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("reading ZIP payload")?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("accessing ZIP entry #{}", i))?;
        let name = entry.name().to_string();
        if entry.is_file() && name.to_lowercase().ends_with(".csv") {
            debug!(entry = %name, "using CSV entry from ZIP payload");
            // entry sizes in the archive header are untrusted
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .with_context(|| format!("reading {} from ZIP payload", name))?;
            return Ok(buf);
        }
    }
    bail!("ZIP payload contains no .csv entry")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::CompressionMethod;

    fn zip_of(entries: &[(&str, &str)]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options: FileOptions<'_, ()> =
                FileOptions::default().compression_method(CompressionMethod::Stored);
            for (name, body) in entries {
                zip.start_file(*name, options)?;
                zip.write_all(body.as_bytes())?;
            }
            zip.finish()?;
        }
        Ok(buf)
    }

    #[test]
    fn test_plain_csv_passes_through() -> Result<()> {
        let body = b"a,b\n1,2\n".to_vec();
        assert_eq!(decode_payload(body.clone())?, body);
        Ok(())
    }

    #[test]
    fn test_bom_is_stripped() -> Result<()> {
        let mut body = UTF8_BOM.to_vec();
        body.extend_from_slice(b"county,count\nAdams,3\n");
        assert_eq!(decode_payload(body)?, b"county,count\nAdams,3\n".to_vec());
        Ok(())
    }

    #[test]
    fn test_zip_uses_first_csv_entry() -> Result<()> {
        let zipped = zip_of(&[
            ("README.txt", "not data"),
            ("data/enrollment.csv", "district,students\nDenver,90000\n"),
            ("other.csv", "x\n1\n"),
        ])?;
        let out = decode_payload(zipped)?;
        assert_eq!(out, b"district,students\nDenver,90000\n".to_vec());
        Ok(())
    }

    #[test]
    fn test_zip_entry_read_in_full() -> Result<()> {
        let mut body = String::from("district,students\n");
        for i in 0..5_000 {
            body.push_str(&format!("District {},{}\n", i, i * 10));
        }
        let zipped = zip_of(&[("big.csv", body.as_str())])?;
        assert_eq!(decode_payload(zipped)?, body.into_bytes());
        Ok(())
    }

    #[test]
    fn test_zip_without_csv_is_an_error() -> Result<()> {
        let zipped = zip_of(&[("notes.txt", "nothing here")])?;
        let err = decode_payload(zipped).unwrap_err();
        assert!(err.to_string().contains("no .csv entry"));
        Ok(())
    }
}
