//! §4.8: parses the raw `info` dictionary bytes fetched over the wire (§4.5)
//! into a catalog-ready [`Torrent`] descriptor. Mirrors the Go original's
//! `parseTorrent` (see original_source/torsniff.go) field-for-field, but
//! walks a [`bencode::Value`] instead of a dynamically-typed map so that a
//! missing or oddly-shaped key degrades to the documented default instead
//! of a parse error.

use crate::bencode::Value;
use crate::queue::hex_encode;
use sha1::{Digest, Sha1};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub name: String,
    pub length: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    pub infohash_hex: String,
    pub name: String,
    pub length: i64,
    pub files: Vec<TorrentFile>,
    pub seeds: u32,
    pub leechers: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("info dict failed to decode: {0}")]
    Decode(#[from] crate::bencode::DecodeError),
    #[error("info dict is not a dictionary")]
    NotADict,
}

impl Torrent {
    /// Verifies `sha1(meta) == infohash` (§4.5 step 4 / §8 invariant 4)
    /// before parsing. The coordinator is expected to have already done
    /// this inside the metadata wire, but a direct caller gets the same
    /// guarantee.
    pub fn verify_and_parse(meta: &[u8], infohash: &[u8; 20]) -> Result<Torrent, VerifyError> {
        let mut hasher = Sha1::new();
        hasher.update(meta);
        let digest: [u8; 20] = hasher.finalize().into();
        if &digest != infohash {
            return Err(VerifyError::Sha1Mismatch);
        }
        Ok(Self::from_info_bytes(meta, &hex_encode(infohash))?)
    }

    pub fn from_info_bytes(meta: &[u8], infohash_hex: &str) -> Result<Torrent, ParseError> {
        let dict = Value::decode(meta)?;
        if dict.as_dict().is_none() {
            return Err(ParseError::NotADict);
        }

        let name = dict
            .get("name.utf-8")
            .and_then(Value::as_str)
            .or_else(|| dict.get("name").and_then(Value::as_str))
            .unwrap_or("")
            .to_string();

        let raw_length = dict.get("length").and_then(Value::as_int).unwrap_or(0);

        let mut files = Vec::new();
        let mut total_size: i64 = 0;
        if let Some(list) = dict.get("files").and_then(Value::as_list) {
            for entry in list {
                let path = entry
                    .get("path.utf-8")
                    .and_then(Value::as_list)
                    .or_else(|| entry.get("path").and_then(Value::as_list));
                let filename = path
                    .map(|parts| {
                        parts
                            .iter()
                            .map(stringify_path_component)
                            .collect::<Vec<_>>()
                            .join("/")
                    })
                    .unwrap_or_default();
                let length = entry.get("length").and_then(Value::as_int).unwrap_or(0);
                total_size += length;
                files.push(TorrentFile { name: filename, length });
            }
        }

        let length = if raw_length != 0 { raw_length } else { total_size };

        if files.is_empty() {
            files.push(TorrentFile { name: name.clone(), length });
        }

        Ok(Torrent {
            infohash_hex: infohash_hex.to_string(),
            name,
            length,
            files,
            seeds: 0,
            leechers: 0,
        })
    }

    pub fn with_scrape(mut self, seeds: u32, leechers: u32) -> Torrent {
        self.seeds = seeds;
        self.leechers = leechers;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("sha1(meta) does not match the expected infohash")]
    Sha1Mismatch,
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// `fmt::Sprint`-style stringification of a bencode path component: a byte
/// string decodes to its UTF-8 text, any other value (or invalid UTF-8)
/// falls back to its display form the way Go's `fmt.Sprint` would on a
/// decoded `interface{}`.
fn stringify_path_component(value: &Value) -> String {
    value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_s2_single_file() {
        let meta = b"d6:lengthi12345e4:name8:file.txte";
        let t = Torrent::from_info_bytes(meta, "deadbeef").unwrap();
        assert_eq!(t.name, "file.txt");
        assert_eq!(t.length, 12345);
        assert_eq!(t.files, vec![TorrentFile { name: "file.txt".into(), length: 12345 }]);
    }

    #[test]
    fn scenario_s3_multi_file_utf8_paths() {
        let meta = b"d5:filesld6:lengthi10e4:pathl1:a5:b.txteed6:lengthi20e4:pathl5:c.txteee4:name3:dire";
        let t = Torrent::from_info_bytes(meta, "cafef00d").unwrap();
        assert_eq!(t.name, "dir");
        assert_eq!(t.length, 30);
        assert_eq!(
            t.files,
            vec![
                TorrentFile { name: "a/b.txt".into(), length: 10 },
                TorrentFile { name: "c.txt".into(), length: 20 },
            ]
        );
    }

    #[test]
    fn name_utf8_key_wins_over_name() {
        let meta = b"d4:name5:ascii9:name.utf-84:utf8e";
        let t = Torrent::from_info_bytes(meta, "x").unwrap();
        assert_eq!(t.name, "utf8");
    }

    #[test]
    fn invariant_files_len_at_least_one() {
        let meta = b"d4:name4:onlye";
        let t = Torrent::from_info_bytes(meta, "x").unwrap();
        assert!(!t.files.is_empty());
    }

    #[test]
    fn empty_path_list_yields_empty_filename_not_a_failure() {
        let meta = b"d5:filesld6:lengthi1e4:pathleee4:name1:xe";
        let t = Torrent::from_info_bytes(meta, "x").unwrap();
        assert_eq!(t.files[0].name, "");
    }

    #[test]
    fn verify_and_parse_checks_sha1() {
        let meta = b"d4:name1:x6:lengthi1ee";
        let mut hasher = Sha1::new();
        hasher.update(meta);
        let digest: [u8; 20] = hasher.finalize().into();
        let t = Torrent::verify_and_parse(meta, &digest).unwrap();
        assert_eq!(t.infohash_hex, hex_encode(&digest));
    }

    #[test]
    fn verify_and_parse_rejects_mismatch() {
        let meta = b"d4:name1:x6:lengthi1ee";
        let bad = [0u8; 20];
        assert!(matches!(
            Torrent::verify_and_parse(meta, &bad),
            Err(VerifyError::Sha1Mismatch)
        ));
    }
}
