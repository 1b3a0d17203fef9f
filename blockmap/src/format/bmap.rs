// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read, Write},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::{
    stream::{FromReader, ToWriter},
    util,
};

/// Supported major version.
pub const MAJOR_VERSION: u32 = 2;
/// Supported minor version. Documents with a smaller minor version can be
/// read, but everything is written with this version.
pub const MINOR_VERSION: u32 = 0;

#[derive(Debug, Error)]
pub enum Error {
    // Header errors.
    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(FormatVersion),
    #[error("Unknown checksum algorithm: {0:?}")]
    UnknownAlgorithm(String),
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u64),
    #[error("Expected {expected} total blocks for image size {image_size}, but have {actual}")]
    TotalBlocksMismatch {
        image_size: u64,
        expected: u64,
        actual: u64,
    },
    #[error("Expected {expected} mapped blocks, but ranges cover {actual}")]
    MappedBlocksMismatch { expected: u64, actual: u64 },
    #[error("Invalid block range string: {0:?}")]
    InvalidRange(String),
    // Range errors.
    #[error("Range #{index}: Start block {start} exceeds end block {end}")]
    RangeReversed { index: usize, start: u64, end: u64 },
    #[error("Range #{index}: Overlaps or is out of order with previous range ending at {prev_end}")]
    RangeOutOfOrder {
        index: usize,
        prev_end: u64,
        start: u64,
    },
    #[error("Range #{index}: End block {end} exceeds total blocks {total_blocks}")]
    RangeOutOfBounds {
        index: usize,
        end: u64,
        total_blocks: u64,
    },
    #[error("Range #{index}: Checksum has {actual} bytes, but {algorithm} digests have {expected}")]
    RangeChecksumLength {
        index: usize,
        algorithm: ChecksumAlgorithm,
        expected: usize,
        actual: usize,
    },
    #[error("Image checksum has {actual} bytes, but {algorithm} digests have {expected}")]
    ImageChecksumLength {
        algorithm: ChecksumAlgorithm,
        expected: usize,
        actual: usize,
    },
    // Wrapped errors.
    #[error("Failed to parse bmap document")]
    Deserialize(#[source] toml_edit::de::Error),
    #[error("Failed to serialize bmap document")]
    Serialize(#[source] toml_edit::ser::Error),
    #[error("Failed to read bmap document")]
    DocumentRead(#[source] io::Error),
    #[error("Failed to write bmap document")]
    DocumentWrite(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Bmap document version, rendered as `"MAJOR.MINOR"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FormatVersion(pub u32, pub u32);

impl FormatVersion {
    pub fn current() -> Self {
        Self(MAJOR_VERSION, MINOR_VERSION)
    }

    /// Whether a document with this version can be parsed. Newer minor
    /// versions only add informational fields, which we'd ignore anyway, so
    /// only the major version gates parsing.
    pub fn is_supported(self) -> bool {
        self.0 == MAJOR_VERSION
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

impl FromStr for FormatVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| Error::InvalidVersion(s.to_owned()))?;

        let major = major
            .parse::<u32>()
            .map_err(|_| Error::InvalidVersion(s.to_owned()))?;
        let minor = minor
            .parse::<u32>()
            .map_err(|_| Error::InvalidVersion(s.to_owned()))?;

        Ok(Self(major, minor))
    }
}

impl Serialize for FormatVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FormatVersion {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Streaming digest algorithm recorded in the document so that a verifier
/// using a different algorithm fails loudly instead of comparing garbage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn digest_algorithm(self) -> &'static ring::digest::Algorithm {
        match self {
            Self::Sha256 => &ring::digest::SHA256,
            Self::Sha512 => &ring::digest::SHA512,
        }
    }

    pub fn digest_len(self) -> usize {
        self.digest_algorithm().output_len()
    }

    pub fn context(self) -> ring::digest::Context {
        ring::digest::Context::new(self.digest_algorithm())
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(Error::UnknownAlgorithm(s.to_owned())),
        }
    }
}

/// Inclusive range of blocks, rendered as `"START-END"` (or just `"START"`
/// when the range covers a single block).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockRange {
    /// Starting block (inclusive).
    pub start: u64,
    /// Ending block (inclusive).
    pub end: u64,
}

impl BlockRange {
    /// Number of blocks covered.
    pub fn blocks(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Debug for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for BlockRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = match s.split_once('-') {
            Some((start, end)) => (start, end),
            None => (s, s),
        };

        let start = start
            .parse::<u64>()
            .map_err(|_| Error::InvalidRange(s.to_owned()))?;
        let end = end
            .parse::<u64>()
            .map_err(|_| Error::InvalidRange(s.to_owned()))?;

        Ok(Self { start, end })
    }
}

impl Serialize for BlockRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockRange {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A mapped block range and the digest of its content.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MappedRange {
    #[serde(rename = "blocks")]
    pub range: BlockRange,
    #[serde(with = "hex")]
    pub checksum: Vec<u8>,
}

/// In-memory representation of a bmap document.
///
/// Field order is the document order and part of the on-disk contract: two
/// generation passes over identical content produce byte-identical documents.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Bmap {
    pub version: FormatVersion,
    /// Size of the image in bytes, including any trailing hole.
    pub image_size: u64,
    /// Block size in bytes.
    pub block_size: u64,
    /// Total number of blocks: `ceil(image_size / block_size)`.
    pub blocks_count: u64,
    /// Number of blocks covered by [`Self::ranges`].
    pub mapped_blocks_count: u64,
    pub checksum_type: ChecksumAlgorithm,
    /// Digest of the entire logical image, with holes read as zeros.
    #[serde(with = "hex")]
    pub image_checksum: Vec<u8>,
    /// Empty for a fully sparse image.
    #[serde(rename = "range", default)]
    pub ranges: Vec<MappedRange>,
}

impl Bmap {
    /// Validate every structural invariant. This runs automatically when
    /// parsing; a document that fails any check is rejected, never repaired.
    pub fn validate(&self) -> Result<()> {
        if !self.version.is_supported() {
            return Err(Error::UnsupportedVersion(self.version));
        }

        if self.block_size == 0 {
            return Err(Error::InvalidBlockSize(self.block_size));
        }

        let expected_blocks = util::blocks_for(self.image_size, self.block_size);
        if self.blocks_count != expected_blocks {
            return Err(Error::TotalBlocksMismatch {
                image_size: self.image_size,
                expected: expected_blocks,
                actual: self.blocks_count,
            });
        }

        let digest_len = self.checksum_type.digest_len();
        let mut prev_end = None;
        let mut mapped_blocks = 0u64;

        for (index, mapped) in self.ranges.iter().enumerate() {
            let range = mapped.range;

            if range.start > range.end {
                return Err(Error::RangeReversed {
                    index,
                    start: range.start,
                    end: range.end,
                });
            }

            if let Some(prev_end) = prev_end
                && range.start <= prev_end
            {
                return Err(Error::RangeOutOfOrder {
                    index,
                    prev_end,
                    start: range.start,
                });
            }

            if range.end >= self.blocks_count {
                return Err(Error::RangeOutOfBounds {
                    index,
                    end: range.end,
                    total_blocks: self.blocks_count,
                });
            }

            if mapped.checksum.len() != digest_len {
                return Err(Error::RangeChecksumLength {
                    index,
                    algorithm: self.checksum_type,
                    expected: digest_len,
                    actual: mapped.checksum.len(),
                });
            }

            mapped_blocks += range.blocks();
            prev_end = Some(range.end);
        }

        if self.mapped_blocks_count != mapped_blocks {
            return Err(Error::MappedBlocksMismatch {
                expected: self.mapped_blocks_count,
                actual: mapped_blocks,
            });
        }

        if self.image_checksum.len() != digest_len {
            return Err(Error::ImageChecksumLength {
                algorithm: self.checksum_type,
                expected: digest_len,
                actual: self.image_checksum.len(),
            });
        }

        Ok(())
    }

    /// Serialize to the canonical document representation.
    pub fn to_document(&self) -> Result<String> {
        toml_edit::ser::to_string_pretty(self).map_err(Error::Serialize)
    }
}

impl FromStr for Bmap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bmap: Self = toml_edit::de::from_str(s).map_err(Error::Deserialize)?;
        bmap.validate()?;
        Ok(bmap)
    }
}

impl<R: Read> FromReader<R> for Bmap {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut document = String::new();
        reader
            .read_to_string(&mut document)
            .map_err(Error::DocumentRead)?;

        document.parse()
    }
}

impl<W: Write> ToWriter<W> for Bmap {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let document = self.to_document()?;
        writer
            .write_all(document.as_bytes())
            .map_err(Error::DocumentWrite)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn sample() -> Bmap {
        Bmap {
            version: FormatVersion::current(),
            image_size: 40960,
            block_size: 4096,
            blocks_count: 10,
            mapped_blocks_count: 5,
            checksum_type: ChecksumAlgorithm::Sha256,
            image_checksum: vec![0xaa; 32],
            ranges: vec![
                MappedRange {
                    range: BlockRange { start: 0, end: 2 },
                    checksum: vec![0xbb; 32],
                },
                MappedRange {
                    range: BlockRange { start: 5, end: 5 },
                    checksum: vec![0xcc; 32],
                },
                MappedRange {
                    range: BlockRange { start: 8, end: 8 },
                    checksum: vec![0xdd; 32],
                },
            ],
        }
    }

    #[test]
    fn round_trip() {
        let bmap = sample();
        let document = bmap.to_document().unwrap();
        let parsed: Bmap = document.parse().unwrap();

        assert_eq!(parsed, bmap);
        assert_eq!(parsed.to_document().unwrap(), document);
    }

    #[test]
    fn fully_sparse_document() {
        let mut bmap = sample();
        bmap.ranges.clear();
        bmap.mapped_blocks_count = 0;

        let document = bmap.to_document().unwrap();
        let parsed: Bmap = document.parse().unwrap();
        assert_eq!(parsed, bmap);
    }

    #[test]
    fn deterministic_serialization() {
        assert_eq!(
            sample().to_document().unwrap(),
            sample().to_document().unwrap(),
        );
    }

    #[test]
    fn range_rendering() {
        assert_eq!(BlockRange { start: 3, end: 7 }.to_string(), "3-7");
        assert_eq!(BlockRange { start: 4, end: 4 }.to_string(), "4");
        assert_eq!("3-7".parse::<BlockRange>().unwrap(), BlockRange {
            start: 3,
            end: 7
        });
        assert_eq!("4".parse::<BlockRange>().unwrap(), BlockRange {
            start: 4,
            end: 4
        });
        assert_matches!("4-".parse::<BlockRange>(), Err(Error::InvalidRange(_)));
    }

    #[test]
    fn version_gate() {
        let mut bmap = sample();
        bmap.version = FormatVersion(3, 0);
        assert_matches!(bmap.validate(), Err(Error::UnsupportedVersion(_)));

        // A newer minor version is fine.
        bmap.version = FormatVersion(2, 9);
        bmap.validate().unwrap();

        assert_matches!("2".parse::<FormatVersion>(), Err(Error::InvalidVersion(_)));
        assert_matches!(
            "a.b".parse::<FormatVersion>(),
            Err(Error::InvalidVersion(_))
        );
    }

    #[test]
    fn invariant_violations() {
        let mut bmap = sample();
        bmap.block_size = 0;
        assert_matches!(bmap.validate(), Err(Error::InvalidBlockSize(0)));

        let mut bmap = sample();
        bmap.blocks_count = 11;
        assert_matches!(bmap.validate(), Err(Error::TotalBlocksMismatch { .. }));

        let mut bmap = sample();
        bmap.ranges[1].range = BlockRange { start: 6, end: 5 };
        assert_matches!(bmap.validate(), Err(Error::RangeReversed { index: 1, .. }));

        let mut bmap = sample();
        bmap.ranges[1].range = BlockRange { start: 2, end: 5 };
        assert_matches!(
            bmap.validate(),
            Err(Error::RangeOutOfOrder { index: 1, .. })
        );

        let mut bmap = sample();
        bmap.ranges[2].range = BlockRange { start: 8, end: 10 };
        assert_matches!(
            bmap.validate(),
            Err(Error::RangeOutOfBounds { index: 2, .. })
        );

        let mut bmap = sample();
        bmap.ranges[0].checksum.pop();
        assert_matches!(
            bmap.validate(),
            Err(Error::RangeChecksumLength { index: 0, .. })
        );

        let mut bmap = sample();
        bmap.mapped_blocks_count = 6;
        assert_matches!(bmap.validate(), Err(Error::MappedBlocksMismatch { .. }));

        let mut bmap = sample();
        bmap.image_checksum = vec![0xaa; 64];
        assert_matches!(bmap.validate(), Err(Error::ImageChecksumLength { .. }));
    }

    #[test]
    fn malformed_checksum_encoding() {
        let document = sample().to_document().unwrap();
        let corrupted = document.replacen("aaaa", "zzzz", 1);
        assert_matches!(corrupted.parse::<Bmap>(), Err(Error::Deserialize(_)));
    }
}
