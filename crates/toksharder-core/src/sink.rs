//! Shard file output: dense u16 arrays written via tmp file then rename

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use npyz::WriterBuilder;
use serde::Deserialize;

/// On-disk encoding of a shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardFormat {
    /// NumPy `.npy`, dtype `<u2`, 1-D
    #[default]
    Npy,
    /// Headerless little-endian u16
    Bin,
}

impl ShardFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Npy => "npy",
            Self::Bin => "bin",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "npy" => Some(Self::Npy),
            "bin" => Some(Self::Bin),
            _ => None,
        }
    }
}

impl std::str::FromStr for ShardFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(&s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown shard format '{s}' (expected npy or bin)"))
    }
}

impl std::fmt::Display for ShardFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// `shard_00042.npy`
pub fn shard_filename(index: usize, format: ShardFormat) -> String {
    format!("shard_{index:05}.{}", format.extension())
}

/// Parse the index out of a shard filename, if it is one.
pub fn parse_shard_filename(name: &str) -> Option<(usize, ShardFormat)> {
    let (stem, ext) = name.rsplit_once('.')?;
    let format = ShardFormat::from_extension(ext)?;
    let digits = stem.strip_prefix("shard_")?;
    if digits.len() < 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, format))
}

/// Destination for finished shards.
///
/// `write_shard` must either leave a complete file at its final path or
/// return an error with nothing visible at that path.
pub trait ShardSink {
    fn write_shard(&mut self, index: usize, tokens: &[u16]) -> io::Result<PathBuf>;
}

impl<S: ShardSink + ?Sized> ShardSink for &mut S {
    fn write_shard(&mut self, index: usize, tokens: &[u16]) -> io::Result<PathBuf> {
        (**self).write_shard(index, tokens)
    }
}

/// Writes shard files into one output directory
#[derive(Debug)]
pub struct ShardWriter {
    output_dir: PathBuf,
    format: ShardFormat,
}

impl ShardWriter {
    pub fn new(output_dir: impl Into<PathBuf>, format: ShardFormat) -> Self {
        Self {
            output_dir: output_dir.into(),
            format,
        }
    }

    fn write_tmp(&self, tmp_path: &Path, tokens: &[u16]) -> io::Result<()> {
        let file = File::create(tmp_path)?;
        let mut out = BufWriter::new(file);
        match self.format {
            ShardFormat::Npy => {
                let mut writer: npyz::NpyWriter<u16, _> = npyz::WriteOptions::new()
                    .default_dtype()
                    .shape(&[tokens.len() as u64])
                    .writer(&mut out)
                    .begin_nd()?;
                writer.extend(tokens.iter().copied())?;
                writer.finish()?;
            }
            ShardFormat::Bin => {
                for token in tokens {
                    out.write_all(&token.to_le_bytes())?;
                }
            }
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

impl ShardSink for ShardWriter {
    fn write_shard(&mut self, index: usize, tokens: &[u16]) -> io::Result<PathBuf> {
        let filename = shard_filename(index, self.format);
        let final_path = self.output_dir.join(&filename);
        let tmp_path = self.output_dir.join(format!("{filename}.tmp"));

        let written = self
            .write_tmp(&tmp_path, tokens)
            .and_then(|()| fs::rename(&tmp_path, &final_path));
        if let Err(e) = written {
            // Never leave a truncated shard behind
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        Ok(final_path)
    }
}

/// Read a shard file back as token IDs; format taken from the extension.
pub fn read_shard(path: &Path) -> io::Result<Vec<u16>> {
    let format = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ShardFormat::from_extension)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a shard file: {}", path.display()),
            )
        })?;
    let mut reader = BufReader::new(File::open(path)?);
    match format {
        ShardFormat::Npy => npyz::NpyFile::new(reader)?.into_vec::<u16>(),
        ShardFormat::Bin => {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            if bytes.len() % 2 != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("odd byte length in {}", path.display()),
                ));
            }
            Ok(bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect())
        }
    }
}

/// Shard files in a directory, sorted by index
pub fn list_shards(output_dir: &Path) -> io::Result<Vec<(usize, PathBuf)>> {
    let mut shards = Vec::new();
    for entry in fs::read_dir(output_dir)? {
        let path = entry?.path();
        let parsed = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_shard_filename);
        if let Some((index, _)) = parsed {
            shards.push((index, path));
        }
    }
    shards.sort_by_key(|(index, _)| *index);
    Ok(shards)
}

/// Remove stale .tmp files in the output directory
pub fn cleanup_tmp_files(output_dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(output_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            log::warn!("Removing stale tmp file: {}", path.display());
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
